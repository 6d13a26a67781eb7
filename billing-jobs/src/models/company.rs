//! Company, plan allotment and usage snapshot models.

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A tenant company. Deactivated companies keep their rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Company {
    pub company_id: Uuid,
    pub name: String,
    pub billing_email: String,
    pub plan_code: String,
    pub currency: String,
    pub billing_anchor_day: i32,
    pub is_active: bool,
    pub bank_provider: Option<String>,
    pub accounting_provider: Option<String>,
    pub accounting_customer_id: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Company {
    /// A new active company without gateway links.
    pub fn new(
        name: &str,
        billing_email: &str,
        plan_code: &str,
        currency: &str,
        billing_anchor_day: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            company_id: Uuid::new_v4(),
            name: name.to_string(),
            billing_email: billing_email.to_string(),
            plan_code: plan_code.to_string(),
            currency: currency.to_string(),
            billing_anchor_day,
            is_active: true,
            bank_provider: None,
            accounting_provider: None,
            accounting_customer_id: None,
            created_utc: now,
            updated_utc: now,
        }
    }
}

/// Included units of a metered resource for a plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageLimit {
    pub plan_code: String,
    pub resource: String,
    pub included_units: Decimal,
}

/// Price per unit consumed beyond the allotment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OverageRate {
    pub plan_code: String,
    pub resource: String,
    pub unit_price: Decimal,
}

/// Aggregated consumption of one resource inside a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ResourceUsage {
    pub resource: String,
    pub consumed: Decimal,
}

/// Half-open billing period `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl BillingPeriod {
    /// The most recent period that closed on or before `as_of` for a company
    /// whose cycle renews on `anchor_day`.
    ///
    /// Anchor days are clamped to 1..=28 so every month has one.
    pub fn closed_on_or_before(anchor_day: i32, as_of: NaiveDate) -> Option<Self> {
        let anchor = anchor_day.clamp(1, 28) as u32;

        let this_month = NaiveDate::from_ymd_opt(as_of.year(), as_of.month(), anchor)?;
        let end = if as_of.day() >= anchor {
            this_month
        } else {
            this_month.checked_sub_months(Months::new(1))?
        };
        let start = end.checked_sub_months(Months::new(1))?;

        Some(Self { start, end })
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.start.and_time(chrono::NaiveTime::MIN).and_utc()
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        self.end.and_time(chrono::NaiveTime::MIN).and_utc()
    }
}

/// Per-company, per-period consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub company_id: Uuid,
    pub period: BillingPeriod,
    pub resources: Vec<ResourceUsage>,
}

impl UsageSnapshot {
    pub fn consumed(&self, resource: &str) -> Decimal {
        self.resources
            .iter()
            .filter(|r| r.resource == resource)
            .map(|r| r.consumed)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn period_closes_on_anchor_day() {
        let period = BillingPeriod::closed_on_or_before(1, date(2025, 2, 1)).unwrap();
        assert_eq!(period.start, date(2025, 1, 1));
        assert_eq!(period.end, date(2025, 2, 1));
    }

    #[test]
    fn period_before_anchor_uses_previous_month() {
        let period = BillingPeriod::closed_on_or_before(15, date(2025, 3, 10)).unwrap();
        assert_eq!(period.start, date(2025, 1, 15));
        assert_eq!(period.end, date(2025, 2, 15));
    }

    #[test]
    fn period_spans_year_boundary() {
        let period = BillingPeriod::closed_on_or_before(5, date(2025, 1, 20)).unwrap();
        assert_eq!(period.start, date(2024, 12, 5));
        assert_eq!(period.end, date(2025, 1, 5));
    }

    #[test]
    fn anchor_is_clamped() {
        let period = BillingPeriod::closed_on_or_before(31, date(2025, 3, 30)).unwrap();
        assert_eq!(period.end, date(2025, 3, 28));
        let period = BillingPeriod::closed_on_or_before(0, date(2025, 3, 30)).unwrap();
        assert_eq!(period.end, date(2025, 3, 1));
    }
}
