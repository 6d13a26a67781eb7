//! Usage and overage engine.
//!
//! For every active company: derive the billing period that closed on or
//! before the requested date, price consumption beyond the plan allotment and
//! create at most one overage invoice per `(company, period_start)`.

use super::{call, JobBudget, JobRunTracker, UnitTally};
use crate::config::BillingJobsConfig;
use crate::error::{company_scope, JobError, UnitError};
use crate::models::{
    BillingPeriod, Company, InvoiceLine, JobKind, JobRunStatus, NewOverageInvoice, OverageRate,
    UsageLimit, UsageSnapshot,
};
use crate::services::metrics::record_invoice_created;
use crate::services::notifier::USAGE_ALERT_TEMPLATE;
use crate::services::{Notifier, Store};
use chrono::{Months, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverageSummary {
    pub run_id: Option<Uuid>,
    pub status: JobRunStatus,
    pub invoices_created: u32,
    pub invoices_skipped: u32,
    pub total_amount: Decimal,
    pub alerts_sent: u32,
    pub errors: Vec<UnitError>,
    pub partial: bool,
}

enum InvoiceResult {
    Created(Decimal),
    Skipped,
    NothingOwed,
}

struct CompanyOutcome {
    invoice: InvoiceResult,
    alerts_sent: u32,
    alert_errors: Vec<UnitError>,
}

/// Price every metered resource over its allotment.
///
/// Resources with an allotment are metered; a resource with a rate but no
/// allotment is charged from the first unit. Lines are sorted by resource.
pub fn price_overages(
    limits: &[UsageLimit],
    rates: &[OverageRate],
    snapshot: &UsageSnapshot,
) -> Result<Vec<InvoiceLine>, JobError> {
    let mut resources: Vec<(&str, Decimal)> = limits
        .iter()
        .map(|l| (l.resource.as_str(), l.included_units))
        .collect();
    for rate in rates {
        if !limits.iter().any(|l| l.resource == rate.resource) {
            resources.push((rate.resource.as_str(), Decimal::ZERO));
        }
    }
    resources.sort_by(|a, b| a.0.cmp(b.0));

    let mut lines = Vec::new();
    for (resource, included) in resources {
        let consumed = snapshot.consumed(resource);
        let overage = consumed - included;
        if overage <= Decimal::ZERO {
            continue;
        }
        let unit_price = rates
            .iter()
            .find(|r| r.resource == resource)
            .map(|r| r.unit_price)
            .ok_or_else(|| {
                JobError::Configuration(format!(
                    "no overage rate for resource '{}' ({} units over allotment)",
                    resource, overage
                ))
            })?;
        let amount = (overage * unit_price)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        if amount > Decimal::ZERO {
            lines.push(InvoiceLine {
                resource: resource.to_string(),
                included_units: included,
                consumed_units: consumed,
                overage_units: overage,
                unit_price,
                amount,
            });
        }
    }
    Ok(lines)
}

/// Thresholds (percent of allotment) that `consumed` has reached.
pub fn crossed_thresholds(included: Decimal, consumed: Decimal, thresholds: &[u32]) -> Vec<u32> {
    if included <= Decimal::ZERO {
        return Vec::new();
    }
    let used_pct = consumed * Decimal::from(100) / included;
    let mut crossed: Vec<u32> = thresholds
        .iter()
        .copied()
        .filter(|t| used_pct >= Decimal::from(*t))
        .collect();
    crossed.sort_unstable();
    crossed.dedup();
    crossed
}

pub struct OverageEngine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    budget: Duration,
    call_timeout: Duration,
    payment_terms_days: i64,
    alert_thresholds_pct: Vec<u32>,
}

impl OverageEngine {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        config: &BillingJobsConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            budget: Duration::from_secs(config.cron.overage_budget_secs),
            call_timeout: config.cron.call_timeout(),
            payment_terms_days: config.usage.payment_terms_days,
            alert_thresholds_pct: config.usage.alert_thresholds_pct.clone(),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn process_overages(&self, as_of: NaiveDate) -> Result<OverageSummary, AppError> {
        let tracker = JobRunTracker::start(self.store.clone(), JobKind::Overages).await?;
        let budget = JobBudget::new(self.budget);
        let mut tally = UnitTally::default();
        let mut summary = OverageSummary {
            run_id: Some(tracker.run_id()),
            ..Default::default()
        };

        match call(self.call_timeout, "list companies", self.store.list_active_companies()).await {
            Ok(companies) => {
                for company in companies {
                    if budget.exhausted() {
                        tracing::warn!(
                            elapsed_ms = budget.elapsed().as_millis() as u64,
                            "Overage budget exhausted, stopping before next company"
                        );
                        summary.partial = true;
                        break;
                    }

                    match self.process_company(&company, as_of).await {
                        Ok(outcome) => {
                            tally.success();
                            match outcome.invoice {
                                InvoiceResult::Created(amount) => {
                                    summary.invoices_created += 1;
                                    summary.total_amount += amount;
                                }
                                InvoiceResult::Skipped => summary.invoices_skipped += 1,
                                InvoiceResult::NothingOwed => {}
                            }
                            summary.alerts_sent += outcome.alerts_sent;
                            for error in outcome.alert_errors {
                                tally.note(JobKind::Overages, error);
                            }
                        }
                        Err(e) => {
                            tally.failure(JobKind::Overages, e.unit(company_scope(company.company_id)))
                        }
                    }
                }
            }
            Err(e) => tally.failure(JobKind::Overages, e.unit("job")),
        }

        summary.errors = tally.errors.clone();
        summary.status = tracker.finish(&tally, summary.partial, &summary).await;
        Ok(summary)
    }

    #[tracing::instrument(skip(self, company), fields(company_id = %company.company_id))]
    async fn process_company(
        &self,
        company: &Company,
        as_of: NaiveDate,
    ) -> Result<CompanyOutcome, JobError> {
        let period = BillingPeriod::closed_on_or_before(company.billing_anchor_day, as_of)
            .ok_or_else(|| {
                JobError::Validation(format!(
                    "cannot derive billing period for anchor day {}",
                    company.billing_anchor_day
                ))
            })?;

        let limits = call(self.call_timeout, "read allotments", self.store.usage_limits(&company.plan_code)).await?;
        let rates = call(self.call_timeout, "read rates", self.store.overage_rates(&company.plan_code)).await?;
        let snapshot = call(
            self.call_timeout,
            "read usage",
            self.store.usage_for_period(company.company_id, period),
        )
        .await?;

        let lines = price_overages(&limits, &rates, &snapshot)?;
        let total: Decimal = lines.iter().map(|l| l.amount).sum();

        let invoice = if total > Decimal::ZERO {
            let input = NewOverageInvoice {
                company_id: company.company_id,
                period_start: period.start,
                period_end: period.end,
                currency: company.currency.clone(),
                total_amount: total,
                lines,
                due_utc: period.end_utc() + chrono::Duration::days(self.payment_terms_days),
            };
            match call(self.call_timeout, "create invoice", self.store.create_overage_invoice(&input)).await? {
                Some(created) => {
                    record_invoice_created(&created.currency);
                    tracing::info!(
                        invoice_id = %created.invoice_id,
                        reference = %created.reference(),
                        period_start = %period.start,
                        total = %created.total_amount,
                        "Overage invoice created"
                    );
                    InvoiceResult::Created(created.total_amount)
                }
                None => {
                    tracing::debug!(period_start = %period.start, "Overage invoice already exists");
                    InvoiceResult::Skipped
                }
            }
        } else {
            InvoiceResult::NothingOwed
        };

        let (alerts_sent, alert_errors) = self.send_usage_alerts(company, period, &limits).await;

        Ok(CompanyOutcome {
            invoice,
            alerts_sent,
            alert_errors,
        })
    }

    /// Alerts for the period that follows the invoiced one, i.e. the open one.
    async fn send_usage_alerts(
        &self,
        company: &Company,
        closed: BillingPeriod,
        limits: &[UsageLimit],
    ) -> (u32, Vec<UnitError>) {
        let mut sent = 0;
        let mut errors = Vec::new();
        if self.alert_thresholds_pct.is_empty() || limits.is_empty() {
            return (sent, errors);
        }
        let Some(open_end) = closed.end.checked_add_months(Months::new(1)) else {
            return (sent, errors);
        };
        let open = BillingPeriod {
            start: closed.end,
            end: open_end,
        };
        let scope = company_scope(company.company_id);

        let snapshot = match call(
            self.call_timeout,
            "read usage",
            self.store.usage_for_period(company.company_id, open),
        )
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                errors.push(e.unit(scope));
                return (sent, errors);
            }
        };

        for limit in limits {
            let consumed = snapshot.consumed(&limit.resource);
            for threshold in
                crossed_thresholds(limit.included_units, consumed, &self.alert_thresholds_pct)
            {
                let claimed = call(
                    self.call_timeout,
                    "claim usage alert",
                    self.store.claim_usage_alert(
                        company.company_id,
                        open.start,
                        &limit.resource,
                        threshold as i32,
                    ),
                )
                .await;
                match claimed {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        errors.push(e.unit(scope.clone()));
                        continue;
                    }
                }

                let data = json!({
                    "company": company.name,
                    "resource": limit.resource,
                    "threshold_pct": threshold,
                    "consumed": consumed,
                    "included": limit.included_units,
                    "period_start": open.start,
                    "period_end": open.end,
                });
                match call(
                    self.call_timeout,
                    "notifier",
                    self.notifier
                        .send(&company.billing_email, USAGE_ALERT_TEMPLATE, &data),
                )
                .await
                {
                    Ok(_) => sent += 1,
                    Err(e) => errors.push(e.unit(scope.clone())),
                }
            }
        }
        (sent, errors)
    }
}
