//! Payment reminder and escalation engine.
//!
//! Reminders fire at configured day offsets around the due date. Each
//! `(obligation, offset)` is claimed in the ledger before sending, so repeated
//! or concurrent runs deliver at most once.

use super::{call, JobBudget, JobRunTracker, UnitTally};
use crate::config::BillingJobsConfig;
use crate::error::{obligation_scope, JobError, UnitError};
use crate::models::{
    Company, DeliveryStatus, Escalation, JobKind, JobRunStatus, Obligation, ObligationState,
    ReminderClaim,
};
use crate::services::metrics::record_reminder;
use crate::services::notifier::PAYMENT_REMINDER_TEMPLATE;
use crate::services::{Notifier, Store};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSummary {
    pub run_id: Option<Uuid>,
    pub status: JobRunStatus,
    pub sent: u32,
    pub skipped: u32,
    pub marked_overdue: u32,
    pub errors: Vec<UnitError>,
    pub partial: bool,
}

#[derive(Default)]
struct ObligationOutcome {
    sent: u32,
    skipped: u32,
    marked_overdue: bool,
    send_errors: Vec<UnitError>,
}

/// Whole days elapsed since `due`, rounded down (negative before the due date).
pub fn elapsed_days(now: DateTime<Utc>, due: DateTime<Utc>) -> i64 {
    (now - due).num_seconds().div_euclid(86_400)
}

/// Escalation of the reminder scheduled `offset_days` after the due date. A
/// reminder fired early inside the tolerance keeps its scheduled level.
pub fn escalation_for_offset(offset_days: i32) -> Escalation {
    Escalation::from_elapsed_days(i64::from(offset_days))
}

/// Offsets whose fire time lies within `tolerance_hours` of `now`.
pub fn offsets_due(
    now: DateTime<Utc>,
    due: DateTime<Utc>,
    offsets_days: &[i32],
    tolerance_hours: i64,
) -> Vec<i32> {
    let from_due = now - due;
    let tolerance = chrono::Duration::hours(tolerance_hours);
    let mut due_now: Vec<i32> = offsets_days
        .iter()
        .copied()
        .filter(|offset| (from_due - chrono::Duration::days(*offset as i64)).abs() <= tolerance)
        .collect();
    due_now.sort_unstable();
    due_now.dedup();
    due_now
}

pub struct ReminderEngine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    budget: Duration,
    call_timeout: Duration,
    offsets_days: Vec<i32>,
    tolerance_hours: i64,
}

impl ReminderEngine {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        config: &BillingJobsConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            budget: Duration::from_secs(config.cron.reminder_budget_secs),
            call_timeout: config.cron.call_timeout(),
            offsets_days: config.reminders.offsets_days.clone(),
            tolerance_hours: config.reminders.tolerance_hours,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn process_reminders(&self, now: DateTime<Utc>) -> Result<ReminderSummary, AppError> {
        let tracker = JobRunTracker::start(self.store.clone(), JobKind::Reminders).await?;
        let budget = JobBudget::new(self.budget);
        let mut tally = UnitTally::default();
        let mut summary = ReminderSummary {
            run_id: Some(tracker.run_id()),
            ..Default::default()
        };

        match call(self.call_timeout, "list obligations", self.store.list_open_obligations()).await {
            Ok(obligations) => {
                let mut companies: HashMap<Uuid, Option<Company>> = HashMap::new();
                for obligation in obligations {
                    if budget.exhausted() {
                        tracing::warn!("Reminder budget exhausted, stopping before next obligation");
                        summary.partial = true;
                        break;
                    }

                    let scope = obligation_scope(obligation.obligation_id);
                    let company = match self.company(&mut companies, obligation.company_id).await {
                        Ok(company) => company,
                        Err(e) => {
                            tally.failure(JobKind::Reminders, e.unit(scope));
                            continue;
                        }
                    };

                    match self.process_obligation(&obligation, &company, now).await {
                        Ok(outcome) => {
                            summary.sent += outcome.sent;
                            summary.skipped += outcome.skipped;
                            if outcome.marked_overdue {
                                summary.marked_overdue += 1;
                            }
                            tally.settle_unit(JobKind::Reminders, outcome.send_errors);
                        }
                        Err(e) => tally.failure(JobKind::Reminders, e.unit(scope)),
                    }
                }
            }
            Err(e) => tally.failure(JobKind::Reminders, e.unit("job")),
        }

        summary.errors = tally.errors.clone();
        summary.status = tracker.finish(&tally, summary.partial, &summary).await;
        Ok(summary)
    }

    async fn company(
        &self,
        cache: &mut HashMap<Uuid, Option<Company>>,
        company_id: Uuid,
    ) -> Result<Company, JobError> {
        if !cache.contains_key(&company_id) {
            let company =
                call(self.call_timeout, "read company", self.store.get_company(company_id)).await?;
            cache.insert(company_id, company);
        }
        cache
            .get(&company_id)
            .cloned()
            .flatten()
            .ok_or_else(|| JobError::Validation(format!("company {} not found", company_id)))
    }

    #[tracing::instrument(skip(self, obligation, company), fields(obligation_id = %obligation.obligation_id))]
    async fn process_obligation(
        &self,
        obligation: &Obligation,
        company: &Company,
        now: DateTime<Utc>,
    ) -> Result<ObligationOutcome, JobError> {
        let mut outcome = ObligationOutcome::default();

        if now > obligation.due_utc && obligation.state() != ObligationState::Overdue {
            outcome.marked_overdue = call(
                self.call_timeout,
                "mark overdue",
                self.store.mark_overdue(obligation.obligation_id),
            )
            .await?;
            if outcome.marked_overdue {
                tracing::info!(reference = ?obligation.reference, "Obligation is overdue");
            }
        }

        for offset_days in offsets_due(now, obligation.due_utc, &self.offsets_days, self.tolerance_hours)
        {
            let escalation = escalation_for_offset(offset_days);
            let claim = ReminderClaim {
                obligation_id: obligation.obligation_id,
                offset_days,
                escalation,
            };
            let claimed =
                call(self.call_timeout, "claim reminder", self.store.claim_reminder(&claim)).await?;
            if !claimed {
                outcome.skipped += 1;
                continue;
            }

            let data = json!({
                "company": company.name,
                "reference": obligation.reference,
                "amount": obligation.outstanding(),
                "currency": obligation.currency,
                "due_date": obligation.due_utc.date_naive(),
                "offset_days": offset_days,
                "escalation": escalation.as_str(),
            });
            let sent = call(
                self.call_timeout,
                "notifier",
                self.notifier
                    .send(&company.billing_email, PAYMENT_REMINDER_TEMPLATE, &data),
            )
            .await;

            match sent {
                Ok(_) => {
                    record_reminder(escalation.as_str(), DeliveryStatus::Sent.as_str());
                    outcome.sent += 1;
                }
                Err(e) => {
                    record_reminder(escalation.as_str(), DeliveryStatus::Failed.as_str());
                    let message = e.to_string();
                    if let Err(store_err) = self
                        .store
                        .mark_reminder_failed(obligation.obligation_id, offset_days, &message)
                        .await
                    {
                        tracing::error!(error = %store_err, "Failed to record reminder failure");
                    }
                    outcome
                        .send_errors
                        .push(e.unit(obligation_scope(obligation.obligation_id)));
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, d, h, 0, 0).unwrap()
    }

    #[test]
    fn offsets_fire_inside_tolerance() {
        let due = at(10, 0);
        let offsets = [-3, 0, 7];
        assert_eq!(offsets_due(at(7, 0), due, &offsets, 12), vec![-3]);
        assert_eq!(offsets_due(at(7, 11), due, &offsets, 12), vec![-3]);
        assert_eq!(offsets_due(at(10, 6), due, &offsets, 12), vec![0]);
        assert_eq!(offsets_due(at(17, 0), due, &offsets, 12), vec![7]);
        assert!(offsets_due(at(8, 13), due, &offsets, 12).is_empty());
        assert!(offsets_due(at(13, 0), due, &offsets, 12).is_empty());
    }

    #[test]
    fn elapsed_days_round_down() {
        let due = at(10, 0);
        assert_eq!(elapsed_days(at(7, 0), due), -3);
        assert_eq!(elapsed_days(at(9, 18), due), -1);
        assert_eq!(elapsed_days(at(10, 6), due), 0);
        assert_eq!(elapsed_days(at(17, 0), due), 7);
    }

    #[test]
    fn escalation_follows_fired_offset() {
        let due = at(10, 0);
        let offsets = [-3, 0, 7];
        let fired = |now: DateTime<Utc>| -> Vec<Escalation> {
            offsets_due(now, due, &offsets, 12)
                .into_iter()
                .map(escalation_for_offset)
                .collect()
        };
        assert_eq!(fired(at(7, 0)), vec![Escalation::Upcoming]);
        assert_eq!(fired(at(9, 18)), vec![Escalation::Medium]);
        assert_eq!(fired(at(10, 6)), vec![Escalation::Medium]);
        assert_eq!(fired(at(16, 18)), vec![Escalation::High]);
    }
}
