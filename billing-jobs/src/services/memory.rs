//! In-memory store with the same unique-key semantics as PostgreSQL.
//!
//! Used by integration tests and by local runs without `database.url`.

use crate::error::UnitError;
use crate::models::{
    invoice_reference, BillingPeriod, Company, DeliveryStatus, ExternalTransaction,
    JobKind, JobRun, JobRunDetail, JobRunError, JobRunStatus, JobRunUpdate, ListExceptionsFilter,
    MatchOutcome, MatchSet, NewException, NewOverageInvoice, Obligation, ObligationEvent,
    ObligationKind, ObligationState, OverageInvoice, OverageRate, ReconciliationException,
    ReminderClaim, ResourceUsage, Transition, UsageLimit, UsageSnapshot, WebhookCommand,
    WebhookOutcome,
};
use crate::services::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::types::Json;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

type TransactionKey = (Uuid, String, String);

/// A stored reminder ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct ReminderRecord {
    pub obligation_id: Uuid,
    pub offset_days: i32,
    pub escalation: String,
    pub delivery_status: DeliveryStatus,
    pub detail: Option<String>,
}

/// A stored reconciliation match.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub obligation_id: Uuid,
    pub external_id: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
struct UsageRow {
    company_id: Uuid,
    resource: String,
    quantity: Decimal,
    recorded_utc: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    companies: BTreeMap<Uuid, Company>,
    limits: Vec<UsageLimit>,
    rates: Vec<OverageRate>,
    usage: Vec<UsageRow>,
    obligations: HashMap<Uuid, Obligation>,
    invoices: BTreeMap<Uuid, OverageInvoice>,
    usage_alerts: HashSet<(Uuid, NaiveDate, String, i32)>,
    reminders: BTreeMap<(Uuid, i32), ReminderRecord>,
    transactions: BTreeMap<TransactionKey, ExternalTransaction>,
    matches: BTreeMap<TransactionKey, MatchRecord>,
    exceptions: Vec<ReconciliationException>,
    webhook_events: HashMap<String, String>,
    job_runs: HashMap<Uuid, JobRun>,
    job_run_errors: Vec<JobRunError>,
}

impl Inner {
    fn write_state(
        &mut self,
        obligation_id: Uuid,
        state: ObligationState,
        matched_delta: Decimal,
        reset_matched: bool,
    ) {
        if let Some(obligation) = self.obligations.get_mut(&obligation_id) {
            let now = Utc::now();
            obligation.state = state.as_str().to_string();
            obligation.amount_matched = if reset_matched {
                Decimal::ZERO
            } else {
                obligation.amount_matched + matched_delta
            };
            match state {
                ObligationState::Settled => obligation.settled_utc = Some(now),
                ObligationState::Pending => obligation.settled_utc = None,
                _ => {}
            }
            obligation.updated_utc = now;
        }
    }

    fn is_open(&self, obligation: &Obligation) -> bool {
        obligation.state().is_open()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_company(&self, company: Company) {
        self.inner
            .write()
            .await
            .companies
            .insert(company.company_id, company);
    }

    pub async fn set_usage_limit(&self, plan_code: &str, resource: &str, included_units: Decimal) {
        let mut inner = self.inner.write().await;
        inner
            .limits
            .retain(|l| !(l.plan_code == plan_code && l.resource == resource));
        inner.limits.push(UsageLimit {
            plan_code: plan_code.to_string(),
            resource: resource.to_string(),
            included_units,
        });
    }

    pub async fn set_overage_rate(&self, plan_code: &str, resource: &str, unit_price: Decimal) {
        let mut inner = self.inner.write().await;
        inner
            .rates
            .retain(|r| !(r.plan_code == plan_code && r.resource == resource));
        inner.rates.push(OverageRate {
            plan_code: plan_code.to_string(),
            resource: resource.to_string(),
            unit_price,
        });
    }

    pub async fn record_usage(
        &self,
        company_id: Uuid,
        resource: &str,
        quantity: Decimal,
        recorded_utc: DateTime<Utc>,
    ) {
        self.inner.write().await.usage.push(UsageRow {
            company_id,
            resource: resource.to_string(),
            quantity,
            recorded_utc,
        });
    }

    pub async fn insert_obligation(&self, obligation: Obligation) {
        self.inner
            .write()
            .await
            .obligations
            .insert(obligation.obligation_id, obligation);
    }

    pub async fn invoices_for(&self, company_id: Uuid) -> Vec<OverageInvoice> {
        self.inner
            .read()
            .await
            .invoices
            .values()
            .filter(|i| i.company_id == company_id)
            .cloned()
            .collect()
    }

    pub async fn reminder_records(&self, obligation_id: Uuid) -> Vec<ReminderRecord> {
        self.inner
            .read()
            .await
            .reminders
            .values()
            .filter(|r| r.obligation_id == obligation_id)
            .cloned()
            .collect()
    }

    pub async fn matches_for(&self, obligation_id: Uuid) -> Vec<MatchRecord> {
        self.inner
            .read()
            .await
            .matches
            .values()
            .filter(|m| m.obligation_id == obligation_id)
            .cloned()
            .collect()
    }

    pub async fn all_matches(&self) -> Vec<MatchRecord> {
        self.inner.read().await.matches.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn list_active_companies(&self) -> Result<Vec<Company>, AppError> {
        Ok(self
            .inner
            .read()
            .await
            .companies
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect())
    }

    async fn get_company(&self, company_id: Uuid) -> Result<Option<Company>, AppError> {
        Ok(self.inner.read().await.companies.get(&company_id).cloned())
    }

    async fn usage_limits(&self, plan_code: &str) -> Result<Vec<UsageLimit>, AppError> {
        let inner = self.inner.read().await;
        let mut limits: Vec<_> = inner
            .limits
            .iter()
            .filter(|l| l.plan_code == plan_code)
            .cloned()
            .collect();
        limits.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(limits)
    }

    async fn overage_rates(&self, plan_code: &str) -> Result<Vec<OverageRate>, AppError> {
        let inner = self.inner.read().await;
        let mut rates: Vec<_> = inner
            .rates
            .iter()
            .filter(|r| r.plan_code == plan_code)
            .cloned()
            .collect();
        rates.sort_by(|a, b| a.resource.cmp(&b.resource));
        Ok(rates)
    }

    async fn usage_for_period(
        &self,
        company_id: Uuid,
        period: BillingPeriod,
    ) -> Result<UsageSnapshot, AppError> {
        let inner = self.inner.read().await;
        let (from, to) = (period.start_utc(), period.end_utc());
        let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
        for row in inner.usage.iter().filter(|u| {
            u.company_id == company_id && u.recorded_utc >= from && u.recorded_utc < to
        }) {
            *totals.entry(row.resource.clone()).or_default() += row.quantity;
        }
        Ok(UsageSnapshot {
            company_id,
            period,
            resources: totals
                .into_iter()
                .map(|(resource, consumed)| ResourceUsage { resource, consumed })
                .collect(),
        })
    }

    async fn create_overage_invoice(
        &self,
        input: &NewOverageInvoice,
    ) -> Result<Option<OverageInvoice>, AppError> {
        let mut inner = self.inner.write().await;
        if inner
            .invoices
            .values()
            .any(|i| i.company_id == input.company_id && i.period_start == input.period_start)
        {
            return Ok(None);
        }

        let now = Utc::now();
        let invoice_id = Uuid::new_v4();
        let obligation_id = Uuid::new_v4();
        inner.obligations.insert(
            obligation_id,
            Obligation {
                obligation_id,
                company_id: input.company_id,
                kind: ObligationKind::OverageInvoice.as_str().to_string(),
                reference: Some(invoice_reference(invoice_id)),
                amount: input.total_amount,
                amount_matched: Decimal::ZERO,
                currency: input.currency.clone(),
                due_utc: input.due_utc,
                state: ObligationState::Pending.as_str().to_string(),
                settled_utc: None,
                created_utc: now,
                updated_utc: now,
            },
        );
        let invoice = OverageInvoice {
            invoice_id,
            company_id: input.company_id,
            period_start: input.period_start,
            period_end: input.period_end,
            obligation_id,
            currency: input.currency.clone(),
            total_amount: input.total_amount,
            lines: Json(input.lines.clone()),
            external_id: None,
            created_utc: now,
            updated_utc: now,
        };
        inner.invoices.insert(invoice_id, invoice.clone());
        Ok(Some(invoice))
    }

    async fn claim_usage_alert(
        &self,
        company_id: Uuid,
        period_start: NaiveDate,
        resource: &str,
        threshold_pct: i32,
    ) -> Result<bool, AppError> {
        Ok(self.inner.write().await.usage_alerts.insert((
            company_id,
            period_start,
            resource.to_string(),
            threshold_pct,
        )))
    }

    async fn get_obligation(&self, obligation_id: Uuid) -> Result<Option<Obligation>, AppError> {
        Ok(self.inner.read().await.obligations.get(&obligation_id).cloned())
    }

    async fn list_open_obligations(&self) -> Result<Vec<Obligation>, AppError> {
        let inner = self.inner.read().await;
        let mut open: Vec<_> = inner
            .obligations
            .values()
            .filter(|o| inner.is_open(o))
            .filter(|o| {
                inner
                    .companies
                    .get(&o.company_id)
                    .map(|c| c.is_active)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        open.sort_by(|a, b| {
            a.due_utc
                .cmp(&b.due_utc)
                .then(a.obligation_id.cmp(&b.obligation_id))
        });
        Ok(open)
    }

    async fn list_open_obligations_for_company(
        &self,
        company_id: Uuid,
        due_from: DateTime<Utc>,
        due_to: DateTime<Utc>,
    ) -> Result<Vec<Obligation>, AppError> {
        let inner = self.inner.read().await;
        let mut open: Vec<_> = inner
            .obligations
            .values()
            .filter(|o| o.company_id == company_id && inner.is_open(o))
            .filter(|o| o.due_utc >= due_from && o.due_utc <= due_to)
            .cloned()
            .collect();
        open.sort_by(|a, b| {
            a.due_utc
                .cmp(&b.due_utc)
                .then(a.obligation_id.cmp(&b.obligation_id))
        });
        Ok(open)
    }

    async fn mark_overdue(&self, obligation_id: Uuid) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        let Some(current) = inner.obligations.get(&obligation_id).cloned() else {
            return Ok(false);
        };
        match current.state().apply(ObligationEvent::DuePassed) {
            Transition::Changed(state) => {
                inner.write_state(obligation_id, state, Decimal::ZERO, false);
                Ok(true)
            }
            Transition::Unchanged | Transition::Rejected(_) => Ok(false),
        }
    }

    async fn claim_reminder(&self, claim: &ReminderClaim) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        let key = (claim.obligation_id, claim.offset_days);
        if inner.reminders.contains_key(&key) {
            return Ok(false);
        }
        inner.reminders.insert(
            key,
            ReminderRecord {
                obligation_id: claim.obligation_id,
                offset_days: claim.offset_days,
                escalation: claim.escalation.as_str().to_string(),
                delivery_status: DeliveryStatus::Sent,
                detail: None,
            },
        );
        Ok(true)
    }

    async fn mark_reminder_failed(
        &self,
        obligation_id: Uuid,
        offset_days: i32,
        detail: &str,
    ) -> Result<(), AppError> {
        if let Some(record) = self
            .inner
            .write()
            .await
            .reminders
            .get_mut(&(obligation_id, offset_days))
        {
            record.delivery_status = DeliveryStatus::Failed;
            record.detail = Some(detail.to_string());
        }
        Ok(())
    }

    async fn record_external_transactions(
        &self,
        transactions: &[ExternalTransaction],
    ) -> Result<u64, AppError> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for t in transactions {
            let key = (t.company_id, t.provider.clone(), t.external_id.clone());
            if let std::collections::btree_map::Entry::Vacant(slot) = inner.transactions.entry(key)
            {
                slot.insert(t.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn consumed_transaction_ids(
        &self,
        company_id: Uuid,
        provider: &str,
    ) -> Result<HashSet<String>, AppError> {
        Ok(self
            .inner
            .read()
            .await
            .matches
            .keys()
            .filter(|(c, p, _)| *c == company_id && p == provider)
            .map(|(_, _, id)| id.clone())
            .collect())
    }

    async fn apply_match(&self, set: &MatchSet) -> Result<MatchOutcome, AppError> {
        let mut inner = self.inner.write().await;
        let Some(current) = inner.obligations.get(&set.obligation_id).cloned() else {
            return Ok(MatchOutcome::Stale("obligation not found".to_string()));
        };

        let target = match set.evaluate(&current) {
            Ok(state) => state,
            Err(reason) => return Ok(MatchOutcome::Stale(reason)),
        };

        for allocation in &set.allocations {
            let key = (
                set.company_id,
                set.provider.clone(),
                allocation.external_id.clone(),
            );
            if inner.matches.contains_key(&key) {
                return Ok(MatchOutcome::Stale(format!(
                    "transaction {} was consumed by another run",
                    allocation.external_id
                )));
            }
        }

        for allocation in &set.allocations {
            inner.matches.insert(
                (
                    set.company_id,
                    set.provider.clone(),
                    allocation.external_id.clone(),
                ),
                MatchRecord {
                    obligation_id: set.obligation_id,
                    external_id: allocation.external_id.clone(),
                    amount: allocation.amount,
                },
            );
        }
        inner.write_state(set.obligation_id, target, set.total(), false);

        let settled = target == ObligationState::Settled;
        for exception in inner.exceptions.iter_mut().filter(|e| {
            !e.resolved && e.company_id == set.company_id && e.provider == set.provider
        }) {
            let consumed = exception.external_id.as_ref().is_some_and(|id| {
                set.allocations.iter().any(|a| &a.external_id == id)
            });
            let closed = settled && exception.obligation_id == Some(set.obligation_id);
            if consumed || closed {
                exception.resolved = true;
            }
        }
        Ok(MatchOutcome::Applied(target))
    }

    async fn record_exception(&self, exception: &NewException) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        let duplicate = inner.exceptions.iter().any(|e| {
            !e.resolved
                && e.company_id == exception.company_id
                && e.provider == exception.provider
                && e.kind == exception.kind.as_str()
                && e.external_id == exception.external_id
                && e.obligation_id == exception.obligation_id
        });
        if duplicate {
            return Ok(false);
        }
        inner.exceptions.push(ReconciliationException {
            exception_id: Uuid::new_v4(),
            company_id: exception.company_id,
            provider: exception.provider.clone(),
            external_id: exception.external_id.clone(),
            obligation_id: exception.obligation_id,
            kind: exception.kind.as_str().to_string(),
            detail: exception.detail.clone(),
            resolved: false,
            created_utc: Utc::now(),
        });
        Ok(true)
    }

    async fn list_exceptions(
        &self,
        filter: &ListExceptionsFilter,
    ) -> Result<Vec<ReconciliationException>, AppError> {
        let inner = self.inner.read().await;
        let limit = if filter.limit > 0 { filter.limit } else { 100 } as usize;
        let mut exceptions: Vec<_> = inner
            .exceptions
            .iter()
            .filter(|e| filter.company_id.map_or(true, |c| e.company_id == c))
            .filter(|e| filter.include_resolved || !e.resolved)
            .cloned()
            .collect();
        exceptions.sort_by(|a, b| {
            b.created_utc
                .cmp(&a.created_utc)
                .then(a.exception_id.cmp(&b.exception_id))
        });
        exceptions.truncate(limit);
        Ok(exceptions)
    }

    async fn apply_webhook_event(
        &self,
        command: &WebhookCommand,
    ) -> Result<WebhookOutcome, AppError> {
        let mut inner = self.inner.write().await;
        if inner.webhook_events.contains_key(&command.event_id) {
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match inner.obligations.get(&command.obligation_id).cloned() {
            None => WebhookOutcome::Ignored("obligation not found".to_string()),
            Some(current) => {
                let was_settled = current.state() == ObligationState::Settled;
                let outcome = command.evaluate(&current);
                if let WebhookOutcome::Applied(state) = outcome {
                    let reset = was_settled && state == ObligationState::Pending;
                    inner.write_state(command.obligation_id, state, Decimal::ZERO, reset);
                }
                outcome
            }
        };

        inner
            .webhook_events
            .insert(command.event_id.clone(), outcome.as_str().to_string());
        Ok(outcome)
    }

    async fn unsynced_invoices(&self, company_id: Uuid) -> Result<Vec<OverageInvoice>, AppError> {
        let inner = self.inner.read().await;
        let mut invoices: Vec<_> = inner
            .invoices
            .values()
            .filter(|i| i.company_id == company_id && i.external_id.is_none())
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.period_start);
        Ok(invoices)
    }

    async fn mark_invoice_synced(
        &self,
        invoice_id: Uuid,
        external_id: &str,
    ) -> Result<bool, AppError> {
        let mut inner = self.inner.write().await;
        match inner.invoices.get_mut(&invoice_id) {
            Some(invoice) if invoice.external_id.is_none() => {
                invoice.external_id = Some(external_id.to_string());
                invoice.updated_utc = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_accounting_customer(
        &self,
        company_id: Uuid,
        customer_id: &str,
    ) -> Result<(), AppError> {
        if let Some(company) = self.inner.write().await.companies.get_mut(&company_id) {
            company.accounting_customer_id = Some(customer_id.to_string());
            company.updated_utc = Utc::now();
        }
        Ok(())
    }

    async fn start_job_run(&self, kind: JobKind) -> Result<JobRun, AppError> {
        let run = JobRun {
            run_id: Uuid::new_v4(),
            job_kind: kind.as_str().to_string(),
            status: JobRunStatus::Running.as_str().to_string(),
            started_utc: Utc::now(),
            completed_utc: None,
            units_processed: 0,
            units_succeeded: 0,
            units_failed: 0,
            summary: None,
        };
        self.inner
            .write()
            .await
            .job_runs
            .insert(run.run_id, run.clone());
        Ok(run)
    }

    async fn finish_job_run(&self, run_id: Uuid, update: &JobRunUpdate) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        let Some(run) = inner.job_runs.get_mut(&run_id) else {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "job run {} not found",
                run_id
            )));
        };
        run.status = update.status.as_str().to_string();
        run.completed_utc = Some(Utc::now());
        run.units_processed = update.units_processed;
        run.units_succeeded = update.units_succeeded;
        run.units_failed = update.units_failed;
        run.summary = Some(Json(update.summary.clone()));

        let now = Utc::now();
        for UnitError {
            scope,
            kind,
            message,
        } in &update.errors
        {
            inner.job_run_errors.push(JobRunError {
                error_id: Uuid::new_v4(),
                run_id,
                scope: scope.clone(),
                kind: kind.clone(),
                message: message.clone(),
                created_utc: now,
            });
        }
        Ok(())
    }

    async fn get_job_run(&self, run_id: Uuid) -> Result<Option<JobRunDetail>, AppError> {
        let inner = self.inner.read().await;
        Ok(inner.job_runs.get(&run_id).map(|run| JobRunDetail {
            run: run.clone(),
            errors: inner
                .job_run_errors
                .iter()
                .filter(|e| e.run_id == run_id)
                .cloned()
                .collect(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Allocation, ExceptionKind as Kind};

    fn obligation(company_id: Uuid, amount: i64) -> Obligation {
        let now = Utc::now();
        Obligation {
            obligation_id: Uuid::new_v4(),
            company_id,
            kind: ObligationKind::Manual.as_str().to_string(),
            reference: None,
            amount: Decimal::new(amount, 2),
            amount_matched: Decimal::ZERO,
            currency: "EUR".to_string(),
            due_utc: now,
            state: "pending".to_string(),
            settled_utc: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    fn match_set(o: &Obligation, external_id: &str) -> MatchSet {
        MatchSet {
            obligation_id: o.obligation_id,
            company_id: o.company_id,
            provider: "bank".to_string(),
            expected_state: ObligationState::Pending,
            expected_matched: Decimal::ZERO,
            event: ObligationEvent::Settle,
            allocations: vec![Allocation {
                external_id: external_id.to_string(),
                amount: o.amount,
            }],
        }
    }

    #[tokio::test]
    async fn a_transaction_is_consumed_once() {
        let store = MemoryStore::new();
        let company_id = Uuid::new_v4();
        let first = obligation(company_id, 5000);
        let second = obligation(company_id, 5000);
        store.insert_obligation(first.clone()).await;
        store.insert_obligation(second.clone()).await;

        let outcome = store.apply_match(&match_set(&first, "tx-1")).await.unwrap();
        assert_eq!(outcome, MatchOutcome::Applied(ObligationState::Settled));

        let outcome = store.apply_match(&match_set(&second, "tx-1")).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Stale(_)));
        assert_eq!(
            store.get_obligation(second.obligation_id).await.unwrap().unwrap().state(),
            ObligationState::Pending
        );
    }

    #[tokio::test]
    async fn stale_match_is_rejected() {
        let store = MemoryStore::new();
        let o = obligation(Uuid::new_v4(), 5000);
        store.insert_obligation(o.clone()).await;
        store.mark_overdue(o.obligation_id).await.unwrap();

        let outcome = store.apply_match(&match_set(&o, "tx-9")).await.unwrap();
        assert!(matches!(outcome, MatchOutcome::Stale(_)));
        assert!(store.all_matches().await.is_empty());
    }

    #[tokio::test]
    async fn matching_resolves_open_exceptions() {
        let store = MemoryStore::new();
        let o = obligation(Uuid::new_v4(), 5000);
        store.insert_obligation(o.clone()).await;
        let set = match_set(&o, "tx-1");
        for (external_id, obligation_id, kind) in [
            (Some("tx-1"), None, Kind::UnmatchedTransaction),
            (None, Some(o.obligation_id), Kind::StaleObligation),
            (Some("tx-other"), None, Kind::UnmatchedTransaction),
        ] {
            store
                .record_exception(&NewException {
                    company_id: set.company_id,
                    provider: set.provider.clone(),
                    external_id: external_id.map(String::from),
                    obligation_id,
                    kind,
                    detail: "open".to_string(),
                })
                .await
                .unwrap();
        }

        let outcome = store.apply_match(&set).await.unwrap();
        assert_eq!(outcome, MatchOutcome::Applied(ObligationState::Settled));

        let open = store
            .list_exceptions(&ListExceptionsFilter::default())
            .await
            .unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].external_id.as_deref(), Some("tx-other"));

        let all = store
            .list_exceptions(&ListExceptionsFilter {
                include_resolved: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.iter().filter(|e| e.resolved).count(), 2);
    }

    #[tokio::test]
    async fn exceptions_are_deduplicated() {
        let store = MemoryStore::new();
        let exception = NewException {
            company_id: Uuid::new_v4(),
            provider: "bank".to_string(),
            external_id: Some("tx-1".to_string()),
            obligation_id: None,
            kind: Kind::UnmatchedTransaction,
            detail: "no obligation".to_string(),
        };
        assert!(store.record_exception(&exception).await.unwrap());
        assert!(!store.record_exception(&exception).await.unwrap());
        let listed = store
            .list_exceptions(&ListExceptionsFilter::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].kind, Kind::UnmatchedTransaction.as_str());
    }
}
