//! Persistence contract shared by the PostgreSQL and in-memory stores.
//!
//! Every effect a job produces is guarded by a unique key here (period,
//! reminder offset, external transaction, webhook event id), so concurrent or
//! repeated runs stay idempotent without in-process locks.

use crate::models::{
    BillingPeriod, Company, ExternalTransaction, JobKind, JobRun, JobRunDetail, JobRunUpdate,
    ListExceptionsFilter, MatchOutcome, MatchSet, NewException, NewOverageInvoice, Obligation,
    OverageInvoice, OverageRate, ReconciliationException, ReminderClaim, UsageLimit,
    UsageSnapshot, WebhookCommand, WebhookOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use std::collections::HashSet;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Companies and usage

    async fn list_active_companies(&self) -> Result<Vec<Company>, AppError>;

    async fn get_company(&self, company_id: Uuid) -> Result<Option<Company>, AppError>;

    async fn usage_limits(&self, plan_code: &str) -> Result<Vec<UsageLimit>, AppError>;

    async fn overage_rates(&self, plan_code: &str) -> Result<Vec<OverageRate>, AppError>;

    async fn usage_for_period(
        &self,
        company_id: Uuid,
        period: BillingPeriod,
    ) -> Result<UsageSnapshot, AppError>;

    /// Insert the invoice and its obligation atomically. `None` when an invoice
    /// for `(company_id, period_start)` already exists.
    async fn create_overage_invoice(
        &self,
        input: &NewOverageInvoice,
    ) -> Result<Option<OverageInvoice>, AppError>;

    /// `true` only for the first caller per `(company, period, resource, threshold)`.
    async fn claim_usage_alert(
        &self,
        company_id: Uuid,
        period_start: NaiveDate,
        resource: &str,
        threshold_pct: i32,
    ) -> Result<bool, AppError>;

    // Obligations

    async fn get_obligation(&self, obligation_id: Uuid) -> Result<Option<Obligation>, AppError>;

    /// Open obligations of active companies, oldest due first.
    async fn list_open_obligations(&self) -> Result<Vec<Obligation>, AppError>;

    async fn list_open_obligations_for_company(
        &self,
        company_id: Uuid,
        due_from: DateTime<Utc>,
        due_to: DateTime<Utc>,
    ) -> Result<Vec<Obligation>, AppError>;

    /// Apply the "due passed" edge. `true` when the state changed.
    async fn mark_overdue(&self, obligation_id: Uuid) -> Result<bool, AppError>;

    // Reminders

    /// Claim `(obligation_id, offset_days)` before sending; `false` means
    /// another run already owns it.
    async fn claim_reminder(&self, claim: &ReminderClaim) -> Result<bool, AppError>;

    async fn mark_reminder_failed(
        &self,
        obligation_id: Uuid,
        offset_days: i32,
        detail: &str,
    ) -> Result<(), AppError>;

    // Reconciliation

    /// Insert-or-ignore. Returns how many rows were new.
    async fn record_external_transactions(
        &self,
        transactions: &[ExternalTransaction],
    ) -> Result<u64, AppError>;

    async fn consumed_transaction_ids(
        &self,
        company_id: Uuid,
        provider: &str,
    ) -> Result<HashSet<String>, AppError>;

    /// Persist one obligation's match set in a single transaction.
    async fn apply_match(&self, set: &MatchSet) -> Result<MatchOutcome, AppError>;

    /// `false` when an identical open exception already exists.
    async fn record_exception(&self, exception: &NewException) -> Result<bool, AppError>;

    async fn list_exceptions(
        &self,
        filter: &ListExceptionsFilter,
    ) -> Result<Vec<ReconciliationException>, AppError>;

    // Webhooks

    /// Claim the event id, apply the transition and record the outcome atomically.
    async fn apply_webhook_event(&self, command: &WebhookCommand)
        -> Result<WebhookOutcome, AppError>;

    // Accounting sync

    async fn unsynced_invoices(&self, company_id: Uuid) -> Result<Vec<OverageInvoice>, AppError>;

    /// `false` when the invoice already carries an external id.
    async fn mark_invoice_synced(
        &self,
        invoice_id: Uuid,
        external_id: &str,
    ) -> Result<bool, AppError>;

    async fn set_accounting_customer(
        &self,
        company_id: Uuid,
        customer_id: &str,
    ) -> Result<(), AppError>;

    // Job runs

    async fn start_job_run(&self, kind: JobKind) -> Result<JobRun, AppError>;

    async fn finish_job_run(&self, run_id: Uuid, update: &JobRunUpdate) -> Result<(), AppError>;

    async fn get_job_run(&self, run_id: Uuid) -> Result<Option<JobRunDetail>, AppError>;
}
