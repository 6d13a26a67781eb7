//! Scheduler-triggered job endpoints. Each accepts GET and POST.
//!
//! Unit failures are reported inside a 200 response; only gate failures and
//! store outages change the status code.

use crate::config::MAX_LOOKBACK_DAYS;
use crate::jobs::{CronCaller, Principal};
use crate::models::JobRunStatus;
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

/// `{ success, ...summary, timestamp }`.
#[derive(Debug, Serialize)]
pub struct JobResponse<T: Serialize> {
    pub success: bool,
    #[serde(flatten)]
    pub summary: T,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> JobResponse<T> {
    fn new(status: JobRunStatus, summary: T) -> Json<Self> {
        Json(Self {
            success: status != JobRunStatus::Failed,
            summary,
            timestamp: Utc::now(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct OverageParams {
    pub period_end: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ReminderParams {
    /// Evaluate reminder windows as of this instant instead of now.
    pub at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileParams {
    pub lookback_days: Option<i64>,
    pub company_id: Option<Uuid>,
}

pub async fn run_overages(
    State(state): State<AppState>,
    CronCaller(principal): CronCaller,
    Query(params): Query<OverageParams>,
) -> Result<impl IntoResponse, AppError> {
    let as_of = params.period_end.unwrap_or_else(|| Utc::now().date_naive());
    tracing::info!(principal = ?principal, as_of = %as_of, "Overage job triggered");

    let summary = state.overages.process_overages(as_of).await?;
    Ok(JobResponse::new(summary.status, summary))
}

pub async fn run_reminders(
    State(state): State<AppState>,
    CronCaller(principal): CronCaller,
    Query(params): Query<ReminderParams>,
) -> Result<impl IntoResponse, AppError> {
    let now = params.at.unwrap_or_else(Utc::now);
    tracing::info!(principal = ?principal, now = %now, "Reminder job triggered");

    let summary = state.reminders.process_reminders(now).await?;
    Ok(JobResponse::new(summary.status, summary))
}

pub async fn run_reconcile(
    State(state): State<AppState>,
    CronCaller(principal): CronCaller,
    Query(params): Query<ReconcileParams>,
) -> Result<impl IntoResponse, AppError> {
    let lookback = match params.lookback_days {
        Some(days) if !(1..=MAX_LOOKBACK_DAYS).contains(&days) => {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "lookback_days must be between 1 and {}",
                MAX_LOOKBACK_DAYS
            )))
        }
        Some(days) => chrono::Duration::days(days),
        None => state.reconciliation.default_lookback(),
    };

    // Operators tied to a company only reconcile that company.
    let only = match (&principal, params.company_id) {
        (Principal::Operator { company_id: Some(own), .. }, Some(requested)) if *own != requested => {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "operator may not reconcile company {}",
                requested
            )))
        }
        (Principal::Operator { company_id: Some(own), .. }, _) => Some(*own),
        (_, requested) => requested,
    };
    tracing::info!(principal = ?principal, company_id = ?only, lookback_days = lookback.num_days(), "Reconciliation triggered");

    let summary = state.reconciliation.reconcile_all(lookback, only).await?;
    Ok(JobResponse::new(summary.status, summary))
}

pub async fn run_accounting_sync(
    State(state): State<AppState>,
    CronCaller(principal): CronCaller,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!(principal = ?principal, "Accounting sync triggered");

    let summary = state.accounting.sync_all().await?;
    Ok(JobResponse::new(summary.status, summary))
}
