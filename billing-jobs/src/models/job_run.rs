//! Job run bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::UnitError;

/// Scheduled job type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Overages,
    Reminders,
    Reconcile,
    AccountingSync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Overages => "overages",
            JobKind::Reminders => "reminders",
            JobKind::Reconcile => "reconcile",
            JobKind::AccountingSync => "accounting_sync",
        }
    }
}

/// Job run status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    #[default]
    Running,
    Completed,
    Partial,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Completed => "completed",
            JobRunStatus::Partial => "partial",
            JobRunStatus::Failed => "failed",
        }
    }

    /// Budget exhaustion or any unit error makes a run partial. A run where
    /// every attempted unit failed is failed.
    pub fn settle(budget_exhausted: bool, succeeded: i32, failed: i32) -> Self {
        if failed > 0 && succeeded == 0 {
            JobRunStatus::Failed
        } else if failed > 0 || budget_exhausted {
            JobRunStatus::Partial
        } else {
            JobRunStatus::Completed
        }
    }
}

/// Job run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub run_id: Uuid,
    pub job_kind: String,
    pub status: String,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub units_processed: i32,
    pub units_succeeded: i32,
    pub units_failed: i32,
    pub summary: Option<Json<serde_json::Value>>,
}

/// One failed unit of a job run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct JobRunError {
    pub error_id: Uuid,
    pub run_id: Uuid,
    pub scope: String,
    pub kind: String,
    pub message: String,
    pub created_utc: DateTime<Utc>,
}

/// Final counters written when a run ends.
#[derive(Debug, Clone)]
pub struct JobRunUpdate {
    pub status: JobRunStatus,
    pub units_processed: i32,
    pub units_succeeded: i32,
    pub units_failed: i32,
    pub errors: Vec<UnitError>,
    pub summary: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunDetail {
    #[serde(flatten)]
    pub run: JobRun,
    pub errors: Vec<JobRunError>,
}
