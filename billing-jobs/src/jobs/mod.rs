//! Scheduled jobs: gate, engines and the plumbing they share.

pub mod accounting;
pub mod gate;
pub mod matching;
pub mod overage;
pub mod reconcile;
pub mod reminders;

pub use accounting::{AccountingSync, SyncSummary};
pub use gate::{CronCaller, CronGate, GateRejection, JobAuthorization, Principal};
pub use matching::{MatchPlan, MatchPolicy};
pub use overage::{OverageEngine, OverageSummary};
pub use reconcile::{ReconcileAllSummary, ReconcileSummary, ReconciliationEngine};
pub use reminders::{ReminderEngine, ReminderSummary};

use crate::error::{JobError, UnitError};
use crate::models::{JobKind, JobRunStatus, JobRunUpdate};
use crate::services::metrics::{record_error, record_job_run};
use crate::services::Store;
use serde::Serialize;
use service_core::error::AppError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Wall-clock allowance for one job invocation. Once exhausted, engines stop
/// starting new units and report a partial result.
#[derive(Debug, Clone, Copy)]
pub struct JobBudget {
    started: Instant,
    limit: Duration,
}

impl JobBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.started.elapsed() >= self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Run one collaborator call under its own timeout.
pub async fn call<T, E, F>(timeout: Duration, what: &str, fut: F) -> Result<T, JobError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<JobError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(JobError::TransientIo(format!(
            "{} timed out after {}s",
            what,
            timeout.as_secs_f64()
        ))),
    }
}

/// Unit counters every job reports.
#[derive(Debug, Default, Clone)]
pub struct UnitTally {
    pub processed: i32,
    pub succeeded: i32,
    pub failed: i32,
    pub errors: Vec<UnitError>,
}

impl UnitTally {
    pub fn success(&mut self) {
        self.processed += 1;
        self.succeeded += 1;
    }

    pub fn failure(&mut self, job: JobKind, error: UnitError) {
        self.processed += 1;
        self.failed += 1;
        self.note(job, error);
    }

    /// A unit that ran to the end but collected errors along the way fails
    /// once; the remaining errors are kept as notes.
    pub fn settle_unit(&mut self, job: JobKind, errors: Vec<UnitError>) {
        let mut errors = errors.into_iter();
        match errors.next() {
            None => self.success(),
            Some(first) => {
                self.failure(job, first);
                for rest in errors {
                    self.note(job, rest);
                }
            }
        }
    }

    /// Record an error that does not fail its unit (e.g. a notification).
    pub fn note(&mut self, job: JobKind, error: UnitError) {
        record_error(&error.kind, job.as_str());
        tracing::warn!(
            job = job.as_str(),
            scope = %error.scope,
            kind = %error.kind,
            message = %error.message,
            "Unit error"
        );
        self.errors.push(error);
    }
}

/// Bookkeeping for one job invocation: a `job_runs` row opened at start and
/// closed with counters and unit errors at the end.
pub struct JobRunTracker {
    store: Arc<dyn Store>,
    kind: JobKind,
    run_id: Uuid,
    started: Instant,
}

impl JobRunTracker {
    pub async fn start(store: Arc<dyn Store>, kind: JobKind) -> Result<Self, AppError> {
        let run = store.start_job_run(kind).await?;
        tracing::info!(job = kind.as_str(), run_id = %run.run_id, "Job run started");
        Ok(Self {
            store,
            kind,
            run_id: run.run_id,
            started: Instant::now(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Close the run. A failure to persist the run row is logged, not raised:
    /// the work itself is already committed.
    pub async fn finish<S: Serialize>(
        self,
        tally: &UnitTally,
        budget_exhausted: bool,
        summary: &S,
    ) -> JobRunStatus {
        let status = JobRunStatus::settle(budget_exhausted, tally.succeeded, tally.failed);
        let update = JobRunUpdate {
            status,
            units_processed: tally.processed,
            units_succeeded: tally.succeeded,
            units_failed: tally.failed,
            errors: tally.errors.clone(),
            summary: serde_json::to_value(summary).unwrap_or(serde_json::Value::Null),
        };

        if let Err(e) = self.store.finish_job_run(self.run_id, &update).await {
            tracing::error!(run_id = %self.run_id, error = %e, "Failed to close job run");
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        record_job_run(self.kind.as_str(), status.as_str(), elapsed);
        tracing::info!(
            job = self.kind.as_str(),
            run_id = %self.run_id,
            status = status.as_str(),
            processed = tally.processed,
            failed = tally.failed,
            elapsed_secs = elapsed,
            "Job run finished"
        );
        status
    }
}
