//! Per-unit error taxonomy for scheduled jobs.
//!
//! Jobs never abort on a single company or obligation. Each failure becomes a
//! [`UnitError`] in the job summary and a `job_run_errors` row.

use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("ambiguous match: {0}")]
    Ambiguity(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("store error: {0}")]
    Store(String),
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Authorization(_) => "authorization",
            JobError::Configuration(_) => "configuration",
            JobError::Validation(_) => "validation",
            JobError::Ambiguity(_) => "ambiguity",
            JobError::TransientIo(_) => "transient_io",
            JobError::Store(_) => "store",
        }
    }

    pub fn unit(&self, scope: impl Into<String>) -> UnitError {
        UnitError {
            scope: scope.into(),
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<AppError> for JobError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::ConfigError(e) => JobError::Configuration(e.to_string()),
            AppError::BadRequest(e) => JobError::Validation(e.to_string()),
            AppError::BadGateway(msg) | AppError::ServiceUnavailable(msg) => {
                JobError::TransientIo(msg)
            }
            other => JobError::Store(other.to_string()),
        }
    }
}

/// A failure attributed to one unit of work (`company:<id>`, `obligation:<id>`,
/// `event:<id>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitError {
    pub scope: String,
    pub kind: String,
    pub message: String,
}

impl UnitError {
    pub fn new(scope: impl Into<String>, kind: &str, message: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            kind: kind.to_string(),
            message: message.into(),
        }
    }
}

pub fn company_scope(company_id: uuid::Uuid) -> String {
    format!("company:{}", company_id)
}

pub fn obligation_scope(obligation_id: uuid::Uuid) -> String {
    format!("obligation:{}", obligation_id)
}

pub fn event_scope(event_id: &str) -> String {
    format!("event:{}", event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_error_carries_kind_and_scope() {
        let err = JobError::Configuration("no overage rate for seats".to_string());
        let unit = err.unit("company:42");
        assert_eq!(unit.kind, "configuration");
        assert_eq!(unit.scope, "company:42");
        assert!(unit.message.contains("seats"));
    }

    #[test]
    fn database_errors_map_to_store() {
        let err: JobError = AppError::DatabaseError(anyhow::anyhow!("down")).into();
        assert_eq!(err.kind(), "store");
    }
}
