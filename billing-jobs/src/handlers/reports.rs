//! Read-only views over reconciliation exceptions and job runs.

use crate::jobs::{CronCaller, Principal};
use crate::models::ListExceptionsFilter;
use crate::startup::AppState;
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ExceptionParams {
    pub company_id: Option<Uuid>,
    #[serde(default)]
    pub include_resolved: bool,
    pub limit: Option<i64>,
}

pub async fn list_exceptions(
    State(state): State<AppState>,
    CronCaller(principal): CronCaller,
    Query(params): Query<ExceptionParams>,
) -> Result<impl IntoResponse, AppError> {
    let company_id = match principal {
        Principal::Operator {
            company_id: Some(own),
            ..
        } => Some(own),
        _ => params.company_id,
    };
    let filter = ListExceptionsFilter {
        company_id,
        include_resolved: params.include_resolved,
        limit: params.limit.unwrap_or(100).clamp(1, 500),
    };

    let exceptions = state.store.list_exceptions(&filter).await?;
    Ok(Json(json!({
        "count": exceptions.len(),
        "exceptions": exceptions,
    })))
}

pub async fn get_job_run(
    State(state): State<AppState>,
    _caller: CronCaller,
    Path(run_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let run = state
        .store
        .get_job_run(run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("job run {} not found", run_id)))?;
    Ok(Json(run))
}
