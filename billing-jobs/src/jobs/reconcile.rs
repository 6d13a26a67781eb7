//! External reconciliation engine.
//!
//! Pulls a company's transactions from its bank gateway, matches them against
//! open obligations and persists one match set per obligation. Anything that
//! cannot be resolved becomes a reconciliation exception.

use super::matching::{AmbiguousMatch, MatchPolicy};
use super::{call, JobBudget, JobRunTracker, UnitTally};
use crate::config::{BillingJobsConfig, MAX_LOOKBACK_DAYS};
use crate::error::{company_scope, obligation_scope, JobError, UnitError};
use crate::models::{
    ExceptionKind, ExternalTransaction, JobKind, JobRunStatus, MatchOutcome, NewException,
    ObligationState, TransactionWindow,
};
use crate::services::metrics::record_match;
use crate::services::providers::{GatewayClient, ProviderRegistry};
use crate::services::Store;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub company_id: Uuid,
    pub provider: String,
    pub matched: u32,
    pub partially_matched: u32,
    /// Unconsumed transactions considered in this run.
    pub total: u32,
    pub unmatched: Vec<ExternalTransaction>,
    pub ambiguous: Vec<AmbiguousMatch>,
    pub stale: u32,
    pub errors: Vec<UnitError>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileAllSummary {
    pub run_id: Option<Uuid>,
    pub status: JobRunStatus,
    pub companies: u32,
    pub matched: u32,
    pub partially_matched: u32,
    pub total: u32,
    pub unmatched: u32,
    pub ambiguous: u32,
    pub results: Vec<ReconcileSummary>,
    pub errors: Vec<UnitError>,
    pub partial: bool,
}

pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    banks: Arc<ProviderRegistry<dyn GatewayClient>>,
    policy: MatchPolicy,
    budget: Duration,
    call_timeout: Duration,
    max_concurrency: usize,
    default_lookback_days: i64,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        banks: Arc<ProviderRegistry<dyn GatewayClient>>,
        config: &BillingJobsConfig,
    ) -> Self {
        Self {
            store,
            banks,
            policy: MatchPolicy::from_config(&config.matching),
            budget: Duration::from_secs(config.cron.reconcile_budget_secs),
            call_timeout: config.cron.call_timeout(),
            max_concurrency: config.cron.max_concurrency.max(1),
            default_lookback_days: config.matching.default_lookback_days,
        }
    }

    pub fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(self.default_lookback_days.clamp(1, MAX_LOOKBACK_DAYS))
    }

    /// Reconcile every active company with a bank provider, or just `only`.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_all(
        &self,
        lookback: chrono::Duration,
        only: Option<Uuid>,
    ) -> Result<ReconcileAllSummary, AppError> {
        let tracker = JobRunTracker::start(self.store.clone(), JobKind::Reconcile).await?;
        let budget = JobBudget::new(self.budget);
        let mut tally = UnitTally::default();
        let mut summary = ReconcileAllSummary {
            run_id: Some(tracker.run_id()),
            ..Default::default()
        };

        let company_ids = match only {
            Some(company_id) => Ok(vec![company_id]),
            None => call(self.call_timeout, "list companies", self.store.list_active_companies())
                .await
                .map(|companies| {
                    companies
                        .into_iter()
                        .filter(|c| c.bank_provider.is_some())
                        .map(|c| c.company_id)
                        .collect::<Vec<_>>()
                }),
        };

        match company_ids {
            Ok(company_ids) => {
                let mut outcomes: Vec<(Uuid, Option<Result<ReconcileSummary, JobError>>)> =
                    stream::iter(company_ids)
                        .map(|company_id| async move {
                            if budget.exhausted() {
                                return (company_id, None);
                            }
                            (company_id, Some(self.reconcile(company_id, lookback).await))
                        })
                        .buffer_unordered(self.max_concurrency)
                        .collect()
                        .await;
                outcomes.sort_by_key(|(company_id, _)| *company_id);

                for (company_id, outcome) in outcomes {
                    match outcome {
                        None => summary.partial = true,
                        Some(Ok(result)) => {
                            summary.companies += 1;
                            summary.matched += result.matched;
                            summary.partially_matched += result.partially_matched;
                            summary.total += result.total;
                            summary.unmatched += result.unmatched.len() as u32;
                            summary.ambiguous += result.ambiguous.len() as u32;
                            tally.settle_unit(JobKind::Reconcile, result.errors.clone());
                            summary.results.push(result);
                        }
                        Some(Err(e)) => {
                            tally.failure(JobKind::Reconcile, e.unit(company_scope(company_id)))
                        }
                    }
                }
                if summary.partial {
                    tracing::warn!("Reconciliation budget exhausted, some companies were skipped");
                }
            }
            Err(e) => tally.failure(JobKind::Reconcile, e.unit("job")),
        }

        summary.errors = tally.errors.clone();
        summary.status = tracker.finish(&tally, summary.partial, &summary).await;
        Ok(summary)
    }

    /// Reconcile one company over `[now - lookback, now]`.
    #[tracing::instrument(skip(self), fields(company_id = %company_id))]
    pub async fn reconcile(
        &self,
        company_id: Uuid,
        lookback: chrono::Duration,
    ) -> Result<ReconcileSummary, JobError> {
        let company = call(self.call_timeout, "read company", self.store.get_company(company_id))
            .await?
            .ok_or_else(|| JobError::Validation(format!("company {} not found", company_id)))?;
        let provider = company.bank_provider.clone().ok_or_else(|| {
            JobError::Configuration(format!("company {} has no bank provider", company_id))
        })?;
        let gateway = self.banks.get(&provider).ok_or_else(|| {
            JobError::Configuration(format!("unknown bank provider '{}'", provider))
        })?;

        let now = Utc::now();
        let window = TransactionWindow::ending_at(now, lookback).ok_or_else(|| {
            JobError::Validation(format!("lookback of {} days is out of range", lookback.num_days()))
        })?;
        let fetched = call(
            self.call_timeout,
            "fetch transactions",
            gateway.list_transactions(company_id, &window),
        )
        .await?;

        let transactions: Vec<ExternalTransaction> = fetched
            .into_iter()
            .map(|t| ExternalTransaction {
                company_id,
                provider: provider.clone(),
                external_id: t.external_id,
                amount: t.amount,
                currency: t.currency.to_ascii_uppercase(),
                booked_on: t.booked_on,
                reference: t.reference,
                counterparty: t.counterparty,
            })
            .collect();

        let inserted = call(
            self.call_timeout,
            "store transactions",
            self.store.record_external_transactions(&transactions),
        )
        .await?;
        let consumed = call(
            self.call_timeout,
            "read consumed transactions",
            self.store.consumed_transaction_ids(company_id, &provider),
        )
        .await?;
        let fresh: Vec<ExternalTransaction> = transactions
            .into_iter()
            .filter(|t| !consumed.contains(&t.external_id))
            .collect();

        let slack = chrono::Duration::try_days(self.policy.date_slack_days)
            .ok_or_else(|| JobError::Configuration("date slack is out of range".to_string()))?;
        let (due_from, due_to) = window
            .from
            .checked_sub_signed(slack)
            .zip(window.to.checked_add_signed(slack))
            .ok_or_else(|| JobError::Validation("obligation due window is out of range".to_string()))?;
        let obligations = call(
            self.call_timeout,
            "read obligations",
            self.store
                .list_open_obligations_for_company(company_id, due_from, due_to),
        )
        .await?;

        tracing::info!(
            fetched_new = inserted,
            candidates = fresh.len(),
            obligations = obligations.len(),
            "Matching transactions"
        );

        let plan = self.policy.plan(company_id, &provider, &obligations, &fresh);
        let mut summary = ReconcileSummary {
            company_id,
            provider: provider.clone(),
            total: fresh.len() as u32,
            ..Default::default()
        };
        let mut unmatched = plan.unmatched;

        for set in plan.sets {
            let scope = obligation_scope(set.obligation_id);
            match call(self.call_timeout, "apply match", self.store.apply_match(&set)).await {
                Ok(MatchOutcome::Applied(ObligationState::Settled)) => summary.matched += 1,
                Ok(MatchOutcome::Applied(_)) => summary.partially_matched += 1,
                Ok(MatchOutcome::Stale(reason)) => {
                    tracing::warn!(obligation_id = %set.obligation_id, reason = %reason, "Match set is stale");
                    summary.stale += 1;
                    for allocation in &set.allocations {
                        if let Some(tx) = fresh.iter().find(|t| t.external_id == allocation.external_id) {
                            unmatched.push(tx.clone());
                        }
                    }
                    let exception = NewException {
                        company_id,
                        provider: provider.clone(),
                        external_id: None,
                        obligation_id: Some(set.obligation_id),
                        kind: ExceptionKind::StaleObligation,
                        detail: reason,
                    };
                    if let Err(e) = self.record_exception(&exception).await {
                        summary.errors.push(e.unit(scope));
                    }
                }
                Err(e) => summary.errors.push(e.unit(scope)),
            }
        }

        for ambiguous in &plan.ambiguous {
            let exception = NewException {
                company_id,
                provider: provider.clone(),
                external_id: None,
                obligation_id: Some(ambiguous.obligation_id),
                kind: ExceptionKind::AmbiguousMatch,
                detail: format!("equally good candidates: {}", ambiguous.candidates.join(", ")),
            };
            if let Err(e) = self.record_exception(&exception).await {
                summary.errors.push(e.unit(obligation_scope(ambiguous.obligation_id)));
            }
        }

        for tx in &unmatched {
            let exception = NewException {
                company_id,
                provider: provider.clone(),
                external_id: Some(tx.external_id.clone()),
                obligation_id: None,
                kind: ExceptionKind::UnmatchedTransaction,
                detail: format!(
                    "{} {} booked {} matched no open obligation",
                    tx.amount, tx.currency, tx.booked_on
                ),
            };
            if let Err(e) = self.record_exception(&exception).await {
                summary.errors.push(e.unit(company_scope(company_id)));
            }
        }

        record_match("settled", summary.matched as u64);
        record_match("partial", summary.partially_matched as u64);
        record_match("ambiguous", plan.ambiguous.len() as u64);
        record_match("stale", summary.stale as u64);
        record_match("unmatched", unmatched.len() as u64);

        summary.ambiguous = plan.ambiguous;
        summary.unmatched = unmatched;
        Ok(summary)
    }

    async fn record_exception(&self, exception: &NewException) -> Result<bool, JobError> {
        call(
            self.call_timeout,
            "record exception",
            self.store.record_exception(exception),
        )
        .await
    }
}
