//! External transactions, match sets and reconciliation exceptions.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::obligation::{Obligation, ObligationEvent, ObligationState, Transition};

/// A transaction reported by a bank or payment processor. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTransaction {
    pub company_id: Uuid,
    pub provider: String,
    pub external_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub booked_on: NaiveDate,
    pub reference: Option<String>,
    pub counterparty: Option<String>,
}

/// Inclusive window of booking instants pulled from a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TransactionWindow {
    /// `None` when `to - lookback` leaves the representable range.
    pub fn ending_at(to: DateTime<Utc>, lookback: chrono::Duration) -> Option<Self> {
        let from = to.checked_sub_signed(lookback)?;
        Some(Self { from, to })
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        date >= self.from.date_naive() && date <= self.to.date_naive()
    }
}

/// Part of a transaction consumed by an obligation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub external_id: String,
    pub amount: Decimal,
}

/// Everything matched to one obligation in a run, written atomically.
#[derive(Debug, Clone)]
pub struct MatchSet {
    pub obligation_id: Uuid,
    pub company_id: Uuid,
    pub provider: String,
    /// State and matched amount observed when the match was computed.
    pub expected_state: ObligationState,
    pub expected_matched: Decimal,
    pub event: ObligationEvent,
    pub allocations: Vec<Allocation>,
}

impl MatchSet {
    pub fn total(&self) -> Decimal {
        self.allocations.iter().map(|a| a.amount).sum()
    }

    /// Target state given the obligation as currently stored, or why the set
    /// can no longer be applied.
    pub fn evaluate(&self, current: &Obligation) -> Result<ObligationState, String> {
        if current.state() != self.expected_state || current.amount_matched != self.expected_matched
        {
            return Err(format!(
                "obligation moved from {} to {} since it was read",
                self.expected_state.as_str(),
                current.state
            ));
        }
        match self.expected_state.apply(self.event) {
            Transition::Changed(state) => Ok(state),
            Transition::Unchanged => Ok(self.expected_state),
            Transition::Rejected(reason) => Err(reason.to_string()),
        }
    }
}

/// Result of persisting a match set.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Applied(ObligationState),
    /// The obligation moved since it was read, or a transaction was consumed
    /// by another run. Nothing was written.
    Stale(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    UnmatchedTransaction,
    AmbiguousMatch,
    StaleObligation,
}

impl ExceptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnmatchedTransaction => "unmatched_transaction",
            Self::AmbiguousMatch => "ambiguous_match",
            Self::StaleObligation => "stale_obligation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewException {
    pub company_id: Uuid,
    pub provider: String,
    pub external_id: Option<String>,
    pub obligation_id: Option<Uuid>,
    pub kind: ExceptionKind,
    pub detail: String,
}

/// Something reconciliation could not resolve on its own.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationException {
    pub exception_id: Uuid,
    pub company_id: Uuid,
    pub provider: String,
    pub external_id: Option<String>,
    pub obligation_id: Option<Uuid>,
    pub kind: String,
    pub detail: String,
    pub resolved: bool,
    pub created_utc: DateTime<Utc>,
}

/// Filter parameters for listing exceptions.
#[derive(Debug, Clone, Default)]
pub struct ListExceptionsFilter {
    pub company_id: Option<Uuid>,
    pub include_resolved: bool,
    pub limit: i64,
}
