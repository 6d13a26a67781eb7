//! Obligation model and its state machine.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle state of an obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationState {
    Pending,
    PartiallyMatched,
    Settled,
    Overdue,
    Cancelled,
}

impl ObligationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PartiallyMatched => "partially_matched",
            Self::Settled => "settled",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "partially_matched" => Some(Self::PartiallyMatched),
            "settled" => Some(Self::Settled),
            "overdue" => Some(Self::Overdue),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// States that reminders and reconciliation still act on.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::PartiallyMatched | Self::Overdue
        )
    }

    pub const OPEN: [ObligationState; 3] = [
        ObligationState::Pending,
        ObligationState::PartiallyMatched,
        ObligationState::Overdue,
    ];

    /// Apply an event. Pure: every writer goes through this so both stores
    /// enforce the same monotonic transitions.
    pub fn apply(self, event: ObligationEvent) -> Transition {
        use ObligationEvent as E;
        use ObligationState as S;

        match (self, event) {
            (S::Cancelled, E::Cancel) => Transition::Unchanged,
            (S::Cancelled, _) => Transition::Rejected("obligation is cancelled"),

            (S::Settled, E::Reverse) => Transition::Changed(S::Pending),
            (S::Settled, E::Settle) => Transition::Unchanged,
            (S::Settled, _) => Transition::Rejected("obligation is settled"),
            (_, E::Reverse) => Transition::Rejected("only settled obligations can be reversed"),

            (_, E::Settle) => Transition::Changed(S::Settled),

            (S::PartiallyMatched, E::PartialMatch) => Transition::Unchanged,
            (_, E::PartialMatch) => Transition::Changed(S::PartiallyMatched),

            (S::Overdue, E::DuePassed | E::PaymentFailed) => Transition::Unchanged,
            (_, E::DuePassed | E::PaymentFailed) => Transition::Changed(S::Overdue),

            (_, E::Cancel) => Transition::Changed(S::Cancelled),
        }
    }
}

/// Something that happened to an obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationEvent {
    /// Full payment matched or confirmed by the provider.
    Settle,
    /// Some money matched, not all of it.
    PartialMatch,
    /// Due date passed with nothing settled.
    DuePassed,
    /// Provider reported a failed collection attempt.
    PaymentFailed,
    /// Manual or provider-side void.
    Cancel,
    /// Explicit reversal of a settlement.
    Reverse,
}

/// Result of applying an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed(ObligationState),
    Unchanged,
    Rejected(&'static str),
}

/// Origin of an obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObligationKind {
    OverageInvoice,
    Manual,
}

impl ObligationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OverageInvoice => "overage_invoice",
            Self::Manual => "manual",
        }
    }
}

/// Money owed to a company's platform account.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Obligation {
    pub obligation_id: Uuid,
    pub company_id: Uuid,
    pub kind: String,
    pub reference: Option<String>,
    pub amount: Decimal,
    pub amount_matched: Decimal,
    pub currency: String,
    pub due_utc: DateTime<Utc>,
    pub state: String,
    pub settled_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Obligation {
    /// A pending manual obligation.
    pub fn manual(
        company_id: Uuid,
        reference: Option<&str>,
        amount: Decimal,
        currency: &str,
        due_utc: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            obligation_id: Uuid::new_v4(),
            company_id,
            kind: ObligationKind::Manual.as_str().to_string(),
            reference: reference.map(String::from),
            amount,
            amount_matched: Decimal::ZERO,
            currency: currency.to_string(),
            due_utc,
            state: ObligationState::Pending.as_str().to_string(),
            settled_utc: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Unknown stored states are treated as cancelled so nothing acts on them.
    pub fn state(&self) -> ObligationState {
        ObligationState::from_str(&self.state).unwrap_or(ObligationState::Cancelled)
    }

    pub fn outstanding(&self) -> Decimal {
        (self.amount - self.amount_matched).max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ObligationEvent as E;
    use ObligationState as S;

    #[test]
    fn pending_settles_on_match_or_confirmation() {
        assert_eq!(S::Pending.apply(E::Settle), Transition::Changed(S::Settled));
        assert_eq!(S::Overdue.apply(E::Settle), Transition::Changed(S::Settled));
        assert_eq!(
            S::PartiallyMatched.apply(E::Settle),
            Transition::Changed(S::Settled)
        );
    }

    #[test]
    fn due_passed_moves_to_overdue_once() {
        assert_eq!(S::Pending.apply(E::DuePassed), Transition::Changed(S::Overdue));
        assert_eq!(S::Overdue.apply(E::DuePassed), Transition::Unchanged);
        assert_eq!(
            S::PartiallyMatched.apply(E::PaymentFailed),
            Transition::Changed(S::Overdue)
        );
    }

    #[test]
    fn settled_is_terminal_except_reversal() {
        assert!(matches!(S::Settled.apply(E::DuePassed), Transition::Rejected(_)));
        assert!(matches!(S::Settled.apply(E::PaymentFailed), Transition::Rejected(_)));
        assert!(matches!(S::Settled.apply(E::PartialMatch), Transition::Rejected(_)));
        assert!(matches!(S::Settled.apply(E::Cancel), Transition::Rejected(_)));
        assert_eq!(S::Settled.apply(E::Settle), Transition::Unchanged);
        assert_eq!(S::Settled.apply(E::Reverse), Transition::Changed(S::Pending));
    }

    #[test]
    fn cancelled_is_terminal() {
        for event in [E::Settle, E::PartialMatch, E::DuePassed, E::PaymentFailed, E::Reverse] {
            assert!(matches!(S::Cancelled.apply(event), Transition::Rejected(_)));
        }
        assert_eq!(S::Cancelled.apply(E::Cancel), Transition::Unchanged);
    }

    #[test]
    fn reversal_requires_settlement() {
        assert!(matches!(S::Pending.apply(E::Reverse), Transition::Rejected(_)));
        assert!(matches!(S::Overdue.apply(E::Reverse), Transition::Rejected(_)));
    }

    #[test]
    fn outstanding_never_negative() {
        let now = Utc::now();
        let obligation = Obligation {
            obligation_id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            kind: ObligationKind::Manual.as_str().to_string(),
            reference: None,
            amount: Decimal::new(10000, 2),
            amount_matched: Decimal::new(10001, 2),
            currency: "EUR".to_string(),
            due_utc: now,
            state: "pending".to_string(),
            settled_utc: None,
            created_utc: now,
            updated_utc: now,
        };
        assert_eq!(obligation.outstanding(), Decimal::ZERO);
        assert_eq!(obligation.state(), S::Pending);
    }
}
