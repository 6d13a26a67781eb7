//! Payment provider webhook events.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::obligation::{Obligation, ObligationEvent, ObligationState, Transition};

/// One event of a webhook batch as delivered on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "payment.confirmed")]
    PaymentConfirmed,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.reversed")]
    PaymentReversed,
    #[serde(rename = "invoice.voided")]
    InvoiceVoided,
}

impl WebhookEventType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment.confirmed" => Some(Self::PaymentConfirmed),
            "payment.failed" => Some(Self::PaymentFailed),
            "payment.reversed" => Some(Self::PaymentReversed),
            "invoice.voided" => Some(Self::InvoiceVoided),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentConfirmed => "payment.confirmed",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentReversed => "payment.reversed",
            Self::InvoiceVoided => "invoice.voided",
        }
    }

    pub fn obligation_event(&self) -> ObligationEvent {
        match self {
            Self::PaymentConfirmed => ObligationEvent::Settle,
            Self::PaymentFailed => ObligationEvent::PaymentFailed,
            Self::PaymentReversed => ObligationEvent::Reverse,
            Self::InvoiceVoided => ObligationEvent::Cancel,
        }
    }
}

/// Payload shared by every supported event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub obligation_id: Uuid,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
}

/// A validated event ready to be applied in one store transaction.
#[derive(Debug, Clone)]
pub struct WebhookCommand {
    pub event_id: String,
    pub event_type: WebhookEventType,
    pub obligation_id: Uuid,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub amount_tolerance: Decimal,
    pub raw_payload: serde_json::Value,
}

impl WebhookCommand {
    /// Decide the effect of this event on the obligation as currently stored.
    pub fn evaluate(&self, obligation: &Obligation) -> WebhookOutcome {
        if let Some(currency) = &self.currency {
            if !currency.eq_ignore_ascii_case(&obligation.currency) {
                return WebhookOutcome::Ignored(format!(
                    "currency {} does not match obligation currency {}",
                    currency, obligation.currency
                ));
            }
        }

        if self.event_type == WebhookEventType::PaymentConfirmed {
            if let Some(amount) = self.amount {
                let outstanding = obligation.outstanding();
                if (amount - outstanding).abs() > self.amount_tolerance {
                    return WebhookOutcome::Ignored(format!(
                        "amount {} does not match outstanding {}",
                        amount, outstanding
                    ));
                }
            }
        }

        match obligation.state().apply(self.event_type.obligation_event()) {
            Transition::Changed(state) => WebhookOutcome::Applied(state),
            Transition::Unchanged => WebhookOutcome::Unchanged,
            Transition::Rejected(reason) => WebhookOutcome::Ignored(reason.to_string()),
        }
    }
}

/// What applying an event did.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Applied(ObligationState),
    Unchanged,
    /// Consumed but without effect on the obligation.
    Ignored(String),
    /// The event id was seen before.
    Duplicate,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Unchanged => "unchanged",
            Self::Ignored(_) => "ignored",
            Self::Duplicate => "duplicate",
        }
    }
}
