//! Payment provider webhook ingestion.
//!
//! The raw body is authenticated before it is parsed. Each event id is
//! processed at most once; replays are acknowledged as duplicates.

use crate::config::BillingJobsConfig;
use crate::error::{event_scope, JobError, UnitError};
use crate::jobs::{call, reminders::elapsed_days};
use crate::models::{
    Escalation, WebhookCommand, WebhookEnvelope, WebhookEventType, WebhookOutcome, WebhookPayload,
};
use crate::services::metrics::{record_error, record_webhook_event};
use crate::services::notifier::PAYMENT_FAILED_TEMPLATE;
use crate::services::{Notifier, Store};
use chrono::Utc;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use serde_json::{json, Value};
use service_core::error::AppError;
use service_core::utils::signature::verify_payload_signature;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "Webhook-Signature";

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSummary {
    pub processed: u32,
    pub duplicates: u32,
    pub ignored: u32,
    pub errors: Vec<UnitError>,
}

pub struct WebhookProcessor {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    secret: Option<Secret<String>>,
    amount_tolerance: Decimal,
    call_timeout: Duration,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        config: &BillingJobsConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            secret: config
                .webhook
                .secret
                .clone()
                .filter(|s| !s.expose_secret().trim().is_empty()),
            amount_tolerance: config.matching.amount_tolerance,
            call_timeout: config.cron.call_timeout(),
        }
    }

    fn authenticate(&self, signature: Option<&str>, raw_body: &[u8]) -> Result<(), AppError> {
        let secret = self.secret.as_ref().ok_or_else(|| {
            AppError::ServiceUnavailable("webhook secret is not configured".to_string())
        })?;
        let signature = signature
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("missing webhook signature")))?;

        if verify_payload_signature(secret.expose_secret(), raw_body, signature)? {
            Ok(())
        } else {
            Err(AppError::Unauthorized(anyhow::anyhow!(
                "invalid webhook signature"
            )))
        }
    }

    /// Turn one wire event into a command, or explain why it is invalid.
    fn command(&self, envelope: WebhookEnvelope) -> Result<WebhookCommand, JobError> {
        if envelope.id.trim().is_empty() {
            return Err(JobError::Validation("event id is empty".to_string()));
        }
        let event_type = WebhookEventType::parse(&envelope.event_type).ok_or_else(|| {
            JobError::Validation(format!("unknown event type '{}'", envelope.event_type))
        })?;
        let payload: WebhookPayload = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| JobError::Validation(format!("invalid payload: {}", e)))?;

        Ok(WebhookCommand {
            event_id: envelope.id,
            event_type,
            obligation_id: payload.obligation_id,
            amount: payload.amount,
            currency: payload.currency,
            amount_tolerance: self.amount_tolerance,
            raw_payload: envelope.payload,
        })
    }

    #[tracing::instrument(skip(self, signature, raw_body), fields(body_len = raw_body.len()))]
    pub async fn handle_webhook(
        &self,
        signature: Option<&str>,
        raw_body: &[u8],
    ) -> Result<WebhookSummary, AppError> {
        self.authenticate(signature, raw_body)?;

        let events: Vec<Value> = serde_json::from_slice(raw_body).map_err(|e| {
            AppError::BadRequest(anyhow::anyhow!("body must be a JSON array of events: {}", e))
        })?;

        let mut summary = WebhookSummary::default();
        for (index, raw) in events.into_iter().enumerate() {
            let envelope: WebhookEnvelope = match serde_json::from_value(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.push_error(
                        &mut summary,
                        JobError::Validation(format!("malformed event: {}", e))
                            .unit(format!("event:#{}", index)),
                    );
                    continue;
                }
            };
            let scope = event_scope(&envelope.id);
            let command = match self.command(envelope) {
                Ok(command) => command,
                Err(e) => {
                    self.push_error(&mut summary, e.unit(scope));
                    continue;
                }
            };

            let outcome = match call(
                self.call_timeout,
                "apply webhook event",
                self.store.apply_webhook_event(&command),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.push_error(&mut summary, e.unit(scope));
                    continue;
                }
            };

            record_webhook_event(command.event_type.as_str(), outcome.as_str());
            tracing::info!(
                event_id = %command.event_id,
                event_type = command.event_type.as_str(),
                obligation_id = %command.obligation_id,
                outcome = outcome.as_str(),
                "Webhook event handled"
            );

            match outcome {
                WebhookOutcome::Duplicate => summary.duplicates += 1,
                WebhookOutcome::Ignored(reason) => {
                    tracing::warn!(event_id = %command.event_id, reason = %reason, "Webhook event ignored");
                    summary.ignored += 1;
                }
                WebhookOutcome::Applied(_) if command.event_type == WebhookEventType::PaymentFailed => {
                    summary.processed += 1;
                    if let Err(e) = self.escalate_failure(command.obligation_id).await {
                        self.push_error(&mut summary, e.unit(scope));
                    }
                }
                WebhookOutcome::Applied(_) | WebhookOutcome::Unchanged => summary.processed += 1,
            }
        }
        Ok(summary)
    }

    fn push_error(&self, summary: &mut WebhookSummary, error: UnitError) {
        record_error(&error.kind, "webhook");
        tracing::warn!(scope = %error.scope, message = %error.message, "Webhook event rejected");
        summary.errors.push(error);
    }

    /// Tell the company a payment failed. Runs after the state change committed.
    async fn escalate_failure(&self, obligation_id: Uuid) -> Result<(), JobError> {
        let obligation = call(self.call_timeout, "read obligation", self.store.get_obligation(obligation_id))
            .await?
            .ok_or_else(|| JobError::Validation(format!("obligation {} not found", obligation_id)))?;
        let company = call(
            self.call_timeout,
            "read company",
            self.store.get_company(obligation.company_id),
        )
        .await?
        .ok_or_else(|| {
            JobError::Validation(format!("company {} not found", obligation.company_id))
        })?;

        let elapsed = elapsed_days(Utc::now(), obligation.due_utc);
        let data = json!({
            "company": company.name,
            "reference": obligation.reference,
            "amount": obligation.outstanding(),
            "currency": obligation.currency,
            "due_date": obligation.due_utc.date_naive(),
            "escalation": Escalation::from_elapsed_days(elapsed).as_str(),
        });
        call(
            self.call_timeout,
            "notifier",
            self.notifier
                .send(&company.billing_email, PAYMENT_FAILED_TEMPLATE, &data),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Company, Obligation, ObligationState};
    use crate::services::{MemoryStore, RecordingNotifier};
    use chrono::Duration as ChronoDuration;
    use service_core::utils::signature::sign_payload;

    const SECRET: &str = "whsec_test";

    async fn setup() -> (WebhookProcessor, Arc<MemoryStore>, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let company = Company::new("Acme", "billing@acme.test", "pro", "EUR", 1);
        let obligation = Obligation::manual(
            company.company_id,
            Some("INV-1001"),
            Decimal::new(10000, 2),
            "EUR",
            Utc::now() + ChronoDuration::days(3),
        );
        let obligation_id = obligation.obligation_id;
        store.insert_company(company).await;
        store.insert_obligation(obligation).await;

        let mut config = BillingJobsConfig::default();
        config.webhook.secret = Some(Secret::new(SECRET.to_string()));
        let processor = WebhookProcessor::new(
            store.clone(),
            Arc::new(RecordingNotifier::new()),
            &config,
        );
        (processor, store, obligation_id)
    }

    fn body(events: Value) -> Vec<u8> {
        serde_json::to_vec(&events).unwrap()
    }

    #[tokio::test]
    async fn unsigned_bodies_are_rejected() {
        let (processor, _, _) = setup().await;
        let raw = body(json!([]));
        let err = processor.handle_webhook(None, &raw).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
        let err = processor
            .handle_webhook(Some("sha256=deadbeef"), &raw)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn replayed_event_is_a_duplicate() {
        let (processor, store, obligation_id) = setup().await;
        let raw = body(json!([{
            "id": "evt_1",
            "type": "payment.confirmed",
            "payload": {"obligation_id": obligation_id, "amount": "100.00", "currency": "EUR"}
        }]));
        let signature = sign_payload(SECRET, &raw).unwrap();

        let first = processor.handle_webhook(Some(&signature), &raw).await.unwrap();
        assert_eq!(first.processed, 1);
        let second = processor.handle_webhook(Some(&signature), &raw).await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.duplicates, 1);

        let obligation = store.get_obligation(obligation_id).await.unwrap().unwrap();
        assert_eq!(obligation.state(), ObligationState::Settled);
    }

    #[tokio::test]
    async fn invalid_events_do_not_stop_the_batch() {
        let (processor, _, obligation_id) = setup().await;
        let raw = body(json!([
            {"id": "evt_bad", "type": "payment.exploded", "payload": {}},
            {"id": "evt_no_obligation", "type": "payment.failed", "payload": {"amount": "1"}},
            {"id": "evt_ok", "type": "payment.failed", "payload": {"obligation_id": obligation_id}}
        ]));
        let signature = sign_payload(SECRET, &raw).unwrap();

        let summary = processor.handle_webhook(Some(&signature), &raw).await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.errors.len(), 2);
        assert_eq!(summary.errors[0].scope, "event:evt_bad");
    }

    #[tokio::test]
    async fn non_array_body_is_a_bad_request() {
        let (processor, _, _) = setup().await;
        let raw = body(json!({"id": "evt_1"}));
        let signature = sign_payload(SECRET, &raw).unwrap();
        let err = processor.handle_webhook(Some(&signature), &raw).await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }
}
