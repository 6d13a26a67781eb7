//! Outbound notification collaborator.

use crate::error::JobError;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::observability::TracedClientExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

pub const PAYMENT_REMINDER_TEMPLATE: &str = "payment_reminder";
pub const PAYMENT_FAILED_TEMPLATE: &str = "payment_failed";
pub const USAGE_ALERT_TEMPLATE: &str = "usage_alert";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Send error: {0}")]
    SendFailed(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}

impl From<NotifyError> for JobError {
    fn from(err: NotifyError) -> Self {
        match err {
            NotifyError::InvalidRecipient(msg) => JobError::Validation(msg),
            other => JobError::TransientIo(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub success: bool,
    #[serde(default)]
    pub notification_id: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        template: &str,
        data: &Value,
    ) -> Result<NotifyResponse, NotifyError>;
}

#[derive(Debug, Serialize)]
struct TemplatedRequest<'a> {
    to: &'a str,
    template: &'a str,
    data: &'a Value,
}

/// Posts templated notifications to the notification service.
pub struct HttpNotifier {
    client: Client,
    base_url: String,
    api_key: Option<Secret<String>>,
}

impl HttpNotifier {
    pub fn new(base_url: &str, api_key: Option<Secret<String>>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    #[tracing::instrument(skip(self, data), fields(template = %template))]
    async fn send(
        &self,
        recipient: &str,
        template: &str,
        data: &Value,
    ) -> Result<NotifyResponse, NotifyError> {
        if recipient.trim().is_empty() {
            return Err(NotifyError::InvalidRecipient("empty recipient".to_string()));
        }

        let mut request = self
            .client
            .post(format!("{}/api/notifications/templated", self.base_url))
            .json(&TemplatedRequest {
                to: recipient,
                template,
                data,
            })
            .with_trace_context();
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::SendFailed(format!("{}: {}", status, body)));
        }

        let notification_id = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("notification_id").and_then(|id| id.as_str().map(String::from)));

        Ok(NotifyResponse {
            success: true,
            notification_id,
        })
    }
}

/// Logs notifications instead of sending them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        recipient: &str,
        template: &str,
        data: &Value,
    ) -> Result<NotifyResponse, NotifyError> {
        tracing::info!(
            to = %recipient,
            template = %template,
            data = %data,
            "[LOG] Notification would be sent"
        );
        Ok(NotifyResponse {
            success: true,
            notification_id: None,
        })
    }
}

/// A notification captured by [`RecordingNotifier`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub recipient: String,
    pub template: String,
    pub data: Value,
}

/// Records every call; can be switched to fail for delivery-failure paths.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_with_template(&self, template: &str) -> Vec<SentNotification> {
        self.sent()
            .into_iter()
            .filter(|n| n.template == template)
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        recipient: &str,
        template: &str,
        data: &Value,
    ) -> Result<NotifyResponse, NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::SendFailed("recording notifier set to fail".to_string()));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentNotification {
                recipient: recipient.to_string(),
                template: template.to_string(),
                data: data.clone(),
            });
        }
        Ok(NotifyResponse {
            success: true,
            notification_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn http_notifier_posts_template_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/notifications/templated"))
            .and(header("authorization", "Bearer notify-key"))
            .and(body_partial_json(json!({
                "to": "billing@acme.test",
                "template": "payment_reminder"
            })))
            .respond_with(
                ResponseTemplate::new(202).set_body_json(json!({"notification_id": "n-1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(
            &server.uri(),
            Some(Secret::new("notify-key".to_string())),
            Duration::from_secs(5),
        );
        let response = notifier
            .send("billing@acme.test", PAYMENT_REMINDER_TEMPLATE, &json!({"amount": "10.00"}))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.notification_id.as_deref(), Some("n-1"));
    }

    #[tokio::test]
    async fn http_notifier_surfaces_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = HttpNotifier::new(&server.uri(), None, Duration::from_secs(5));
        let err = notifier
            .send("billing@acme.test", PAYMENT_REMINDER_TEMPLATE, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::SendFailed(_)));
    }

    #[tokio::test]
    async fn recording_notifier_can_fail() {
        let notifier = RecordingNotifier::new();
        notifier.send("a@b.test", "t", &json!({})).await.unwrap();
        notifier.set_failing(true);
        assert!(notifier.send("a@b.test", "t", &json!({})).await.is_err());
        assert_eq!(notifier.sent().len(), 1);
    }
}
