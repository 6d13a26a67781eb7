//! Test helper module for billing-jobs integration tests.
//!
//! Spawns the service on a random port over the in-memory store, with a mock
//! bank/accounting gateway and a recording notifier.

#![allow(dead_code)]

use billing_jobs::config::BillingJobsConfig;
use billing_jobs::models::{Company, Obligation};
use billing_jobs::services::{
    init_metrics, Gateways, MemoryStore, MockGateway, RecordingNotifier,
};
use billing_jobs::startup::Application;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config::Config as CoreConfig;
use service_core::utils::signature::sign_payload;
use std::sync::Arc;
use uuid::Uuid;

pub const CRON_SECRET: &str = "cron-test-secret";
pub const WEBHOOK_SECRET: &str = "whsec-test-secret";
pub const SESSION_SECRET: &str = "session-test-secret";
pub const BANK: &str = "mockbank";
pub const BOOKS: &str = "mockbooks";

/// Configuration used by [`TestApp::spawn`].
pub fn test_config() -> BillingJobsConfig {
    let mut config = BillingJobsConfig {
        common: CoreConfig { port: 0 },
        service_name: "billing-jobs-test".to_string(),
        log_level: "warn".to_string(),
        ..Default::default()
    };
    config.cron.secret = Some(Secret::new(CRON_SECRET.to_string()));
    config.cron.session_jwt_secret = Some(Secret::new(SESSION_SECRET.to_string()));
    config.webhook.secret = Some(Secret::new(WEBHOOK_SECRET.to_string()));
    config
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub bank: Arc<MockGateway>,
    pub books: Arc<MockGateway>,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config()).await
    }

    pub async fn spawn_with(config: BillingJobsConfig) -> Self {
        init_metrics();

        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let bank = Arc::new(MockGateway::new(BANK));
        let books = Arc::new(MockGateway::new(BOOKS));

        let mut gateways = Gateways::default();
        gateways.banks.register(BANK, bank.clone());
        gateways.accounting.register(BOOKS, books.clone());

        let app = Application::build_with(config, store.clone(), notifier.clone(), gateways)
            .await
            .expect("Failed to build test application");
        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        for _ in 0..50 {
            if client
                .get(format!("{}/health", address))
                .send()
                .await
                .is_ok()
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        Self {
            address,
            port,
            store,
            notifier,
            bank,
            books,
            client,
        }
    }

    /// Call a cron endpoint as the scheduler.
    pub async fn cron(&self, path: &str) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.address, path))
            .bearer_auth(CRON_SECRET)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn cron_json(&self, path: &str) -> serde_json::Value {
        let response = self.cron(path).await;
        assert_eq!(response.status(), 200, "unexpected status for {}", path);
        response.json().await.expect("Failed to parse JSON")
    }

    /// Post a signed webhook body.
    pub async fn webhook(&self, body: &serde_json::Value) -> reqwest::Response {
        let raw = serde_json::to_vec(body).expect("Failed to encode body");
        let signature = sign_payload(WEBHOOK_SECRET, &raw).expect("Failed to sign body");
        self.client
            .post(format!("{}/api/webhooks/payments", self.address))
            .header("Webhook-Signature", signature)
            .header("Content-Type", "application/json")
            .body(raw)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn add_company(&self, company: Company) -> Uuid {
        let id = company.company_id;
        self.store.insert_company(company).await;
        id
    }

    pub async fn add_obligation(
        &self,
        company_id: Uuid,
        reference: &str,
        amount: Decimal,
        due_utc: DateTime<Utc>,
    ) -> Uuid {
        let obligation = Obligation::manual(company_id, Some(reference), amount, "EUR", due_utc);
        let id = obligation.obligation_id;
        self.store.insert_obligation(obligation).await;
        id
    }
}

/// An HS256 session token as issued by the operator console.
pub fn session_token(role: &str, company_id: Option<Uuid>) -> String {
    let claims = serde_json::json!({
        "sub": "operator@example.test",
        "role": role,
        "company_id": company_id,
        "exp": (Utc::now() + chrono::Duration::hours(1)).timestamp(),
    });
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SESSION_SECRET.as_bytes()),
    )
    .expect("Failed to sign session token")
}

pub fn eur(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}
