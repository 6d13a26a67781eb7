//! Application startup and lifecycle management.

use crate::config::BillingJobsConfig;
use crate::handlers::{
    get_job_run, health_check, list_exceptions, metrics_handler, readiness_check,
    receive_payment_webhook, run_accounting_sync, run_overages, run_reconcile, run_reminders,
};
use crate::jobs::{AccountingSync, CronGate, OverageEngine, ReconciliationEngine, ReminderEngine};
use crate::services::{
    init_metrics, Gateways, HttpNotifier, LogNotifier, MemoryStore, Notifier, PgStore, Store,
};
use crate::webhooks::WebhookProcessor;
use axum::{
    extract::FromRef,
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::tracing::{request_id_middleware, request_span};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BillingJobsConfig>,
    pub store: Arc<dyn Store>,
    pub gate: Arc<CronGate>,
    pub overages: Arc<OverageEngine>,
    pub reminders: Arc<ReminderEngine>,
    pub reconciliation: Arc<ReconciliationEngine>,
    pub accounting: Arc<AccountingSync>,
    pub webhooks: Arc<WebhookProcessor>,
}

impl FromRef<AppState> for Arc<CronGate> {
    fn from_ref(state: &AppState) -> Self {
        state.gate.clone()
    }
}

impl AppState {
    pub fn new(
        config: BillingJobsConfig,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        gateways: Gateways,
    ) -> Self {
        let Gateways { banks, accounting } = gateways;
        let banks = Arc::new(banks);
        let accounting = Arc::new(accounting);

        Self {
            gate: Arc::new(CronGate::from_config(&config)),
            overages: Arc::new(OverageEngine::new(store.clone(), notifier.clone(), &config)),
            reminders: Arc::new(ReminderEngine::new(store.clone(), notifier.clone(), &config)),
            reconciliation: Arc::new(ReconciliationEngine::new(store.clone(), banks, &config)),
            accounting: Arc::new(AccountingSync::new(store.clone(), accounting, &config)),
            webhooks: Arc::new(WebhookProcessor::new(store.clone(), notifier, &config)),
            store,
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/cron/overages", get(run_overages).post(run_overages))
        .route("/api/cron/reminders", get(run_reminders).post(run_reminders))
        .route("/api/cron/reconcile", get(run_reconcile).post(run_reconcile))
        .route(
            "/api/cron/accounting-sync",
            get(run_accounting_sync).post(run_accounting_sync),
        )
        .route("/api/webhooks/payments", post(receive_payment_webhook))
        .route("/api/reconciliation/exceptions", get(list_exceptions))
        .route("/api/job-runs/:run_id", get(get_job_run))
        .layer(TraceLayer::new_for_http().make_span_with(request_span::<axum::body::Body>))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build from configuration: PostgreSQL when `database.url` is set,
    /// otherwise the in-memory store.
    pub async fn build(config: BillingJobsConfig) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn Store> = match &config.database.url {
            Some(url) => {
                let db = PgStore::new(
                    url.expose_secret(),
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;
                db.run_migrations().await.map_err(|e| {
                    tracing::error!(error = %e, "Failed to run migrations");
                    e
                })?;
                Arc::new(db)
            }
            None => {
                tracing::warn!("No database.url configured, using the in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let notifier: Arc<dyn Notifier> = match &config.notifications.url {
            Some(url) => Arc::new(HttpNotifier::new(
                url,
                config.notifications.api_key.clone(),
                config.cron.call_timeout(),
            )),
            None => {
                tracing::warn!("No notifications.url configured, notifications are only logged");
                Arc::new(LogNotifier)
            }
        };

        let gateways = Gateways::from_config(&config.gateways, config.cron.call_timeout());
        tracing::info!(
            banks = gateways.banks.len(),
            accounting = gateways.accounting.len(),
            "Gateways registered"
        );

        Self::build_with(config, store, notifier, gateways).await
    }

    /// Build with explicit collaborators. Port 0 binds a random port.
    pub async fn build_with(
        config: BillingJobsConfig,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        gateways: Gateways,
    ) -> Result<Self, AppError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();
        tracing::info!(port = port, "Billing jobs listener bound");

        Ok(Self {
            port,
            listener,
            state: AppState::new(config, store, notifier, gateways),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        tracing::info!(
            service = %self.state.config.service_name,
            version = env!("CARGO_PKG_VERSION"),
            port = self.port,
            "Service ready to accept connections"
        );
        axum::serve(self.listener, build_router(self.state)).await
    }
}
