//! External gateway collaborators (banks, payment processors, accounting systems).
//!
//! Engines only see the capability traits below; provider-specific auth and
//! formatting stay inside each implementation.

pub mod http;
pub mod mock;

use crate::config::{GatewayConfig, GatewayKind};
use crate::error::JobError;
use crate::models::{InvoiceLine, TransactionWindow};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use http::HttpGateway;
pub use mock::MockGateway;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<GatewayError> for JobError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Configuration(msg) => JobError::Configuration(msg),
            other => JobError::TransientIo(other.to_string()),
        }
    }
}

/// A transaction as reported by a gateway, before it is tied to a company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayTransaction {
    pub external_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub booked_on: NaiveDate,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub counterparty: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Invoice pushed to an external system.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceRequest {
    pub customer_id: Option<String>,
    pub reference: String,
    pub currency: String,
    pub total_amount: Decimal,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub lines: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedInvoice {
    pub external_id: String,
}

/// Customer record mirrored into an accounting system.
#[derive(Debug, Clone, Serialize)]
pub struct CustomerRecord {
    pub company_id: Uuid,
    pub name: String,
    pub email: String,
    pub currency: String,
    pub existing_id: Option<String>,
}

/// Contract shared by every gateway.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    fn name(&self) -> &str;

    async fn test_connection(&self) -> Result<ConnectionStatus, GatewayError>;

    /// Transactions booked for the company's account inside `window`.
    async fn list_transactions(
        &self,
        company_id: Uuid,
        window: &TransactionWindow,
    ) -> Result<Vec<GatewayTransaction>, GatewayError>;

    async fn create_invoice(&self, invoice: &InvoiceRequest)
        -> Result<CreatedInvoice, GatewayError>;
}

/// Accounting systems also keep a customer directory.
#[async_trait]
pub trait AccountingProvider: GatewayClient {
    /// Create or update the customer; returns the provider's customer id.
    async fn sync_customer(&self, customer: &CustomerRecord) -> Result<String, GatewayError>;
}

/// Providers keyed by configured name.
pub struct ProviderRegistry<T: ?Sized> {
    providers: HashMap<String, Arc<T>>,
}

impl<T: ?Sized> Default for ProviderRegistry<T> {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }
}

impl<T: ?Sized> ProviderRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<T>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.providers.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Bank and accounting registries built from configuration.
#[derive(Default)]
pub struct Gateways {
    pub banks: ProviderRegistry<dyn GatewayClient>,
    pub accounting: ProviderRegistry<dyn AccountingProvider>,
}

impl Gateways {
    /// `base_url = "mock"` registers an in-process [`MockGateway`].
    pub fn from_config(configs: &[GatewayConfig], timeout: Duration) -> Self {
        let mut gateways = Self::default();
        for config in configs {
            match config.kind {
                GatewayKind::Bank => {
                    let client: Arc<dyn GatewayClient> = if config.base_url == "mock" {
                        Arc::new(MockGateway::new(&config.name))
                    } else {
                        Arc::new(HttpGateway::new(
                            &config.name,
                            &config.base_url,
                            config.api_key.clone(),
                            timeout,
                        ))
                    };
                    gateways.banks.register(config.name.clone(), client);
                }
                GatewayKind::Accounting => {
                    let provider: Arc<dyn AccountingProvider> = if config.base_url == "mock" {
                        Arc::new(MockGateway::new(&config.name))
                    } else {
                        Arc::new(HttpGateway::new(
                            &config.name,
                            &config.base_url,
                            config.api_key.clone(),
                            timeout,
                        ))
                    };
                    gateways.accounting.register(config.name.clone(), provider);
                }
            }
        }
        gateways
    }
}
