//! In-process gateway for local runs and tests.

use super::{
    AccountingProvider, ConnectionStatus, CreatedInvoice, CustomerRecord, GatewayClient,
    GatewayError, GatewayTransaction, InvoiceRequest,
};
use crate::models::TransactionWindow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Mock gateway serving seeded transactions.
pub struct MockGateway {
    name: String,
    connected: AtomicBool,
    delay: Mutex<Option<Duration>>,
    transactions: Mutex<HashMap<Uuid, Vec<GatewayTransaction>>>,
    invoices: Mutex<Vec<InvoiceRequest>>,
    customers: Mutex<Vec<CustomerRecord>>,
    counter: AtomicU64,
}

impl MockGateway {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connected: AtomicBool::new(true),
            delay: Mutex::new(None),
            transactions: Mutex::new(HashMap::new()),
            invoices: Mutex::new(Vec::new()),
            customers: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }

    pub fn add_transaction(&self, company_id: Uuid, transaction: GatewayTransaction) {
        if let Ok(mut map) = self.transactions.lock() {
            map.entry(company_id).or_default().push(transaction);
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every call sleep first, to exercise caller timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut d) = self.delay.lock() {
            *d = delay;
        }
    }

    pub fn invoices(&self) -> Vec<InvoiceRequest> {
        self.invoices.lock().map(|i| i.clone()).unwrap_or_default()
    }

    pub fn customers(&self) -> Vec<CustomerRecord> {
        self.customers.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn pause(&self) {
        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!(
            "mock-{}-{}",
            prefix,
            self.counter.fetch_add(1, Ordering::SeqCst) + 1
        )
    }

    fn ensure_connected(&self) -> Result<(), GatewayError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::Connection(format!(
                "mock gateway '{}' is offline",
                self.name
            )))
        }
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    fn name(&self) -> &str {
        &self.name
    }

    async fn test_connection(&self) -> Result<ConnectionStatus, GatewayError> {
        self.pause().await;
        let connected = self.connected.load(Ordering::SeqCst);
        Ok(ConnectionStatus {
            success: connected,
            message: (!connected).then(|| "mock gateway offline".to_string()),
        })
    }

    async fn list_transactions(
        &self,
        company_id: Uuid,
        window: &TransactionWindow,
    ) -> Result<Vec<GatewayTransaction>, GatewayError> {
        self.pause().await;
        self.ensure_connected()?;
        let map = self
            .transactions
            .lock()
            .map_err(|_| GatewayError::Connection("mock state poisoned".to_string()))?;
        Ok(map
            .get(&company_id)
            .map(|txs| {
                txs.iter()
                    .filter(|t| window.contains_date(t.booked_on))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_invoice(
        &self,
        invoice: &InvoiceRequest,
    ) -> Result<CreatedInvoice, GatewayError> {
        self.pause().await;
        self.ensure_connected()?;
        if let Ok(mut invoices) = self.invoices.lock() {
            invoices.push(invoice.clone());
        }
        tracing::info!(
            gateway = %self.name,
            reference = %invoice.reference,
            "[MOCK] Invoice would be created"
        );
        Ok(CreatedInvoice {
            external_id: self.next_id("inv"),
        })
    }
}

#[async_trait]
impl AccountingProvider for MockGateway {
    async fn sync_customer(&self, customer: &CustomerRecord) -> Result<String, GatewayError> {
        self.pause().await;
        self.ensure_connected()?;
        if let Ok(mut customers) = self.customers.lock() {
            customers.push(customer.clone());
        }
        Ok(customer
            .existing_id
            .clone()
            .unwrap_or_else(|| self.next_id("cus")))
    }
}
