//! Services module for billing-jobs.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod providers;
pub mod store;

pub use database::PgStore;
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use notifier::{HttpNotifier, LogNotifier, Notifier, NotifyError, RecordingNotifier};
pub use providers::{
    AccountingProvider, GatewayClient, GatewayError, Gateways, MockGateway, ProviderRegistry,
};
pub use store::Store;
