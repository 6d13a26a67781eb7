pub mod cron;
pub mod health;
pub mod reports;
pub mod webhooks;

pub use cron::{run_accounting_sync, run_overages, run_reconcile, run_reminders};
pub use health::{health_check, metrics_handler, readiness_check};
pub use reports::{get_job_run, list_exceptions};
pub use webhooks::receive_payment_webhook;
