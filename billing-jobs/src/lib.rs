//! billing-jobs: cron-driven usage billing, payment reminders and external
//! reconciliation for multi-tenant companies.

pub mod config;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod models;
pub mod services;
pub mod startup;
pub mod webhooks;
