use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::HashSet;
use std::time::Duration;

/// Upper bound on a reconciliation lookback, in days.
pub const MAX_LOOKBACK_DAYS: i64 = 3650;

/// Keys read from comma separated environment values.
const LIST_KEYS: &[&str] = &[
    "cron.privileged_roles",
    "reminders.offsets_days",
    "usage.alert_thresholds_pct",
];

#[derive(Debug, Clone, Deserialize)]
pub struct BillingJobsConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub reminders: ReminderConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Without a URL the service runs on the in-memory store (never in production).
    #[serde(default)]
    pub url: Option<Secret<String>>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CronConfig {
    #[serde(default)]
    pub secret: Option<Secret<String>>,
    /// HS256 key for operator session tokens. Unset disables session access.
    #[serde(default)]
    pub session_jwt_secret: Option<Secret<String>>,
    #[serde(default = "default_privileged_roles")]
    pub privileged_roles: Vec<String>,
    #[serde(default = "default_overage_budget")]
    pub overage_budget_secs: u64,
    #[serde(default = "default_reminder_budget")]
    pub reminder_budget_secs: u64,
    #[serde(default = "default_reconcile_budget")]
    pub reconcile_budget_secs: u64,
    #[serde(default = "default_sync_budget")]
    pub sync_budget_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            secret: None,
            session_jwt_secret: None,
            privileged_roles: default_privileged_roles(),
            overage_budget_secs: default_overage_budget(),
            reminder_budget_secs: default_reminder_budget(),
            reconcile_budget_secs: default_reconcile_budget(),
            sync_budget_secs: default_sync_budget(),
            max_concurrency: default_max_concurrency(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl CronConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub secret: Option<Secret<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReminderConfig {
    /// Days relative to the due date; negative values are before it.
    #[serde(default = "default_offsets")]
    pub offsets_days: Vec<i32>,
    #[serde(default = "default_tolerance_hours")]
    pub tolerance_hours: i64,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            offsets_days: default_offsets(),
            tolerance_hours: default_tolerance_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "default_thresholds")]
    pub alert_thresholds_pct: Vec<u32>,
    /// Days between period close and the overage obligation's due date.
    #[serde(default = "default_payment_terms")]
    pub payment_terms_days: i64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            alert_thresholds_pct: default_thresholds(),
            payment_terms_days: default_payment_terms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_amount_tolerance")]
    pub amount_tolerance: Decimal,
    #[serde(default = "default_date_slack")]
    pub date_slack_days: i64,
    #[serde(default)]
    pub require_reference: bool,
    #[serde(default = "default_lookback")]
    pub default_lookback_days: i64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            amount_tolerance: default_amount_tolerance(),
            date_slack_days: default_date_slack(),
            require_reference: false,
            default_lookback_days: default_lookback(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationsConfig {
    /// Base URL of the notification service. Unset logs notifications instead.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<Secret<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayKind {
    Bank,
    Accounting,
}

/// An external provider reachable over HTTP, or `mock` for local runs.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub name: String,
    pub kind: GatewayKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<Secret<String>>,
}

impl BillingJobsConfig {
    pub fn load() -> Result<Self, AppError> {
        let config: Self = core_config::load_layered("BILLING", LIST_KEYS)?;
        config.validate()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.as_str(), "production" | "prod")
    }

    /// Fail-fast checks run once at start-up.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut problems = Vec::new();

        if self.is_production() {
            if is_blank(&self.cron.secret) {
                problems.push("cron.secret is required in production".to_string());
            }
            if is_blank(&self.webhook.secret) {
                problems.push("webhook.secret is required in production".to_string());
            }
            if is_blank(&self.database.url) {
                problems.push("database.url is required in production".to_string());
            }
        }

        if self.reminders.offsets_days.is_empty() {
            problems.push("reminders.offsets_days must not be empty".to_string());
        }
        if self.reminders.tolerance_hours <= 0 {
            problems.push("reminders.tolerance_hours must be positive".to_string());
        }
        if self.matching.amount_tolerance < Decimal::ZERO {
            problems.push("matching.amount_tolerance must not be negative".to_string());
        }
        if self.matching.date_slack_days < 0 {
            problems.push("matching.date_slack_days must not be negative".to_string());
        }
        if self.matching.default_lookback_days <= 0 {
            problems.push("matching.default_lookback_days must be positive".to_string());
        }
        if self.matching.default_lookback_days > MAX_LOOKBACK_DAYS {
            problems.push(format!(
                "matching.default_lookback_days must not exceed {}",
                MAX_LOOKBACK_DAYS
            ));
        }
        for (name, secs) in [
            ("overage_budget_secs", self.cron.overage_budget_secs),
            ("reminder_budget_secs", self.cron.reminder_budget_secs),
            ("reconcile_budget_secs", self.cron.reconcile_budget_secs),
            ("sync_budget_secs", self.cron.sync_budget_secs),
            ("call_timeout_secs", self.cron.call_timeout_secs),
        ] {
            if secs == 0 {
                problems.push(format!("cron.{} must be positive", name));
            }
        }
        if self.cron.max_concurrency == 0 {
            problems.push("cron.max_concurrency must be positive".to_string());
        }
        if self.usage.alert_thresholds_pct.iter().any(|t| *t == 0) {
            problems.push("usage.alert_thresholds_pct entries must be positive".to_string());
        }

        let mut names = HashSet::new();
        for gateway in &self.gateways {
            if !names.insert(gateway.name.as_str()) {
                problems.push(format!("gateway name '{}' is configured twice", gateway.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(AppError::ConfigError(anyhow::anyhow!(problems.join("; "))))
        }
    }
}

impl Default for BillingJobsConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            service_name: default_service_name(),
            environment: default_environment(),
            log_level: default_log_level(),
            otlp_endpoint: None,
            database: DatabaseConfig::default(),
            cron: CronConfig::default(),
            webhook: WebhookConfig::default(),
            reminders: ReminderConfig::default(),
            usage: UsageConfig::default(),
            matching: MatchingConfig::default(),
            notifications: NotificationsConfig::default(),
            gateways: Vec::new(),
        }
    }
}

fn is_blank(secret: &Option<Secret<String>>) -> bool {
    secret
        .as_ref()
        .map(|s| s.expose_secret().trim().is_empty())
        .unwrap_or(true)
}

fn default_service_name() -> String {
    "billing-jobs".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_privileged_roles() -> Vec<String> {
    vec!["admin".to_string(), "billing_admin".to_string()]
}

fn default_overage_budget() -> u64 {
    240
}

fn default_reminder_budget() -> u64 {
    120
}

fn default_reconcile_budget() -> u64 {
    240
}

fn default_sync_budget() -> u64 {
    240
}

fn default_max_concurrency() -> usize {
    5
}

fn default_call_timeout() -> u64 {
    15
}

fn default_offsets() -> Vec<i32> {
    vec![-3, 0, 7, 15, 30]
}

fn default_tolerance_hours() -> i64 {
    12
}

fn default_thresholds() -> Vec<u32> {
    vec![80, 100]
}

fn default_payment_terms() -> i64 {
    14
}

fn default_amount_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

fn default_date_slack() -> i64 {
    5
}

fn default_lookback() -> i64 {
    30
}
