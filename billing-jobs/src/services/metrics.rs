//! Metrics module for billing-jobs.
//! Provides Prometheus metrics for scheduled jobs and webhook ingestion.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Store query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_jobs_db_query_duration_seconds",
            "Store query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Job runs by kind and final status
pub static JOB_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Job run duration histogram
pub static JOB_RUN_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Overage invoices created
pub static INVOICES_CREATED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Reminders by escalation and delivery status
pub static REMINDERS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Reconciliation matches by type
pub static MATCHES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Webhook events by type and outcome
pub static WEBHOOK_EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    JOB_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_jobs_runs_total", "Total job runs by kind and status"),
            &["job", "status"]
        )
        .expect("Failed to register JOB_RUNS_TOTAL")
    });

    JOB_RUN_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "billing_jobs_run_duration_seconds",
                "Job run duration",
                vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]
            ),
            &["job"]
        )
        .expect("Failed to register JOB_RUN_DURATION")
    });

    INVOICES_CREATED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_jobs_overage_invoices_total",
                "Overage invoices created by currency"
            ),
            &["currency"]
        )
        .expect("Failed to register INVOICES_CREATED_TOTAL")
    });

    REMINDERS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_jobs_reminders_total",
                "Payment reminders by escalation and delivery status"
            ),
            &["escalation", "status"]
        )
        .expect("Failed to register REMINDERS_TOTAL")
    });

    MATCHES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_jobs_reconciliation_matches_total",
                "Reconciliation results by type"
            ),
            &["result"]
        )
        .expect("Failed to register MATCHES_TOTAL")
    });

    WEBHOOK_EVENTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_jobs_webhook_events_total",
                "Webhook events by type and outcome"
            ),
            &["event_type", "outcome"]
        )
        .expect("Failed to register WEBHOOK_EVENTS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("billing_jobs_errors_total", "Total unit errors by kind for alerting"),
            &["error_kind", "job"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record a finished job run.
pub fn record_job_run(job: &str, status: &str, duration_secs: f64) {
    if let Some(counter) = JOB_RUNS_TOTAL.get() {
        counter.with_label_values(&[job, status]).inc();
    }
    if let Some(histogram) = JOB_RUN_DURATION.get() {
        histogram.with_label_values(&[job]).observe(duration_secs);
    }
}

/// Record an overage invoice.
pub fn record_invoice_created(currency: &str) {
    if let Some(counter) = INVOICES_CREATED_TOTAL.get() {
        counter.with_label_values(&[currency]).inc();
    }
}

/// Record a reminder attempt.
pub fn record_reminder(escalation: &str, status: &str) {
    if let Some(counter) = REMINDERS_TOTAL.get() {
        counter.with_label_values(&[escalation, status]).inc();
    }
}

/// Record a reconciliation result (`matched`, `partial`, `ambiguous`, `unmatched`, `stale`).
pub fn record_match(result: &str, count: u64) {
    if let Some(counter) = MATCHES_TOTAL.get() {
        counter.with_label_values(&[result]).inc_by(count);
    }
}

/// Record a webhook event outcome.
pub fn record_webhook_event(event_type: &str, outcome: &str) {
    if let Some(counter) = WEBHOOK_EVENTS_TOTAL.get() {
        counter.with_label_values(&[event_type, outcome]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_kind: &str, job: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_kind, job]).inc();
    }
}
