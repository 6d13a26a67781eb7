//! Overage invoicing and usage alert integration tests.

mod common;

use billing_jobs::models::Company;
use chrono::{TimeZone, Utc};
use common::{eur, test_config, TestApp};
use rust_decimal::Decimal;

async fn seed_pro_plan(app: &TestApp) {
    app.store
        .set_usage_limit("pro", "api_calls", Decimal::from(1000))
        .await;
    app.store
        .set_overage_rate("pro", "api_calls", Decimal::new(1, 2))
        .await;
}

#[tokio::test]
async fn overage_invoice_is_created_once_per_period() {
    let app = TestApp::spawn().await;
    seed_pro_plan(&app).await;
    let company_id = app
        .add_company(Company::new("Acme", "billing@acme.test", "pro", "EUR", 1))
        .await;
    app.store
        .record_usage(
            company_id,
            "api_calls",
            Decimal::from(1500),
            Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
        )
        .await;

    let first = app
        .cron_json("/api/cron/overages?period_end=2025-02-01")
        .await;
    assert_eq!(first["success"], true);
    assert_eq!(first["status"], "completed");
    assert_eq!(first["invoicesCreated"], 1);

    let second = app
        .cron_json("/api/cron/overages?period_end=2025-02-01")
        .await;
    assert_eq!(second["invoicesCreated"], 0);
    assert_eq!(second["invoicesSkipped"], 1);

    let invoices = app.store.invoices_for(company_id).await;
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].total_amount, eur(500));
    assert_eq!(
        invoices[0].period_start,
        chrono::NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    );
}

#[tokio::test]
async fn usage_within_allotment_creates_no_invoice() {
    let app = TestApp::spawn().await;
    seed_pro_plan(&app).await;
    let company_id = app
        .add_company(Company::new("Small", "billing@small.test", "pro", "EUR", 1))
        .await;
    app.store
        .record_usage(
            company_id,
            "api_calls",
            Decimal::from(400),
            Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
        )
        .await;

    let body = app
        .cron_json("/api/cron/overages?period_end=2025-02-01")
        .await;
    assert_eq!(body["invoicesCreated"], 0);
    assert!(app.store.invoices_for(company_id).await.is_empty());
}

#[tokio::test]
async fn one_misconfigured_company_does_not_block_others() {
    let app = TestApp::spawn().await;
    seed_pro_plan(&app).await;
    app.store
        .set_usage_limit("broken", "storage_gb", Decimal::from(10))
        .await;

    let good = app
        .add_company(Company::new("Good", "billing@good.test", "pro", "EUR", 1))
        .await;
    let bad = app
        .add_company(Company::new("Bad", "billing@bad.test", "broken", "EUR", 1))
        .await;
    let in_period = Utc.with_ymd_and_hms(2025, 1, 20, 8, 0, 0).unwrap();
    app.store
        .record_usage(good, "api_calls", Decimal::from(2000), in_period)
        .await;
    app.store
        .record_usage(bad, "storage_gb", Decimal::from(25), in_period)
        .await;

    let body = app
        .cron_json("/api/cron/overages?period_end=2025-02-01")
        .await;

    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "partial");
    assert_eq!(body["invoicesCreated"], 1);
    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["scope"], format!("company:{}", bad));
    assert_eq!(errors[0]["kind"], "configuration");

    assert_eq!(app.store.invoices_for(good).await.len(), 1);
    assert!(app.store.invoices_for(bad).await.is_empty());
}

#[tokio::test]
async fn usage_alert_is_sent_once_per_threshold() {
    let app = TestApp::spawn().await;
    seed_pro_plan(&app).await;
    let company_id = app
        .add_company(Company::new("Acme", "billing@acme.test", "pro", "EUR", 1))
        .await;
    app.store
        .record_usage(
            company_id,
            "api_calls",
            Decimal::from(850),
            Utc.with_ymd_and_hms(2025, 2, 10, 12, 0, 0).unwrap(),
        )
        .await;

    let first = app
        .cron_json("/api/cron/overages?period_end=2025-02-01")
        .await;
    assert_eq!(first["alertsSent"], 1);
    let second = app
        .cron_json("/api/cron/overages?period_end=2025-02-01")
        .await;
    assert_eq!(second["alertsSent"], 0);

    let alerts = app.notifier.sent_with_template("usage_alert");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].recipient, "billing@acme.test");
    assert_eq!(alerts[0].data["threshold_pct"], 80);
}

#[tokio::test]
async fn job_run_is_recorded() {
    let app = TestApp::spawn().await;
    let body = app
        .cron_json("/api/cron/overages?period_end=2025-02-01")
        .await;
    let run_id = body["runId"].as_str().expect("runId missing");

    let response = app
        .client
        .get(format!("{}/api/job-runs/{}", app.address, run_id))
        .bearer_auth(common::CRON_SECRET)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), 200);
    let run: serde_json::Value = response.json().await.unwrap();
    assert_eq!(run["jobKind"], "overages");
    assert_eq!(run["status"], "completed");

    let missing = app
        .client
        .get(format!("{}/api/job-runs/{}", app.address, uuid::Uuid::new_v4()))
        .bearer_auth(common::CRON_SECRET)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn concurrent_runs_create_one_invoice() {
    let app = TestApp::spawn().await;
    seed_pro_plan(&app).await;
    let company_id = app
        .add_company(Company::new("Acme", "billing@acme.test", "pro", "EUR", 1))
        .await;
    app.store
        .record_usage(
            company_id,
            "api_calls",
            Decimal::from(1500),
            Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
        )
        .await;

    let path = "/api/cron/overages?period_end=2025-02-01";
    let (first, second) = tokio::join!(app.cron_json(path), app.cron_json(path));

    let created = first["invoicesCreated"].as_u64().unwrap()
        + second["invoicesCreated"].as_u64().unwrap();
    let skipped = first["invoicesSkipped"].as_u64().unwrap()
        + second["invoicesSkipped"].as_u64().unwrap();
    assert_eq!(created, 1);
    assert_eq!(skipped, 1);
    assert_eq!(app.store.invoices_for(company_id).await.len(), 1);
}

#[tokio::test]
async fn exhausted_budget_stops_before_next_company() {
    let mut config = test_config();
    config.cron.overage_budget_secs = 0;
    let app = TestApp::spawn_with(config).await;
    seed_pro_plan(&app).await;
    let company_id = app
        .add_company(Company::new("Acme", "billing@acme.test", "pro", "EUR", 1))
        .await;
    app.store
        .record_usage(
            company_id,
            "api_calls",
            Decimal::from(1500),
            Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap(),
        )
        .await;

    let body = app
        .cron_json("/api/cron/overages?period_end=2025-02-01")
        .await;
    assert_eq!(body["success"], true);
    assert_eq!(body["partial"], true);
    assert_eq!(body["status"], "partial");
    assert_eq!(body["invoicesCreated"], 0);
    assert!(app.store.invoices_for(company_id).await.is_empty());
}
