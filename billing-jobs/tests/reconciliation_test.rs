//! External reconciliation integration tests.

mod common;

use billing_jobs::models::{Company, ObligationState};
use billing_jobs::services::providers::GatewayTransaction;
use billing_jobs::services::Store;
use chrono::{Duration, Utc};
use common::{eur, test_config, TestApp, BANK, CRON_SECRET};
use rust_decimal::Decimal;
use uuid::Uuid;

fn transaction(external_id: &str, amount: Decimal, reference: Option<&str>) -> GatewayTransaction {
    GatewayTransaction {
        external_id: external_id.to_string(),
        amount,
        currency: "eur".to_string(),
        booked_on: (Utc::now() - Duration::days(1)).date_naive(),
        reference: reference.map(String::from),
        counterparty: Some("Acme GmbH".to_string()),
    }
}

async fn banked_company(app: &TestApp, name: &str) -> Uuid {
    let mut company = Company::new(name, "billing@acme.test", "pro", "EUR", 1);
    company.bank_provider = Some(BANK.to_string());
    app.add_company(company).await
}

async fn exceptions(app: &TestApp, query: &str) -> serde_json::Value {
    let response = app
        .client
        .get(format!(
            "{}/api/reconciliation/exceptions{}",
            app.address, query
        ))
        .bearer_auth(CRON_SECRET)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), 200);
    response.json().await.expect("Failed to parse JSON")
}

#[tokio::test]
async fn exact_payment_settles_obligation_once() {
    let app = TestApp::spawn().await;
    let company_id = banked_company(&app, "Acme").await;
    let obligation_id = app
        .add_obligation(
            company_id,
            "INV-2001",
            eur(25000),
            Utc::now() - Duration::days(2),
        )
        .await;
    app.bank.add_transaction(
        company_id,
        transaction("tx-1", eur(25000), Some("Payment INV-2001")),
    );
    app.bank
        .add_transaction(company_id, transaction("tx-2", eur(99900), None));

    let first = app.cron_json("/api/cron/reconcile").await;
    assert_eq!(first["status"], "completed");
    assert_eq!(first["matched"], 1);
    assert_eq!(first["total"], 2);
    assert_eq!(first["unmatched"], 1);
    let result = &first["results"][0];
    assert_eq!(result["companyId"], company_id.to_string());
    assert_eq!(result["unmatched"][0]["externalId"], "tx-2");

    let obligation = app
        .store
        .get_obligation(obligation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(obligation.state(), ObligationState::Settled);

    let second = app.cron_json("/api/cron/reconcile").await;
    assert_eq!(second["matched"], 0);
    assert_eq!(second["total"], 1);
    assert_eq!(app.store.all_matches().await.len(), 1);
}

#[tokio::test]
async fn split_payments_are_applied_partially_then_settle() {
    let app = TestApp::spawn().await;
    let company_id = banked_company(&app, "Acme").await;
    let obligation_id = app
        .add_obligation(
            company_id,
            "INV-2002",
            eur(30000),
            Utc::now() - Duration::days(2),
        )
        .await;
    app.bank.add_transaction(
        company_id,
        transaction("tx-a", eur(10000), Some("INV-2002 part 1")),
    );

    let first = app.cron_json("/api/cron/reconcile").await;
    assert_eq!(first["partiallyMatched"], 1);
    let obligation = app
        .store
        .get_obligation(obligation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(obligation.state(), ObligationState::PartiallyMatched);
    assert_eq!(obligation.outstanding(), eur(20000));

    app.bank.add_transaction(
        company_id,
        transaction("tx-b", eur(20000), Some("INV-2002 part 2")),
    );
    let second = app.cron_json("/api/cron/reconcile").await;
    assert_eq!(second["matched"], 1);
    let obligation = app
        .store
        .get_obligation(obligation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(obligation.state(), ObligationState::Settled);
    assert_eq!(app.store.matches_for(obligation_id).await.len(), 2);
}

#[tokio::test]
async fn unknown_provider_fails_only_that_company() {
    let app = TestApp::spawn().await;
    let healthy = banked_company(&app, "Healthy").await;
    let mut broken = Company::new("Broken", "billing@broken.test", "pro", "EUR", 1);
    broken.bank_provider = Some("nonexistent".to_string());
    let broken_id = app.add_company(broken).await;

    app.add_obligation(healthy, "INV-3001", eur(1000), Utc::now() - Duration::days(1))
        .await;
    app.bank
        .add_transaction(healthy, transaction("tx-h", eur(1000), Some("INV-3001")));

    let body = app.cron_json("/api/cron/reconcile").await;
    assert_eq!(body["status"], "partial");
    assert_eq!(body["matched"], 1);
    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["scope"], format!("company:{}", broken_id));
}

#[tokio::test]
async fn unmatched_transactions_are_listed_as_exceptions() {
    let app = TestApp::spawn().await;
    let company_id = banked_company(&app, "Acme").await;
    app.bank
        .add_transaction(company_id, transaction("tx-orphan", eur(4200), None));

    app.cron_json(&format!("/api/cron/reconcile?company_id={}", company_id))
        .await;

    let response = app
        .client
        .get(format!(
            "{}/api/reconciliation/exceptions?company_id={}",
            app.address, company_id
        ))
        .bearer_auth(CRON_SECRET)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["exceptions"][0]["kind"], "unmatched_transaction");
    assert_eq!(body["exceptions"][0]["externalId"], "tx-orphan");
}

#[tokio::test]
async fn exceptions_require_authorization() {
    let app = TestApp::spawn().await;
    let response = app
        .client
        .get(format!("{}/api/reconciliation/exceptions", app.address))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn late_match_resolves_unmatched_exception() {
    let app = TestApp::spawn().await;
    let company_id = banked_company(&app, "Acme").await;
    app.bank.add_transaction(
        company_id,
        transaction("tx-late", eur(4200), Some("INV-5001")),
    );

    let first = app.cron_json("/api/cron/reconcile").await;
    assert_eq!(first["unmatched"], 1);

    app.add_obligation(company_id, "INV-5001", eur(4200), Utc::now() - Duration::days(1))
        .await;
    let second = app.cron_json("/api/cron/reconcile").await;
    assert_eq!(second["matched"], 1);

    let open = exceptions(&app, "").await;
    assert_eq!(open["count"], 0);

    let all = exceptions(&app, "?include_resolved=true").await;
    assert_eq!(all["count"], 1);
    assert_eq!(all["exceptions"][0]["externalId"], "tx-late");
    assert_eq!(all["exceptions"][0]["resolved"], true);
}

#[tokio::test]
async fn lookback_out_of_range_is_rejected() {
    let app = TestApp::spawn().await;
    banked_company(&app, "Acme").await;

    for days in ["0", "3651", "100000000", "9223372036854775807"] {
        let response = app
            .cron(&format!("/api/cron/reconcile?lookback_days={}", days))
            .await;
        assert_eq!(response.status(), 400, "lookback_days={}", days);
    }

    let body = app.cron_json("/api/cron/reconcile?lookback_days=3650").await;
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn exhausted_budget_leaves_companies_unreconciled() {
    let mut config = test_config();
    config.cron.reconcile_budget_secs = 0;
    let app = TestApp::spawn_with(config).await;
    let company_id = banked_company(&app, "Acme").await;
    let obligation_id = app
        .add_obligation(company_id, "INV-6001", eur(1000), Utc::now() - Duration::days(1))
        .await;
    app.bank
        .add_transaction(company_id, transaction("tx-b", eur(1000), Some("INV-6001")));

    let body = app.cron_json("/api/cron/reconcile").await;
    assert_eq!(body["partial"], true);
    assert_eq!(body["status"], "partial");
    assert_eq!(body["matched"], 0);
    assert!(app.store.matches_for(obligation_id).await.is_empty());
}
