//! PostgreSQL store for billing-jobs.

use crate::error::UnitError;
use crate::models::{
    invoice_reference, BillingPeriod, Company, DeliveryStatus, ExternalTransaction, JobKind,
    JobRun, JobRunDetail, JobRunError, JobRunStatus, JobRunUpdate, ListExceptionsFilter,
    MatchOutcome, MatchSet, NewException, NewOverageInvoice, Obligation, ObligationEvent,
    ObligationKind, ObligationState, OverageInvoice, OverageRate, ReconciliationException,
    ReminderClaim, ResourceUsage, Transition, UsageLimit, UsageSnapshot, WebhookCommand,
    WebhookOutcome,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const OBLIGATION_COLUMNS: &str = "obligation_id, company_id, kind, reference, amount, amount_matched, currency, due_utc, state, settled_utc, created_utc, updated_utc";

const INVOICE_COLUMNS: &str = "invoice_id, company_id, period_start, period_end, obligation_id, currency, total_amount, lines, external_id, created_utc, updated_utc";

const COMPANY_COLUMNS: &str = "company_id, name, billing_email, plan_code, currency, billing_anchor_day, is_active, bank_provider, accounting_provider, accounting_customer_id, created_utc, updated_utc";

fn db_err(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-jobs"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(|e| db_err("Failed to begin transaction", e))
    }

    async fn lock_obligation(
        tx: &mut Transaction<'static, Postgres>,
        obligation_id: Uuid,
    ) -> Result<Option<Obligation>, AppError> {
        sqlx::query_as::<_, Obligation>(&format!(
            "SELECT {} FROM obligations WHERE obligation_id = $1 FOR UPDATE",
            OBLIGATION_COLUMNS
        ))
        .bind(obligation_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| db_err("Failed to lock obligation", e))
    }

    /// Write a new state. Settlement stamps `settled_utc`; reversal clears the
    /// matched amount so the obligation is collectable again.
    async fn write_state(
        tx: &mut Transaction<'static, Postgres>,
        obligation_id: Uuid,
        state: ObligationState,
        matched_delta: rust_decimal::Decimal,
        reset_matched: bool,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE obligations
            SET state = $2,
                amount_matched = CASE WHEN $4 THEN 0 ELSE amount_matched + $3 END,
                settled_utc = CASE WHEN $2 = 'settled' THEN NOW() WHEN $2 = 'pending' THEN NULL ELSE settled_utc END,
                updated_utc = NOW()
            WHERE obligation_id = $1
            "#,
        )
        .bind(obligation_id)
        .bind(state.as_str())
        .bind(matched_delta)
        .bind(reset_matched)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_err("Failed to update obligation", e))?;
        Ok(())
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), AppError> {
        tx.commit()
            .await
            .map_err(|e| db_err("Failed to commit transaction", e))
    }
}

#[async_trait]
impl Store for PgStore {
    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Companies and usage
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_active_companies(&self) -> Result<Vec<Company>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_active_companies"])
            .start_timer();

        let companies = sqlx::query_as::<_, Company>(&format!(
            "SELECT {} FROM companies WHERE is_active ORDER BY company_id",
            COMPANY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to list companies", e))?;

        timer.observe_duration();
        Ok(companies)
    }

    #[instrument(skip(self), fields(company_id = %company_id))]
    async fn get_company(&self, company_id: Uuid) -> Result<Option<Company>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_company"])
            .start_timer();

        let company = sqlx::query_as::<_, Company>(&format!(
            "SELECT {} FROM companies WHERE company_id = $1",
            COMPANY_COLUMNS
        ))
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to get company", e))?;

        timer.observe_duration();
        Ok(company)
    }

    #[instrument(skip(self))]
    async fn usage_limits(&self, plan_code: &str) -> Result<Vec<UsageLimit>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["usage_limits"])
            .start_timer();

        let limits = sqlx::query_as::<_, UsageLimit>(
            "SELECT plan_code, resource, included_units FROM usage_limits WHERE plan_code = $1 ORDER BY resource",
        )
        .bind(plan_code)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load usage limits", e))?;

        timer.observe_duration();
        Ok(limits)
    }

    #[instrument(skip(self))]
    async fn overage_rates(&self, plan_code: &str) -> Result<Vec<OverageRate>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["overage_rates"])
            .start_timer();

        let rates = sqlx::query_as::<_, OverageRate>(
            "SELECT plan_code, resource, unit_price FROM overage_rates WHERE plan_code = $1 ORDER BY resource",
        )
        .bind(plan_code)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load overage rates", e))?;

        timer.observe_duration();
        Ok(rates)
    }

    #[instrument(skip(self), fields(company_id = %company_id, period_start = %period.start))]
    async fn usage_for_period(
        &self,
        company_id: Uuid,
        period: BillingPeriod,
    ) -> Result<UsageSnapshot, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["usage_for_period"])
            .start_timer();

        let resources = sqlx::query_as::<_, ResourceUsage>(
            r#"
            SELECT resource, COALESCE(SUM(quantity), 0) AS consumed
            FROM usage_events
            WHERE company_id = $1 AND recorded_utc >= $2 AND recorded_utc < $3
            GROUP BY resource
            ORDER BY resource
            "#,
        )
        .bind(company_id)
        .bind(period.start_utc())
        .bind(period.end_utc())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to aggregate usage", e))?;

        timer.observe_duration();
        Ok(UsageSnapshot {
            company_id,
            period,
            resources,
        })
    }

    #[instrument(skip(self, input), fields(company_id = %input.company_id, period_start = %input.period_start))]
    async fn create_overage_invoice(
        &self,
        input: &NewOverageInvoice,
    ) -> Result<Option<OverageInvoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_overage_invoice"])
            .start_timer();

        let invoice_id = Uuid::new_v4();
        let obligation_id = Uuid::new_v4();
        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO obligations (obligation_id, company_id, kind, reference, amount, currency, due_utc, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            "#,
        )
        .bind(obligation_id)
        .bind(input.company_id)
        .bind(ObligationKind::OverageInvoice.as_str())
        .bind(invoice_reference(invoice_id))
        .bind(input.total_amount)
        .bind(&input.currency)
        .bind(input.due_utc)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("Failed to create obligation", e))?;

        let invoice = sqlx::query_as::<_, OverageInvoice>(&format!(
            r#"
            INSERT INTO overage_invoices (invoice_id, company_id, period_start, period_end, obligation_id, currency, total_amount, lines)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (company_id, period_start) DO NOTHING
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(input.company_id)
        .bind(input.period_start)
        .bind(input.period_end)
        .bind(obligation_id)
        .bind(&input.currency)
        .bind(input.total_amount)
        .bind(Json(&input.lines))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_err("Failed to create overage invoice", e))?;

        let Some(invoice) = invoice else {
            // Another run already invoiced this period; drop the obligation too.
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(None);
        };

        Self::commit(tx).await?;
        timer.observe_duration();

        info!(
            invoice_id = %invoice.invoice_id,
            total_amount = %invoice.total_amount,
            "Overage invoice created"
        );
        Ok(Some(invoice))
    }

    #[instrument(skip(self), fields(company_id = %company_id))]
    async fn claim_usage_alert(
        &self,
        company_id: Uuid,
        period_start: NaiveDate,
        resource: &str,
        threshold_pct: i32,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_usage_alert"])
            .start_timer();

        let result = sqlx::query(
            r#"
            INSERT INTO usage_alerts (company_id, period_start, resource, threshold_pct)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(company_id)
        .bind(period_start)
        .bind(resource)
        .bind(threshold_pct)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to claim usage alert", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Obligations
    // =========================================================================

    #[instrument(skip(self), fields(obligation_id = %obligation_id))]
    async fn get_obligation(&self, obligation_id: Uuid) -> Result<Option<Obligation>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_obligation"])
            .start_timer();

        let obligation = sqlx::query_as::<_, Obligation>(&format!(
            "SELECT {} FROM obligations WHERE obligation_id = $1",
            OBLIGATION_COLUMNS
        ))
        .bind(obligation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to get obligation", e))?;

        timer.observe_duration();
        Ok(obligation)
    }

    #[instrument(skip(self))]
    async fn list_open_obligations(&self) -> Result<Vec<Obligation>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_open_obligations"])
            .start_timer();

        let obligations = sqlx::query_as::<_, Obligation>(
            r#"
            SELECT o.obligation_id, o.company_id, o.kind, o.reference, o.amount, o.amount_matched,
                   o.currency, o.due_utc, o.state, o.settled_utc, o.created_utc, o.updated_utc
            FROM obligations o
            JOIN companies c ON c.company_id = o.company_id
            WHERE c.is_active AND o.state IN ('pending', 'partially_matched', 'overdue')
            ORDER BY o.due_utc, o.obligation_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to list open obligations", e))?;

        timer.observe_duration();
        Ok(obligations)
    }

    #[instrument(skip(self), fields(company_id = %company_id))]
    async fn list_open_obligations_for_company(
        &self,
        company_id: Uuid,
        due_from: DateTime<Utc>,
        due_to: DateTime<Utc>,
    ) -> Result<Vec<Obligation>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_open_obligations_for_company"])
            .start_timer();

        let obligations = sqlx::query_as::<_, Obligation>(&format!(
            r#"
            SELECT {}
            FROM obligations
            WHERE company_id = $1
              AND state IN ('pending', 'partially_matched', 'overdue')
              AND due_utc >= $2 AND due_utc <= $3
            ORDER BY due_utc, obligation_id
            "#,
            OBLIGATION_COLUMNS
        ))
        .bind(company_id)
        .bind(due_from)
        .bind(due_to)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to list company obligations", e))?;

        timer.observe_duration();
        Ok(obligations)
    }

    #[instrument(skip(self), fields(obligation_id = %obligation_id))]
    async fn mark_overdue(&self, obligation_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_overdue"])
            .start_timer();

        let mut tx = self.begin().await?;
        let Some(current) = Self::lock_obligation(&mut tx, obligation_id).await? else {
            tx.rollback().await.ok();
            return Ok(false);
        };

        let changed = match current.state().apply(ObligationEvent::DuePassed) {
            Transition::Changed(state) => {
                Self::write_state(&mut tx, obligation_id, state, rust_decimal::Decimal::ZERO, false)
                    .await?;
                true
            }
            Transition::Unchanged | Transition::Rejected(_) => false,
        };

        Self::commit(tx).await?;
        timer.observe_duration();
        Ok(changed)
    }

    // =========================================================================
    // Reminders
    // =========================================================================

    #[instrument(skip(self, claim), fields(obligation_id = %claim.obligation_id, offset_days = claim.offset_days))]
    async fn claim_reminder(&self, claim: &ReminderClaim) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_reminder"])
            .start_timer();

        let result = sqlx::query(
            r#"
            INSERT INTO reminder_records (obligation_id, offset_days, escalation, delivery_status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (obligation_id, offset_days) DO NOTHING
            "#,
        )
        .bind(claim.obligation_id)
        .bind(claim.offset_days)
        .bind(claim.escalation.as_str())
        .bind(DeliveryStatus::Sent.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to claim reminder", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, detail), fields(obligation_id = %obligation_id))]
    async fn mark_reminder_failed(
        &self,
        obligation_id: Uuid,
        offset_days: i32,
        detail: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_reminder_failed"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE reminder_records
            SET delivery_status = $3, detail = $4
            WHERE obligation_id = $1 AND offset_days = $2
            "#,
        )
        .bind(obligation_id)
        .bind(offset_days)
        .bind(DeliveryStatus::Failed.as_str())
        .bind(detail)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to record reminder failure", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    #[instrument(skip(self, transactions), fields(count = transactions.len()))]
    async fn record_external_transactions(
        &self,
        transactions: &[ExternalTransaction],
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_external_transactions"])
            .start_timer();

        let mut tx = self.begin().await?;
        let mut inserted = 0;
        for t in transactions {
            let result = sqlx::query(
                r#"
                INSERT INTO external_transactions (company_id, provider, external_id, amount, currency, booked_on, reference, counterparty)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (company_id, provider, external_id) DO NOTHING
                "#,
            )
            .bind(t.company_id)
            .bind(&t.provider)
            .bind(&t.external_id)
            .bind(t.amount)
            .bind(&t.currency)
            .bind(t.booked_on)
            .bind(&t.reference)
            .bind(&t.counterparty)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to store external transaction", e))?;
            inserted += result.rows_affected();
        }
        Self::commit(tx).await?;

        timer.observe_duration();
        Ok(inserted)
    }

    #[instrument(skip(self), fields(company_id = %company_id))]
    async fn consumed_transaction_ids(
        &self,
        company_id: Uuid,
        provider: &str,
    ) -> Result<HashSet<String>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["consumed_transaction_ids"])
            .start_timer();

        let ids = sqlx::query_scalar::<_, String>(
            "SELECT external_id FROM reconciliation_matches WHERE company_id = $1 AND provider = $2",
        )
        .bind(company_id)
        .bind(provider)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load consumed transactions", e))?;

        timer.observe_duration();
        Ok(ids.into_iter().collect())
    }

    #[instrument(skip(self, set), fields(obligation_id = %set.obligation_id))]
    async fn apply_match(&self, set: &MatchSet) -> Result<MatchOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_match"])
            .start_timer();

        let mut tx = self.begin().await?;
        let Some(current) = Self::lock_obligation(&mut tx, set.obligation_id).await? else {
            tx.rollback().await.ok();
            return Ok(MatchOutcome::Stale("obligation not found".to_string()));
        };

        let target = match set.evaluate(&current) {
            Ok(state) => state,
            Err(reason) => {
                tx.rollback().await.ok();
                timer.observe_duration();
                return Ok(MatchOutcome::Stale(reason));
            }
        };

        for allocation in &set.allocations {
            let result = sqlx::query(
                r#"
                INSERT INTO reconciliation_matches (match_id, obligation_id, company_id, provider, external_id, amount)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (company_id, provider, external_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(set.obligation_id)
            .bind(set.company_id)
            .bind(&set.provider)
            .bind(&allocation.external_id)
            .bind(allocation.amount)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to record match", e))?;

            if result.rows_affected() == 0 {
                tx.rollback().await.ok();
                timer.observe_duration();
                return Ok(MatchOutcome::Stale(format!(
                    "transaction {} was consumed by another run",
                    allocation.external_id
                )));
            }
        }

        Self::write_state(&mut tx, set.obligation_id, target, set.total(), false).await?;

        let consumed: Vec<String> = set
            .allocations
            .iter()
            .map(|a| a.external_id.clone())
            .collect();
        sqlx::query(
            r#"
            UPDATE reconciliation_exceptions
            SET resolved = TRUE
            WHERE company_id = $1
              AND provider = $2
              AND NOT resolved
              AND (external_id = ANY($3) OR ($4 AND obligation_id = $5))
            "#,
        )
        .bind(set.company_id)
        .bind(&set.provider)
        .bind(&consumed)
        .bind(target == ObligationState::Settled)
        .bind(set.obligation_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("Failed to resolve exceptions", e))?;

        Self::commit(tx).await?;

        timer.observe_duration();
        Ok(MatchOutcome::Applied(target))
    }

    #[instrument(skip(self, exception), fields(company_id = %exception.company_id, kind = exception.kind.as_str()))]
    async fn record_exception(&self, exception: &NewException) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_exception"])
            .start_timer();

        let result = sqlx::query(
            r#"
            INSERT INTO reconciliation_exceptions (exception_id, company_id, provider, external_id, obligation_id, kind, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(exception.company_id)
        .bind(&exception.provider)
        .bind(&exception.external_id)
        .bind(exception.obligation_id)
        .bind(exception.kind.as_str())
        .bind(&exception.detail)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to record exception", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, filter))]
    async fn list_exceptions(
        &self,
        filter: &ListExceptionsFilter,
    ) -> Result<Vec<ReconciliationException>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_exceptions"])
            .start_timer();

        let limit = if filter.limit > 0 { filter.limit } else { 100 };
        let exceptions = sqlx::query_as::<_, ReconciliationException>(
            r#"
            SELECT exception_id, company_id, provider, external_id, obligation_id, kind, detail, resolved, created_utc
            FROM reconciliation_exceptions
            WHERE ($1::uuid IS NULL OR company_id = $1)
              AND ($2 OR NOT resolved)
            ORDER BY created_utc DESC, exception_id
            LIMIT $3
            "#,
        )
        .bind(filter.company_id)
        .bind(filter.include_resolved)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to list exceptions", e))?;

        timer.observe_duration();
        Ok(exceptions)
    }

    // =========================================================================
    // Webhooks
    // =========================================================================

    #[instrument(skip(self, command), fields(event_id = %command.event_id, obligation_id = %command.obligation_id))]
    async fn apply_webhook_event(
        &self,
        command: &WebhookCommand,
    ) -> Result<WebhookOutcome, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_webhook_event"])
            .start_timer();

        let mut tx = self.begin().await?;

        let claimed = sqlx::query(
            r#"
            INSERT INTO webhook_events (event_id, event_type, payload, outcome)
            VALUES ($1, $2, $3, 'processing')
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&command.event_id)
        .bind(command.event_type.as_str())
        .bind(Json(&command.raw_payload))
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("Failed to claim webhook event", e))?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await.ok();
            timer.observe_duration();
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match Self::lock_obligation(&mut tx, command.obligation_id).await? {
            None => WebhookOutcome::Ignored("obligation not found".to_string()),
            Some(current) => {
                let outcome = command.evaluate(&current);
                if let WebhookOutcome::Applied(state) = outcome {
                    let reset = current.state() == ObligationState::Settled
                        && state == ObligationState::Pending;
                    Self::write_state(
                        &mut tx,
                        command.obligation_id,
                        state,
                        rust_decimal::Decimal::ZERO,
                        reset,
                    )
                    .await?;
                }
                outcome
            }
        };

        let detail = match &outcome {
            WebhookOutcome::Ignored(reason) => Some(reason.clone()),
            _ => None,
        };
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET outcome = $2, detail = $3, processed_utc = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(&command.event_id)
        .bind(outcome.as_str())
        .bind(detail)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("Failed to mark webhook event processed", e))?;

        Self::commit(tx).await?;
        timer.observe_duration();
        Ok(outcome)
    }

    // =========================================================================
    // Accounting sync
    // =========================================================================

    #[instrument(skip(self), fields(company_id = %company_id))]
    async fn unsynced_invoices(&self, company_id: Uuid) -> Result<Vec<OverageInvoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["unsynced_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, OverageInvoice>(&format!(
            r#"
            SELECT {}
            FROM overage_invoices
            WHERE company_id = $1 AND external_id IS NULL
            ORDER BY period_start
            "#,
            INVOICE_COLUMNS
        ))
        .bind(company_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to list unsynced invoices", e))?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn mark_invoice_synced(
        &self,
        invoice_id: Uuid,
        external_id: &str,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_synced"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE overage_invoices
            SET external_id = $2, updated_utc = NOW()
            WHERE invoice_id = $1 AND external_id IS NULL
            "#,
        )
        .bind(invoice_id)
        .bind(external_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to mark invoice synced", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(company_id = %company_id))]
    async fn set_accounting_customer(
        &self,
        company_id: Uuid,
        customer_id: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["set_accounting_customer"])
            .start_timer();

        sqlx::query(
            "UPDATE companies SET accounting_customer_id = $2, updated_utc = NOW() WHERE company_id = $1",
        )
        .bind(company_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to store accounting customer", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Job runs
    // =========================================================================

    #[instrument(skip(self), fields(job = kind.as_str()))]
    async fn start_job_run(&self, kind: JobKind) -> Result<JobRun, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["start_job_run"])
            .start_timer();

        let run = sqlx::query_as::<_, JobRun>(
            r#"
            INSERT INTO job_runs (run_id, job_kind, status)
            VALUES ($1, $2, $3)
            RETURNING run_id, job_kind, status, started_utc, completed_utc, units_processed, units_succeeded, units_failed, summary
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(JobRunStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("Failed to start job run", e))?;

        timer.observe_duration();
        Ok(run)
    }

    #[instrument(skip(self, update), fields(run_id = %run_id, status = update.status.as_str()))]
    async fn finish_job_run(&self, run_id: Uuid, update: &JobRunUpdate) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finish_job_run"])
            .start_timer();

        let mut tx = self.begin().await?;

        sqlx::query(
            r#"
            UPDATE job_runs
            SET status = $2, completed_utc = NOW(), units_processed = $3,
                units_succeeded = $4, units_failed = $5, summary = $6
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .bind(update.status.as_str())
        .bind(update.units_processed)
        .bind(update.units_succeeded)
        .bind(update.units_failed)
        .bind(Json(&update.summary))
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("Failed to finish job run", e))?;

        for UnitError {
            scope,
            kind,
            message,
        } in &update.errors
        {
            sqlx::query(
                r#"
                INSERT INTO job_run_errors (error_id, run_id, scope, kind, message)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(scope)
            .bind(kind)
            .bind(message)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to record job run error", e))?;
        }

        Self::commit(tx).await?;
        timer.observe_duration();

        if !update.errors.is_empty() {
            warn!(errors = update.errors.len(), "Job run finished with unit errors");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_job_run(&self, run_id: Uuid) -> Result<Option<JobRunDetail>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_job_run"])
            .start_timer();

        let run = sqlx::query_as::<_, JobRun>(
            r#"
            SELECT run_id, job_kind, status, started_utc, completed_utc, units_processed, units_succeeded, units_failed, summary
            FROM job_runs
            WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to get job run", e))?;

        let Some(run) = run else {
            timer.observe_duration();
            return Ok(None);
        };

        let errors = sqlx::query_as::<_, JobRunError>(
            r#"
            SELECT error_id, run_id, scope, kind, message, created_utc
            FROM job_run_errors
            WHERE run_id = $1
            ORDER BY created_utc, error_id
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to get job run errors", e))?;

        timer.observe_duration();
        Ok(Some(JobRunDetail { run, errors }))
    }
}
