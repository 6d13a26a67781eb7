//! Accounting sync: mirrors customers and overage invoices into each
//! company's accounting system.

use super::{call, JobBudget, JobRunTracker, UnitTally};
use crate::config::BillingJobsConfig;
use crate::error::{company_scope, JobError, UnitError};
use crate::models::{Company, JobKind, JobRunStatus};
use crate::services::providers::{
    AccountingProvider, CustomerRecord, InvoiceRequest, ProviderRegistry,
};
use crate::services::Store;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub run_id: Option<Uuid>,
    pub status: JobRunStatus,
    pub customers_synced: u32,
    pub invoices_synced: u32,
    pub errors: Vec<UnitError>,
    pub partial: bool,
}

struct CompanySync {
    invoices_synced: u32,
    errors: Vec<UnitError>,
}

pub struct AccountingSync {
    store: Arc<dyn Store>,
    providers: Arc<ProviderRegistry<dyn AccountingProvider>>,
    budget: Duration,
    call_timeout: Duration,
}

impl AccountingSync {
    pub fn new(
        store: Arc<dyn Store>,
        providers: Arc<ProviderRegistry<dyn AccountingProvider>>,
        config: &BillingJobsConfig,
    ) -> Self {
        Self {
            store,
            providers,
            budget: Duration::from_secs(config.cron.sync_budget_secs),
            call_timeout: config.cron.call_timeout(),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn sync_all(&self) -> Result<SyncSummary, AppError> {
        let tracker = JobRunTracker::start(self.store.clone(), JobKind::AccountingSync).await?;
        let budget = JobBudget::new(self.budget);
        let mut tally = UnitTally::default();
        let mut summary = SyncSummary {
            run_id: Some(tracker.run_id()),
            ..Default::default()
        };

        match call(self.call_timeout, "list companies", self.store.list_active_companies()).await {
            Ok(companies) => {
                for company in companies.into_iter().filter(|c| c.accounting_provider.is_some()) {
                    if budget.exhausted() {
                        summary.partial = true;
                        break;
                    }
                    match self.sync_company(&company).await {
                        Ok(synced) => {
                            summary.customers_synced += 1;
                            summary.invoices_synced += synced.invoices_synced;
                            tally.settle_unit(JobKind::AccountingSync, synced.errors);
                        }
                        Err(e) => tally.failure(
                            JobKind::AccountingSync,
                            e.unit(company_scope(company.company_id)),
                        ),
                    }
                }
            }
            Err(e) => tally.failure(JobKind::AccountingSync, e.unit("job")),
        }

        summary.errors = tally.errors.clone();
        summary.status = tracker.finish(&tally, summary.partial, &summary).await;
        Ok(summary)
    }

    #[tracing::instrument(skip(self, company), fields(company_id = %company.company_id))]
    async fn sync_company(&self, company: &Company) -> Result<CompanySync, JobError> {
        let name = company.accounting_provider.as_deref().unwrap_or_default();
        let provider = self.providers.get(name).ok_or_else(|| {
            JobError::Configuration(format!("unknown accounting provider '{}'", name))
        })?;

        let status = call(self.call_timeout, "connection test", provider.test_connection()).await?;
        if !status.success {
            return Err(JobError::TransientIo(format!(
                "accounting provider '{}' unreachable: {}",
                name,
                status.message.unwrap_or_default()
            )));
        }

        let customer = CustomerRecord {
            company_id: company.company_id,
            name: company.name.clone(),
            email: company.billing_email.clone(),
            currency: company.currency.clone(),
            existing_id: company.accounting_customer_id.clone(),
        };
        let customer_id = call(self.call_timeout, "sync customer", provider.sync_customer(&customer)).await?;
        if company.accounting_customer_id.as_deref() != Some(customer_id.as_str()) {
            call(
                self.call_timeout,
                "store customer id",
                self.store.set_accounting_customer(company.company_id, &customer_id),
            )
            .await?;
        }

        let invoices = call(
            self.call_timeout,
            "read unsynced invoices",
            self.store.unsynced_invoices(company.company_id),
        )
        .await?;

        let mut synced = CompanySync {
            invoices_synced: 0,
            errors: Vec::new(),
        };
        for invoice in invoices {
            let scope = format!("invoice:{}", invoice.invoice_id);
            let request = InvoiceRequest {
                customer_id: Some(customer_id.clone()),
                reference: invoice.reference(),
                currency: invoice.currency.clone(),
                total_amount: invoice.total_amount,
                period_start: invoice.period_start,
                period_end: invoice.period_end,
                lines: invoice.lines.0.clone(),
            };
            let created = match call(self.call_timeout, "push invoice", provider.create_invoice(&request)).await {
                Ok(created) => created,
                Err(e) => {
                    synced.errors.push(e.unit(scope));
                    continue;
                }
            };
            match call(
                self.call_timeout,
                "mark invoice synced",
                self.store.mark_invoice_synced(invoice.invoice_id, &created.external_id),
            )
            .await
            {
                Ok(_) => {
                    synced.invoices_synced += 1;
                    tracing::info!(
                        invoice_id = %invoice.invoice_id,
                        external_id = %created.external_id,
                        "Invoice synced"
                    );
                }
                Err(e) => synced.errors.push(e.unit(scope)),
            }
        }
        Ok(synced)
    }
}
