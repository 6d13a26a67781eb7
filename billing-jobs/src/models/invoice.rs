//! Overage invoice model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// One priced resource on an overage invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceLine {
    pub resource: String,
    pub included_units: Decimal,
    pub consumed_units: Decimal,
    pub overage_units: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

/// Invoice for usage beyond the plan allotment. One per company and period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OverageInvoice {
    pub invoice_id: Uuid,
    pub company_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub obligation_id: Uuid,
    pub currency: String,
    pub total_amount: Decimal,
    pub lines: Json<Vec<InvoiceLine>>,
    pub external_id: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl OverageInvoice {
    /// Reference shared by the invoice and its obligation, quoted by payers.
    pub fn reference(&self) -> String {
        invoice_reference(self.invoice_id)
    }
}

/// Input for creating an overage invoice together with its obligation.
#[derive(Debug, Clone)]
pub struct NewOverageInvoice {
    pub company_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub currency: String,
    pub total_amount: Decimal,
    pub lines: Vec<InvoiceLine>,
    pub due_utc: DateTime<Utc>,
}

/// `OVG-` followed by the first eight hex digits of the invoice id.
pub fn invoice_reference(invoice_id: Uuid) -> String {
    let simple = invoice_id.simple().to_string();
    format!("OVG-{}", simple[..8].to_uppercase())
}
