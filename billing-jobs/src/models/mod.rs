//! Domain models for billing-jobs.

mod company;
mod invoice;
mod job_run;
mod obligation;
mod reconciliation;
mod reminder;
mod webhook;

pub use company::{BillingPeriod, Company, OverageRate, ResourceUsage, UsageLimit, UsageSnapshot};
pub use invoice::{invoice_reference, InvoiceLine, NewOverageInvoice, OverageInvoice};
pub use job_run::{JobKind, JobRun, JobRunDetail, JobRunError, JobRunStatus, JobRunUpdate};
pub use obligation::{Obligation, ObligationEvent, ObligationKind, ObligationState, Transition};
pub use reconciliation::{
    Allocation, ExceptionKind, ExternalTransaction, ListExceptionsFilter, MatchOutcome, MatchSet,
    NewException, ReconciliationException, TransactionWindow,
};
pub use reminder::{DeliveryStatus, Escalation, ReminderClaim};
pub use webhook::{
    WebhookCommand, WebhookEnvelope, WebhookEventType, WebhookOutcome, WebhookPayload,
};
