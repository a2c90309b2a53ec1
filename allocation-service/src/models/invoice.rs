//! Invoice model and status.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Invoice payment status. Always derived from the ledger, see
/// [`crate::services::status::calculate_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Unpaid,
    Partial,
    Paid,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::Partial => "partial",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "partial" => InvoiceStatus::Partial,
            "paid" => InvoiceStatus::Paid,
            "overdue" => InvoiceStatus::Overdue,
            _ => InvoiceStatus::Unpaid,
        }
    }

    /// Whether FIFO auto-allocation may target an invoice in this status.
    pub fn is_open(&self) -> bool {
        !matches!(self, InvoiceStatus::Paid)
    }

    /// Status values selected by the FIFO candidate query.
    pub const OPEN: [&'static str; 3] = ["unpaid", "partial", "overdue"];
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Invoice issued to a representative.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub representative_id: Uuid,
    pub invoice_number: Option<String>,
    pub amount: Decimal,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
    pub status: String,
    pub created_utc: DateTime<Utc>,
}

impl Invoice {
    /// Get parsed status.
    pub fn parsed_status(&self) -> InvoiceStatus {
        InvoiceStatus::from_string(&self.status)
    }

    /// FIFO ordering key: oldest issue date first, id as tie-break.
    pub fn fifo_key(&self) -> (NaiveDate, Uuid) {
        (self.issue_date, self.invoice_id)
    }
}

/// Input for inserting an invoice. New invoices always start `unpaid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInvoice {
    pub representative_id: Uuid,
    pub invoice_number: Option<String>,
    pub amount: Decimal,
    pub issue_date: NaiveDate,
    pub due_date: Option<NaiveDate>,
}
