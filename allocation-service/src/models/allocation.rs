//! Allocation ledger model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// How an allocation was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AllocationMethod {
    Fifo,
    Manual,
}

impl AllocationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "FIFO",
            Self::Manual => "MANUAL",
        }
    }

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "FIFO" => Some(Self::Fifo),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for AllocationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One ledger row: part of a payment applied to an invoice.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub allocation_id: Uuid,
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub allocated_amount: Decimal,
    pub method: String,
    pub performed_by: String,
    pub transaction_id: String,
    pub created_utc: DateTime<Utc>,
}

impl AllocationRecord {
    pub fn parsed_method(&self) -> Option<AllocationMethod> {
        AllocationMethod::from_string(&self.method)
    }
}

/// Input for appending a ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAllocation {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub allocated_amount: Decimal,
    pub method: AllocationMethod,
    pub performed_by: String,
    pub transaction_id: String,
}

/// One line of an allocation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub invoice_id: Uuid,
    pub allocated_amount: Decimal,
    pub invoice_status: super::InvoiceStatus,
}

/// Result of a FIFO auto-allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoAllocation {
    pub payment_id: Uuid,
    pub transaction_id: String,
    pub line_items: Vec<AllocationLine>,
    pub allocated_amount: Decimal,
    pub remainder_payment_id: Option<Uuid>,
    pub remainder_amount: Decimal,
}

/// Manual allocation request from an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualAllocationRequest {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub amount: Decimal,
    pub performed_by: String,
    pub reason: Option<String>,
}

/// Result of a manual allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualAllocation {
    pub payment_id: Uuid,
    pub invoice_id: Uuid,
    pub transaction_id: String,
    pub allocated_amount: Decimal,
    pub invoice_status: super::InvoiceStatus,
    pub remainder_payment_id: Option<Uuid>,
}

/// Result of reversing a completed allocation transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReversal {
    pub transaction_id: String,
    pub payment_id: Uuid,
    pub reversed_amount: Decimal,
    pub removed_remainder_payment_id: Option<Uuid>,
    pub invoice_statuses: Vec<(Uuid, super::InvoiceStatus)>,
}
