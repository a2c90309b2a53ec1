//! Typed errors returned by the allocation engine.

use rust_decimal::Decimal;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("Payment {0} not found")]
    PaymentNotFound(Uuid),

    #[error("Invoice {0} not found")]
    InvoiceNotFound(Uuid),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Payment {0} is already allocated")]
    AlreadyAllocated(Uuid),

    #[error("No unpaid, partial or overdue invoices for representative {0}")]
    NoEligibleInvoices(Uuid),

    #[error("Payment {payment_id} and invoice {invoice_id} belong to different representatives")]
    CrossRepresentativeMismatch { payment_id: Uuid, invoice_id: Uuid },

    #[error("Allocation of {requested} exceeds remaining balance {remaining} on invoice {invoice_id}")]
    OverAllocation {
        invoice_id: Uuid,
        requested: Decimal,
        remaining: Decimal,
    },

    #[error("Allocation invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Audit transaction {0} not found")]
    TransactionNotFound(String),

    #[error("Audit transaction {transaction_id} cannot be rolled back: {reason}")]
    RollbackRejected {
        transaction_id: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] AppError),
}

impl AllocationError {
    /// Short label used for error counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PaymentNotFound(_) => "payment_not_found",
            Self::InvoiceNotFound(_) => "invoice_not_found",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::AlreadyAllocated(_) => "already_allocated",
            Self::NoEligibleInvoices(_) => "no_eligible_invoices",
            Self::CrossRepresentativeMismatch { .. } => "cross_representative_mismatch",
            Self::OverAllocation { .. } => "over_allocation",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::TransactionNotFound(_) => "transaction_not_found",
            Self::RollbackRejected { .. } => "rollback_rejected",
            Self::Store(_) => "store",
        }
    }
}

impl From<AllocationError> for AppError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::Store(inner) => inner,
            e @ (AllocationError::PaymentNotFound(_)
            | AllocationError::InvoiceNotFound(_)
            | AllocationError::TransactionNotFound(_)) => AppError::NotFound(anyhow::anyhow!(e)),
            e @ AllocationError::InvalidAmount(_) => AppError::BadRequest(anyhow::anyhow!(e)),
            e => AppError::Conflict(anyhow::anyhow!(e)),
        }
    }
}
