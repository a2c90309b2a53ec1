//! Audit transaction recorder.
//!
//! Every mutating allocation opens a PENDING audit row inside its own database
//! transaction and completes it just before commit, so the audit trail commits or
//! aborts together with the ledger rows it describes.

use crate::models::{
    AllocationRecord, AuditType, Invoice, NewAuditTransaction, Payment, RollbackData,
};
use crate::services::store::LedgerTx;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use service_core::error::AppError;
use uuid::Uuid;

/// Fresh audit transaction id.
pub fn new_transaction_id() -> String {
    format!("TXN_{}", Uuid::new_v4().simple())
}

pub fn payment_snapshot(payment: &Payment) -> Value {
    json!({
        "payment_id": payment.payment_id,
        "amount": payment.amount,
        "is_allocated": payment.is_allocated,
        "invoice_id": payment.invoice_id,
    })
}

pub fn invoice_snapshots(invoices: &[Invoice]) -> Value {
    Value::Array(
        invoices
            .iter()
            .map(|i| {
                json!({
                    "invoice_id": i.invoice_id,
                    "amount": i.amount,
                    "status": i.status,
                })
            })
            .collect(),
    )
}

/// One planned or applied allocation line, for audit snapshots.
pub fn line_snapshot(invoice_id: Uuid, amount: Decimal) -> Value {
    json!({ "invoice_id": invoice_id, "amount": amount })
}

/// Writes the audit row for one allocation.
pub struct AuditRecorder {
    transaction_id: String,
}

impl AuditRecorder {
    /// Insert the PENDING row. Must be the first write of the transaction.
    pub async fn open<T: LedgerTx + ?Sized>(
        tx: &mut T,
        transaction_type: AuditType,
        payment: &Payment,
        target_state: Value,
        initiated_by: &str,
        reason: Option<String>,
        original_invoices: &[Invoice],
    ) -> Result<Self, AppError> {
        let transaction_id = new_transaction_id();
        tx.insert_audit(&NewAuditTransaction {
            transaction_id: transaction_id.clone(),
            transaction_type,
            representative_id: payment.representative_id,
            payment_id: payment.payment_id,
            original_state: json!({
                "payment": payment_snapshot(payment),
                "invoices": invoice_snapshots(original_invoices),
            }),
            target_state,
            initiated_by: initiated_by.to_string(),
            reason,
        })
        .await?;
        Ok(Self { transaction_id })
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Mark the row COMPLETED with the applied state and what a rollback needs.
    pub async fn complete<T: LedgerTx + ?Sized>(
        &self,
        tx: &mut T,
        payment: &Payment,
        allocations: &[AllocationRecord],
        remainder: Option<&Payment>,
    ) -> Result<(), AppError> {
        let mut invoice_ids: Vec<Uuid> = allocations.iter().map(|a| a.invoice_id).collect();
        invoice_ids.sort();
        invoice_ids.dedup();

        let rollback = RollbackData {
            payment_id: payment.payment_id,
            remainder_payment_id: remainder.map(|r| r.payment_id),
            invoice_ids,
            allocation_ids: allocations.iter().map(|a| a.allocation_id).collect(),
            previous_invoice_pointer: payment.invoice_id,
        };
        let actual_state = json!({
            "allocations": allocations
                .iter()
                .map(|a| line_snapshot(a.invoice_id, a.allocated_amount))
                .collect::<Vec<_>>(),
            "remainder_payment_id": remainder.map(|r| r.payment_id),
            "remainder_amount": remainder.map(|r| r.amount),
        });
        let rollback_data = serde_json::to_value(&rollback)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!(e)))?;

        tx.complete_audit(&self.transaction_id, actual_state, rollback_data)
            .await
    }
}
