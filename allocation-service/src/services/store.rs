//! Ledger store seams.
//!
//! [`LedgerStore`] is implemented by the PostgreSQL [`Database`](super::Database) and by
//! [`MemoryLedgerStore`](super::MemoryLedgerStore). All allocation writes go through a
//! [`LedgerTx`]: rows are locked with `lock_*` calls, mutated, then committed or rolled
//! back as one unit. Store-level methods never take row locks.

use crate::models::{
    AllocationRecord, AuditTransaction, FeatureFlagState, Invoice, InvoiceStatus, NewAllocation,
    NewAuditTransaction, NewInvoice, NewPayment, NewReconciliationRun, Payment,
    ReconciliationRun,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use service_core::error::AppError;
use uuid::Uuid;

/// One atomic unit of ledger work.
///
/// Dropping a transaction without calling [`LedgerTx::commit`] discards it.
#[async_trait]
pub trait LedgerTx: Send {
    /// Lock and read a payment row.
    async fn lock_payment(&mut self, payment_id: Uuid) -> Result<Option<Payment>, AppError>;

    /// Lock and read an invoice row.
    async fn lock_invoice(&mut self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    /// Lock every unpaid, partial or overdue invoice of a representative.
    /// Locks are taken in invoice id order; callers re-sort for FIFO.
    async fn lock_open_invoices(&mut self, representative_id: Uuid)
        -> Result<Vec<Invoice>, AppError>;

    /// Lock a set of invoices by id, in id order.
    async fn lock_invoices(&mut self, invoice_ids: &[Uuid]) -> Result<Vec<Invoice>, AppError>;

    /// Σ allocated_amount targeting an invoice, as seen inside this transaction.
    async fn allocated_to_invoice(&mut self, invoice_id: Uuid) -> Result<Decimal, AppError>;

    async fn insert_allocation(
        &mut self,
        allocation: &NewAllocation,
    ) -> Result<AllocationRecord, AppError>;

    async fn insert_payment(&mut self, payment: &NewPayment) -> Result<Payment, AppError>;

    /// Set the legacy flag. `invoice_id` of `None` leaves the legacy pointer unchanged.
    async fn mark_payment_allocated(
        &mut self,
        payment_id: Uuid,
        invoice_id: Option<Uuid>,
    ) -> Result<(), AppError>;

    /// Clear the legacy flag and restore the legacy pointer.
    async fn mark_payment_unallocated(
        &mut self,
        payment_id: Uuid,
        invoice_id: Option<Uuid>,
    ) -> Result<(), AppError>;

    async fn delete_payment(&mut self, payment_id: Uuid) -> Result<(), AppError>;

    async fn update_invoice_status(
        &mut self,
        invoice_id: Uuid,
        status: InvoiceStatus,
    ) -> Result<(), AppError>;

    /// Remove the ledger rows written by one audit transaction.
    async fn delete_allocations_for_transaction(
        &mut self,
        transaction_id: &str,
    ) -> Result<Vec<AllocationRecord>, AppError>;

    async fn insert_audit(
        &mut self,
        audit: &NewAuditTransaction,
    ) -> Result<AuditTransaction, AppError>;

    async fn lock_audit(&mut self, transaction_id: &str)
        -> Result<Option<AuditTransaction>, AppError>;

    async fn complete_audit(
        &mut self,
        transaction_id: &str,
        actual_state: serde_json::Value,
        rollback_data: serde_json::Value,
    ) -> Result<(), AppError>;

    async fn mark_audit_rolled_back(
        &mut self,
        transaction_id: &str,
        actual_state: serde_json::Value,
    ) -> Result<(), AppError>;

    async fn commit(self) -> Result<(), AppError>;

    async fn rollback(self) -> Result<(), AppError>;
}

/// Durable ledger tables.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    type Tx: LedgerTx + 'static;

    /// Start a transaction.
    async fn begin(&self) -> Result<Self::Tx, AppError>;

    async fn insert_payment(&self, payment: &NewPayment) -> Result<Payment, AppError>;

    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, AppError>;

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError>;

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError>;

    /// A payment followed by every remainder split from it, recursively.
    async fn payment_chain(&self, payment_id: Uuid) -> Result<Vec<Payment>, AppError>;

    async fn allocations_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, AppError>;

    async fn allocations_for_invoice(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, AppError>;

    async fn get_audit_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<AuditTransaction>, AppError>;

    /// Legacy allocated amount per representative: Σ `amount` over payments flagged allocated.
    async fn legacy_allocated_by_representative(
        &self,
        representative_id: Option<Uuid>,
    ) -> Result<Vec<(Uuid, Decimal)>, AppError>;

    /// Ledger allocated amount per representative of the source payment.
    async fn ledger_allocated_by_representative(
        &self,
        representative_id: Option<Uuid>,
    ) -> Result<Vec<(Uuid, Decimal)>, AppError>;

    async fn insert_reconciliation_run(
        &self,
        run: &NewReconciliationRun,
    ) -> Result<ReconciliationRun, AppError>;

    /// Most recent runs first.
    async fn list_reconciliation_runs(&self, limit: i64)
        -> Result<Vec<ReconciliationRun>, AppError>;

    /// Payments flagged allocated that have no ledger row, oldest first.
    async fn backfill_candidates(&self, limit: i64) -> Result<Vec<Payment>, AppError>;
}

/// Persistence for feature flag rows.
#[async_trait]
pub trait FlagStore: Send + Sync {
    async fn load_flags(&self) -> Result<Vec<FeatureFlagState>, AppError>;

    async fn save_flag(&self, flag: &FeatureFlagState) -> Result<(), AppError>;
}
