//! In-process ledger store.
//!
//! Backs the engine in tests and local runs. A transaction holds the single state lock
//! for its whole lifetime and works on a private copy, so transactions are fully
//! serialized and a dropped or failed transaction leaves nothing behind.

use crate::models::{
    AllocationRecord, AuditStatus, AuditTransaction, FeatureFlagState, Invoice, InvoiceStatus,
    NewAllocation, NewAuditTransaction, NewInvoice, NewPayment, NewReconciliationRun, Payment,
    ReconciliationRun,
};
use crate::services::store::{FlagStore, LedgerStore, LedgerTx};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Default, Clone)]
struct LedgerState {
    payments: HashMap<Uuid, Payment>,
    invoices: HashMap<Uuid, Invoice>,
    allocations: Vec<AllocationRecord>,
    audits: HashMap<String, AuditTransaction>,
    runs: Vec<ReconciliationRun>,
}

impl LedgerState {
    fn allocated_to_invoice(&self, invoice_id: Uuid) -> Decimal {
        self.allocations
            .iter()
            .filter(|a| a.invoice_id == invoice_id)
            .map(|a| a.allocated_amount)
            .sum()
    }

    fn insert_payment(&mut self, payment: &NewPayment) -> Payment {
        let row = Payment {
            payment_id: Uuid::new_v4(),
            representative_id: payment.representative_id,
            amount: payment.amount,
            payment_date: payment.payment_date,
            is_allocated: payment.is_allocated,
            invoice_id: payment.invoice_id,
            parent_payment_id: payment.parent_payment_id,
            description: payment.description.clone(),
            created_utc: Utc::now(),
        };
        self.payments.insert(row.payment_id, row.clone());
        row
    }

    fn payment_mut(&mut self, payment_id: Uuid) -> Result<&mut Payment, AppError> {
        self.payments
            .get_mut(&payment_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id)))
    }

    fn audit_mut(&mut self, transaction_id: &str) -> Result<&mut AuditTransaction, AppError> {
        self.audits.get_mut(transaction_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Audit transaction {} not found",
                transaction_id
            ))
        })
    }
}

/// Thread-safe in-memory [`LedgerStore`] with failure injection.
#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
    flags: Arc<Mutex<BTreeMap<String, FeatureFlagState>>>,
    unavailable: Arc<AtomicBool>,
    fail_commits: Arc<AtomicBool>,
    fail_run_inserts: Arc<AtomicBool>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read and `begin` fail with `ServiceUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make every commit fail. The transaction is discarded.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Make `insert_reconciliation_run` fail while reads keep working.
    pub fn set_fail_run_inserts(&self, fail: bool) {
        self.fail_run_inserts.store(fail, Ordering::SeqCst);
    }

    /// Every ledger row, in insertion order.
    pub async fn all_allocations(&self) -> Vec<AllocationRecord> {
        self.state.lock().await.allocations.clone()
    }

    /// Every payment, ordered by creation time.
    pub async fn all_payments(&self) -> Vec<Payment> {
        let mut payments: Vec<Payment> = self.state.lock().await.payments.values().cloned().collect();
        payments.sort_by_key(|p| p.created_utc);
        payments
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable);
        }
        Ok(())
    }
}

pub struct MemoryLedgerTx {
    guard: OwnedMutexGuard<LedgerState>,
    working: LedgerState,
    fail_commits: Arc<AtomicBool>,
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_payment(&mut self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        Ok(self.working.payments.get(&payment_id).cloned())
    }

    async fn lock_invoice(&mut self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        Ok(self.working.invoices.get(&invoice_id).cloned())
    }

    async fn lock_open_invoices(
        &mut self,
        representative_id: Uuid,
    ) -> Result<Vec<Invoice>, AppError> {
        let mut open: Vec<Invoice> = self
            .working
            .invoices
            .values()
            .filter(|i| i.representative_id == representative_id && i.parsed_status().is_open())
            .cloned()
            .collect();
        open.sort_by_key(|i| i.invoice_id);
        Ok(open)
    }

    async fn lock_invoices(&mut self, invoice_ids: &[Uuid]) -> Result<Vec<Invoice>, AppError> {
        let mut ids = invoice_ids.to_vec();
        ids.sort();
        ids.dedup();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.working.invoices.get(&id).cloned())
            .collect())
    }

    async fn allocated_to_invoice(&mut self, invoice_id: Uuid) -> Result<Decimal, AppError> {
        Ok(self.working.allocated_to_invoice(invoice_id))
    }

    async fn insert_allocation(
        &mut self,
        allocation: &NewAllocation,
    ) -> Result<AllocationRecord, AppError> {
        let row = AllocationRecord {
            allocation_id: Uuid::new_v4(),
            payment_id: allocation.payment_id,
            invoice_id: allocation.invoice_id,
            allocated_amount: allocation.allocated_amount,
            method: allocation.method.as_str().to_string(),
            performed_by: allocation.performed_by.clone(),
            transaction_id: allocation.transaction_id.clone(),
            created_utc: Utc::now(),
        };
        self.working.allocations.push(row.clone());
        Ok(row)
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> Result<Payment, AppError> {
        Ok(self.working.insert_payment(payment))
    }

    async fn mark_payment_allocated(
        &mut self,
        payment_id: Uuid,
        invoice_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let payment = self.working.payment_mut(payment_id)?;
        payment.is_allocated = true;
        if invoice_id.is_some() {
            payment.invoice_id = invoice_id;
        }
        Ok(())
    }

    async fn mark_payment_unallocated(
        &mut self,
        payment_id: Uuid,
        invoice_id: Option<Uuid>,
    ) -> Result<(), AppError> {
        let payment = self.working.payment_mut(payment_id)?;
        payment.is_allocated = false;
        payment.invoice_id = invoice_id;
        Ok(())
    }

    async fn delete_payment(&mut self, payment_id: Uuid) -> Result<(), AppError> {
        self.working.payments.remove(&payment_id);
        Ok(())
    }

    async fn update_invoice_status(
        &mut self,
        invoice_id: Uuid,
        status: InvoiceStatus,
    ) -> Result<(), AppError> {
        let invoice = self.working.invoices.get_mut(&invoice_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id))
        })?;
        invoice.status = status.as_str().to_string();
        Ok(())
    }

    async fn delete_allocations_for_transaction(
        &mut self,
        transaction_id: &str,
    ) -> Result<Vec<AllocationRecord>, AppError> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.working.allocations)
            .into_iter()
            .partition(|a| a.transaction_id == transaction_id);
        self.working.allocations = kept;
        Ok(removed)
    }

    async fn insert_audit(
        &mut self,
        audit: &NewAuditTransaction,
    ) -> Result<AuditTransaction, AppError> {
        if self.working.audits.contains_key(&audit.transaction_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Audit transaction {} already exists",
                audit.transaction_id
            )));
        }
        let row = AuditTransaction {
            transaction_id: audit.transaction_id.clone(),
            transaction_type: audit.transaction_type.as_str().to_string(),
            status: AuditStatus::Pending.as_str().to_string(),
            representative_id: audit.representative_id,
            payment_id: audit.payment_id,
            original_state: audit.original_state.clone(),
            target_state: audit.target_state.clone(),
            actual_state: None,
            rollback_data: None,
            initiated_by: audit.initiated_by.clone(),
            reason: audit.reason.clone(),
            created_utc: Utc::now(),
            completed_utc: None,
            rolled_back_utc: None,
        };
        self.working
            .audits
            .insert(row.transaction_id.clone(), row.clone());
        Ok(row)
    }

    async fn lock_audit(
        &mut self,
        transaction_id: &str,
    ) -> Result<Option<AuditTransaction>, AppError> {
        Ok(self.working.audits.get(transaction_id).cloned())
    }

    async fn complete_audit(
        &mut self,
        transaction_id: &str,
        actual_state: serde_json::Value,
        rollback_data: serde_json::Value,
    ) -> Result<(), AppError> {
        let audit = self.working.audit_mut(transaction_id)?;
        audit.status = AuditStatus::Completed.as_str().to_string();
        audit.actual_state = Some(actual_state);
        audit.rollback_data = Some(rollback_data);
        audit.completed_utc = Some(Utc::now());
        Ok(())
    }

    async fn mark_audit_rolled_back(
        &mut self,
        transaction_id: &str,
        actual_state: serde_json::Value,
    ) -> Result<(), AppError> {
        let audit = self.working.audit_mut(transaction_id)?;
        audit.status = AuditStatus::RolledBack.as_str().to_string();
        audit.actual_state = Some(actual_state);
        audit.rolled_back_utc = Some(Utc::now());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), AppError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Injected commit failure"
            )));
        }
        *self.guard = self.working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), AppError> {
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    type Tx = MemoryLedgerTx;

    async fn begin(&self) -> Result<MemoryLedgerTx, AppError> {
        self.check_available()?;
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemoryLedgerTx {
            guard,
            working,
            fail_commits: self.fail_commits.clone(),
        })
    }

    async fn insert_payment(&self, payment: &NewPayment) -> Result<Payment, AppError> {
        self.check_available()?;
        Ok(self.state.lock().await.insert_payment(payment))
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, AppError> {
        self.check_available()?;
        let row = Invoice {
            invoice_id: Uuid::new_v4(),
            representative_id: invoice.representative_id,
            invoice_number: invoice.invoice_number.clone(),
            amount: invoice.amount,
            issue_date: invoice.issue_date,
            due_date: invoice.due_date,
            status: InvoiceStatus::Unpaid.as_str().to_string(),
            created_utc: Utc::now(),
        };
        self.state
            .lock()
            .await
            .invoices
            .insert(row.invoice_id, row.clone());
        Ok(row)
    }

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        self.check_available()?;
        Ok(self.state.lock().await.payments.get(&payment_id).cloned())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, AppError> {
        self.check_available()?;
        Ok(self.state.lock().await.invoices.get(&invoice_id).cloned())
    }

    async fn payment_chain(&self, payment_id: Uuid) -> Result<Vec<Payment>, AppError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let Some(root) = state.payments.get(&payment_id) else {
            return Ok(Vec::new());
        };
        let mut chain = vec![root.clone()];
        let mut cursor = 0;
        while cursor < chain.len() {
            let parent = chain[cursor].payment_id;
            let mut children: Vec<Payment> = state
                .payments
                .values()
                .filter(|p| p.parent_payment_id == Some(parent))
                .cloned()
                .collect();
            children.sort_by_key(|p| p.created_utc);
            chain.extend(children);
            cursor += 1;
        }
        Ok(chain)
    }

    async fn allocations_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, AppError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .allocations
            .iter()
            .filter(|a| a.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn allocations_for_invoice(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, AppError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .allocations
            .iter()
            .filter(|a| a.invoice_id == invoice_id)
            .cloned()
            .collect())
    }

    async fn get_audit_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<AuditTransaction>, AppError> {
        self.check_available()?;
        Ok(self.state.lock().await.audits.get(transaction_id).cloned())
    }

    async fn legacy_allocated_by_representative(
        &self,
        representative_id: Option<Uuid>,
    ) -> Result<Vec<(Uuid, Decimal)>, AppError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut sums: BTreeMap<Uuid, Decimal> = BTreeMap::new();
        for p in state.payments.values().filter(|p| p.is_allocated) {
            if representative_id.is_some_and(|rep| rep != p.representative_id) {
                continue;
            }
            *sums.entry(p.representative_id).or_default() += p.amount;
        }
        Ok(sums.into_iter().collect())
    }

    async fn ledger_allocated_by_representative(
        &self,
        representative_id: Option<Uuid>,
    ) -> Result<Vec<(Uuid, Decimal)>, AppError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut sums: BTreeMap<Uuid, Decimal> = BTreeMap::new();
        for a in &state.allocations {
            let Some(payment) = state.payments.get(&a.payment_id) else {
                continue;
            };
            if representative_id.is_some_and(|rep| rep != payment.representative_id) {
                continue;
            }
            *sums.entry(payment.representative_id).or_default() += a.allocated_amount;
        }
        Ok(sums.into_iter().collect())
    }

    async fn insert_reconciliation_run(
        &self,
        run: &NewReconciliationRun,
    ) -> Result<ReconciliationRun, AppError> {
        self.check_available()?;
        if self.fail_run_inserts.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to insert reconciliation run"
            )));
        }
        let row = ReconciliationRun {
            run_id: Uuid::new_v4(),
            scope: run.scope.clone(),
            diff_abs: run.diff_abs,
            diff_ratio: run.diff_ratio,
            status: run.status.as_str().to_string(),
            mode: run.mode.clone(),
            meta: run.meta.clone(),
            created_utc: Utc::now(),
        };
        self.state.lock().await.runs.push(row.clone());
        Ok(row)
    }

    async fn list_reconciliation_runs(
        &self,
        limit: i64,
    ) -> Result<Vec<ReconciliationRun>, AppError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn backfill_candidates(&self, limit: i64) -> Result<Vec<Payment>, AppError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut candidates: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.is_allocated)
            .filter(|p| !state.allocations.iter().any(|a| a.payment_id == p.payment_id))
            .cloned()
            .collect();
        candidates.sort_by_key(|p| (p.created_utc, p.payment_id));
        candidates.truncate(limit.clamp(0, 1000) as usize);
        Ok(candidates)
    }
}

#[async_trait]
impl FlagStore for MemoryLedgerStore {
    async fn load_flags(&self) -> Result<Vec<FeatureFlagState>, AppError> {
        self.check_available()?;
        Ok(self.flags.lock().await.values().cloned().collect())
    }

    async fn save_flag(&self, flag: &FeatureFlagState) -> Result<(), AppError> {
        self.check_available()?;
        self.flags
            .lock()
            .await
            .insert(flag.name.clone(), flag.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = MemoryLedgerStore::new();
        let rep = Uuid::new_v4();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_payment(&NewPayment::received(rep, Decimal::new(100, 0), day()))
                .await
                .unwrap();
        }
        assert!(store.all_payments().await.is_empty());
    }

    #[tokio::test]
    async fn failed_commit_discards_writes() {
        let store = MemoryLedgerStore::new();
        store.set_fail_commits(true);
        let rep = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        tx.insert_payment(&NewPayment::received(rep, Decimal::new(100, 0), day()))
            .await
            .unwrap();
        assert!(tx.commit().await.is_err());
        assert!(store.all_payments().await.is_empty());
    }

    #[tokio::test]
    async fn legacy_sum_counts_full_amount_of_split_payments() {
        let store = MemoryLedgerStore::new();
        let rep = Uuid::new_v4();
        let mut parent = NewPayment::received(rep, Decimal::new(1000, 0), day());
        parent.is_allocated = true;
        let parent = store.insert_payment(&parent).await.unwrap();
        store
            .insert_payment(&NewPayment::remainder_of(&parent, Decimal::new(300, 0)))
            .await
            .unwrap();

        let legacy = store.legacy_allocated_by_representative(Some(rep)).await.unwrap();
        assert_eq!(legacy, vec![(rep, Decimal::new(1000, 0))]);
    }

    #[tokio::test]
    async fn failing_run_inserts_leave_reads_available() {
        let store = MemoryLedgerStore::new();
        store.set_fail_run_inserts(true);
        let run = NewReconciliationRun {
            scope: "global".to_string(),
            diff_abs: Decimal::ZERO,
            diff_ratio: Decimal::ZERO,
            status: crate::models::DriftStatus::Ok,
            mode: "dry".to_string(),
            meta: serde_json::json!({}),
        };

        assert!(matches!(
            store.insert_reconciliation_run(&run).await,
            Err(AppError::DatabaseError(_))
        ));
        assert!(store.list_reconciliation_runs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_rejects_reads() {
        let store = MemoryLedgerStore::new();
        store.set_unavailable(true);
        let result = store.get_payment(Uuid::new_v4()).await;
        assert!(matches!(result, Err(AppError::ServiceUnavailable)));
    }
}
