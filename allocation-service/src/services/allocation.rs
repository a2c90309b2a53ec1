//! Allocation engine.
//!
//! FIFO auto-allocation, manual allocation and explicit rollback. Each operation runs
//! in a single ledger transaction: payment row first, then invoice rows in id order.
//! Cache invalidation happens only after commit and never fails the operation.

use crate::error::AllocationError;
use crate::models::{
    AllocationLine, AllocationMethod, AllocationRecord, AllocationReversal, AuditStatus,
    AuditTransaction, AuditType, AutoAllocation, FeatureFlag, FlagContext, FlagState, Invoice,
    ManualAllocation, ManualAllocationRequest, NewAllocation, NewPayment, Payment,
};
use crate::services::audit::{line_snapshot, AuditRecorder};
use crate::services::cache::{CacheInvalidator, NoopCacheInvalidator};
use crate::services::clock::{Clock, SystemClock};
use crate::services::flags::FeatureFlagManager;
use crate::services::metrics::{
    record_allocated_amount, record_allocation_operation, record_error, ALLOCATION_DURATION,
};
use crate::services::status::{calculate_status, remaining_balance};
use crate::services::store::{LedgerStore, LedgerTx};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Actor recorded on FIFO allocations.
pub const SYSTEM_ACTOR: &str = "system";

pub struct AllocationEngine<S: LedgerStore> {
    store: Arc<S>,
    flags: Arc<FeatureFlagManager>,
    cache: Arc<dyn CacheInvalidator>,
    clock: Arc<dyn Clock>,
}

impl<S: LedgerStore> Clone for AllocationEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            flags: self.flags.clone(),
            cache: self.cache.clone(),
            clock: self.clock.clone(),
        }
    }
}

/// Planned share of a payment for one invoice.
struct PlannedLine {
    invoice: Invoice,
    already_allocated: Decimal,
    amount: Decimal,
}

impl<S: LedgerStore> AllocationEngine<S> {
    pub fn new(store: Arc<S>, flags: Arc<FeatureFlagManager>) -> Self {
        Self {
            store,
            flags,
            cache: Arc::new(NoopCacheInvalidator),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_cache_invalidator(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Apply a payment to its representative's open invoices, oldest first.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn auto_allocate(&self, payment_id: Uuid) -> Result<AutoAllocation, AllocationError> {
        let timer = ALLOCATION_DURATION
            .with_label_values(&["auto_allocate"])
            .start_timer();
        let result = self.auto_allocate_once(payment_id).await;
        timer.observe_duration();

        let allocation = self.settle("auto_allocate", result).await?;
        record_allocated_amount(
            AllocationMethod::Fifo.as_str(),
            allocation.allocated_amount.to_f64().unwrap_or_default(),
        );
        info!(
            transaction_id = %allocation.transaction_id,
            invoices = allocation.line_items.len(),
            allocated = %allocation.allocated_amount,
            remainder = %allocation.remainder_amount,
            "Payment auto-allocated"
        );
        Ok(allocation)
    }

    async fn auto_allocate_once(&self, payment_id: Uuid) -> Result<(AutoAllocation, Uuid), AllocationError> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or(AllocationError::PaymentNotFound(payment_id))?;
        if payment.amount <= Decimal::ZERO {
            return Err(AllocationError::InvalidAmount(format!(
                "payment amount {} must be positive",
                payment.amount
            )));
        }
        if payment.is_allocated {
            return Err(AllocationError::AlreadyAllocated(payment_id));
        }

        let mut tx = self.store.begin().await?;
        match self.apply_auto(&mut tx, payment_id).await {
            Ok(allocation) => {
                tx.commit().await?;
                Ok((allocation, payment.representative_id))
            }
            Err(e) => Err(abort(tx, e).await),
        }
    }

    async fn apply_auto(
        &self,
        tx: &mut S::Tx,
        payment_id: Uuid,
    ) -> Result<AutoAllocation, AllocationError> {
        let payment = tx
            .lock_payment(payment_id)
            .await?
            .ok_or(AllocationError::PaymentNotFound(payment_id))?;
        if payment.is_allocated {
            return Err(AllocationError::AlreadyAllocated(payment_id));
        }

        let mut invoices = tx.lock_open_invoices(payment.representative_id).await?;
        invoices.sort_by_key(|i| i.fifo_key());

        let mut balance = payment.amount;
        let mut plan = Vec::new();
        for invoice in invoices {
            if balance <= Decimal::ZERO {
                break;
            }
            let already_allocated = tx.allocated_to_invoice(invoice.invoice_id).await?;
            let remaining = remaining_balance(invoice.amount, already_allocated);
            if remaining <= Decimal::ZERO {
                continue;
            }
            let amount = remaining.min(balance);
            balance -= amount;
            plan.push(PlannedLine {
                invoice,
                already_allocated,
                amount,
            });
        }
        if plan.is_empty() {
            return Err(AllocationError::NoEligibleInvoices(payment.representative_id));
        }

        let touched: Vec<Invoice> = plan.iter().map(|p| p.invoice.clone()).collect();
        let audit = AuditRecorder::open(
            tx,
            AuditType::PaymentAutoAllocate,
            &payment,
            json!({
                "lines": plan.iter().map(|p| line_snapshot(p.invoice.invoice_id, p.amount)).collect::<Vec<_>>(),
                "remainder_amount": balance,
            }),
            SYSTEM_ACTOR,
            None,
            &touched,
        )
        .await?;

        let today = self.clock.today();
        let mut records = Vec::with_capacity(plan.len());
        let mut line_items = Vec::with_capacity(plan.len());
        for line in &plan {
            let record = tx
                .insert_allocation(&NewAllocation {
                    payment_id,
                    invoice_id: line.invoice.invoice_id,
                    allocated_amount: line.amount,
                    method: AllocationMethod::Fifo,
                    performed_by: SYSTEM_ACTOR.to_string(),
                    transaction_id: audit.transaction_id().to_string(),
                })
                .await?;
            let status = calculate_status(
                line.invoice.amount,
                line.already_allocated + line.amount,
                line.invoice.due_date,
                today,
            );
            tx.update_invoice_status(line.invoice.invoice_id, status).await?;
            line_items.push(AllocationLine {
                invoice_id: line.invoice.invoice_id,
                allocated_amount: line.amount,
                invoice_status: status,
            });
            records.push(record);
        }

        let remainder = if balance > Decimal::ZERO {
            Some(tx.insert_payment(&NewPayment::remainder_of(&payment, balance)).await?)
        } else {
            None
        };

        let pointer = self.legacy_pointer(&payment, plan[0].invoice.invoice_id);
        tx.mark_payment_allocated(payment_id, pointer).await?;

        let allocated_amount: Decimal = line_items.iter().map(|l| l.allocated_amount).sum();
        self.check_invariants(tx, &payment, allocated_amount, balance, &touched)
            .await?;

        audit
            .complete(tx, &payment, &records, remainder.as_ref())
            .await?;

        Ok(AutoAllocation {
            payment_id,
            transaction_id: audit.transaction_id().to_string(),
            line_items,
            allocated_amount,
            remainder_payment_id: remainder.map(|r| r.payment_id),
            remainder_amount: balance,
        })
    }

    /// Apply an operator-chosen amount of a payment to one invoice.
    #[instrument(skip(self, request), fields(payment_id = %request.payment_id, invoice_id = %request.invoice_id))]
    pub async fn manual_allocate(
        &self,
        request: ManualAllocationRequest,
    ) -> Result<ManualAllocation, AllocationError> {
        let timer = ALLOCATION_DURATION
            .with_label_values(&["manual_allocate"])
            .start_timer();
        let result = self.manual_allocate_once(&request).await;
        timer.observe_duration();

        let allocation = self.settle("manual_allocate", result).await?;
        record_allocated_amount(
            AllocationMethod::Manual.as_str(),
            allocation.allocated_amount.to_f64().unwrap_or_default(),
        );
        info!(
            transaction_id = %allocation.transaction_id,
            performed_by = %request.performed_by,
            allocated = %allocation.allocated_amount,
            invoice_status = %allocation.invoice_status,
            "Payment manually allocated"
        );
        Ok(allocation)
    }

    async fn manual_allocate_once(
        &self,
        request: &ManualAllocationRequest,
    ) -> Result<(ManualAllocation, Uuid), AllocationError> {
        if request.amount <= Decimal::ZERO {
            return Err(AllocationError::InvalidAmount(format!(
                "allocation amount {} must be positive",
                request.amount
            )));
        }
        let payment = self
            .store
            .get_payment(request.payment_id)
            .await?
            .ok_or(AllocationError::PaymentNotFound(request.payment_id))?;
        self.store
            .get_invoice(request.invoice_id)
            .await?
            .ok_or(AllocationError::InvoiceNotFound(request.invoice_id))?;
        if request.amount > payment.amount {
            return Err(AllocationError::InvalidAmount(format!(
                "allocation amount {} exceeds payment amount {}",
                request.amount, payment.amount
            )));
        }

        let mut tx = self.store.begin().await?;
        match self.apply_manual(&mut tx, request).await {
            Ok(allocation) => {
                tx.commit().await?;
                Ok((allocation, payment.representative_id))
            }
            Err(e) => Err(abort(tx, e).await),
        }
    }

    async fn apply_manual(
        &self,
        tx: &mut S::Tx,
        request: &ManualAllocationRequest,
    ) -> Result<ManualAllocation, AllocationError> {
        let payment = tx
            .lock_payment(request.payment_id)
            .await?
            .ok_or(AllocationError::PaymentNotFound(request.payment_id))?;
        let invoice = tx
            .lock_invoice(request.invoice_id)
            .await?
            .ok_or(AllocationError::InvoiceNotFound(request.invoice_id))?;

        if payment.is_allocated {
            return Err(AllocationError::AlreadyAllocated(payment.payment_id));
        }
        if payment.representative_id != invoice.representative_id {
            return Err(AllocationError::CrossRepresentativeMismatch {
                payment_id: payment.payment_id,
                invoice_id: invoice.invoice_id,
            });
        }
        let already_allocated = tx.allocated_to_invoice(invoice.invoice_id).await?;
        let remaining = remaining_balance(invoice.amount, already_allocated);
        if request.amount > remaining {
            return Err(AllocationError::OverAllocation {
                invoice_id: invoice.invoice_id,
                requested: request.amount,
                remaining,
            });
        }

        let balance = payment.amount - request.amount;
        let touched = vec![invoice.clone()];
        let audit = AuditRecorder::open(
            tx,
            AuditType::PaymentManualAllocate,
            &payment,
            json!({
                "lines": [line_snapshot(invoice.invoice_id, request.amount)],
                "remainder_amount": balance,
            }),
            &request.performed_by,
            request.reason.clone(),
            &touched,
        )
        .await?;

        let record = tx
            .insert_allocation(&NewAllocation {
                payment_id: payment.payment_id,
                invoice_id: invoice.invoice_id,
                allocated_amount: request.amount,
                method: AllocationMethod::Manual,
                performed_by: request.performed_by.clone(),
                transaction_id: audit.transaction_id().to_string(),
            })
            .await?;
        let status = calculate_status(
            invoice.amount,
            already_allocated + request.amount,
            invoice.due_date,
            self.clock.today(),
        );
        tx.update_invoice_status(invoice.invoice_id, status).await?;

        let remainder = if balance > Decimal::ZERO {
            Some(tx.insert_payment(&NewPayment::remainder_of(&payment, balance)).await?)
        } else {
            None
        };

        let pointer = self.legacy_pointer(&payment, invoice.invoice_id);
        tx.mark_payment_allocated(payment.payment_id, pointer).await?;

        self.check_invariants(tx, &payment, request.amount, balance, &touched)
            .await?;

        audit
            .complete(tx, &payment, std::slice::from_ref(&record), remainder.as_ref())
            .await?;

        Ok(ManualAllocation {
            payment_id: payment.payment_id,
            invoice_id: invoice.invoice_id,
            transaction_id: audit.transaction_id().to_string(),
            allocated_amount: request.amount,
            invoice_status: status,
            remainder_payment_id: remainder.map(|r| r.payment_id),
        })
    }

    /// Undo a completed allocation transaction.
    #[instrument(skip(self, reason))]
    pub async fn rollback_transaction(
        &self,
        transaction_id: &str,
        performed_by: &str,
        reason: &str,
    ) -> Result<AllocationReversal, AllocationError> {
        let timer = ALLOCATION_DURATION
            .with_label_values(&["rollback_transaction"])
            .start_timer();
        let result = self
            .rollback_transaction_once(transaction_id, performed_by, reason)
            .await;
        timer.observe_duration();

        let reversal = self.settle("rollback_transaction", result).await?;
        info!(
            transaction_id = %transaction_id,
            performed_by = %performed_by,
            reason = %reason,
            reversed = %reversal.reversed_amount,
            "Allocation transaction rolled back"
        );
        Ok(reversal)
    }

    async fn rollback_transaction_once(
        &self,
        transaction_id: &str,
        performed_by: &str,
        reason: &str,
    ) -> Result<(AllocationReversal, Uuid), AllocationError> {
        let audit = self
            .store
            .get_audit_transaction(transaction_id)
            .await?
            .ok_or_else(|| AllocationError::TransactionNotFound(transaction_id.to_string()))?;

        let mut tx = self.store.begin().await?;
        match self
            .apply_rollback(&mut tx, transaction_id, performed_by, reason)
            .await
        {
            Ok(reversal) => {
                tx.commit().await?;
                Ok((reversal, audit.representative_id))
            }
            Err(e) => Err(abort(tx, e).await),
        }
    }

    async fn apply_rollback(
        &self,
        tx: &mut S::Tx,
        transaction_id: &str,
        performed_by: &str,
        reason: &str,
    ) -> Result<AllocationReversal, AllocationError> {
        let rejected = |why: String| AllocationError::RollbackRejected {
            transaction_id: transaction_id.to_string(),
            reason: why,
        };

        let audit = tx
            .lock_audit(transaction_id)
            .await?
            .ok_or_else(|| AllocationError::TransactionNotFound(transaction_id.to_string()))?;
        if audit.parsed_status() != AuditStatus::Completed {
            return Err(rejected(format!("status is {}", audit.status)));
        }
        let data = audit
            .parsed_rollback_data()
            .ok_or_else(|| rejected("rollback data is missing".to_string()))?;

        tx.lock_payment(data.payment_id)
            .await?
            .ok_or(AllocationError::PaymentNotFound(data.payment_id))?;
        let remainder = match data.remainder_payment_id {
            Some(id) => tx.lock_payment(id).await?,
            None => None,
        };
        if let Some(remainder) = &remainder {
            if remainder.is_allocated {
                return Err(rejected(format!(
                    "remainder payment {} has since been allocated",
                    remainder.payment_id
                )));
            }
        }
        let invoices = tx.lock_invoices(&data.invoice_ids).await?;

        let removed = tx.delete_allocations_for_transaction(transaction_id).await?;
        let reversed_amount: Decimal = removed.iter().map(|a| a.allocated_amount).sum();
        if let Some(remainder) = &remainder {
            tx.delete_payment(remainder.payment_id).await?;
        }
        tx.mark_payment_unallocated(data.payment_id, data.previous_invoice_pointer)
            .await?;

        let today = self.clock.today();
        let mut invoice_statuses = Vec::with_capacity(invoices.len());
        for invoice in &invoices {
            let allocated = tx.allocated_to_invoice(invoice.invoice_id).await?;
            let status = calculate_status(invoice.amount, allocated, invoice.due_date, today);
            tx.update_invoice_status(invoice.invoice_id, status).await?;
            invoice_statuses.push((invoice.invoice_id, status));
        }

        tx.mark_audit_rolled_back(
            transaction_id,
            json!({
                "rolled_back_by": performed_by,
                "reason": reason,
                "reversed_amount": reversed_amount,
                "removed_allocations": removed.iter().map(|a| a.allocation_id).collect::<Vec<_>>(),
                "removed_remainder_payment_id": remainder.as_ref().map(|r| r.payment_id),
            }),
        )
        .await?;

        Ok(AllocationReversal {
            transaction_id: transaction_id.to_string(),
            payment_id: data.payment_id,
            reversed_amount,
            removed_remainder_payment_id: remainder.map(|r| r.payment_id),
            invoice_statuses,
        })
    }

    /// A payment and every remainder split from it.
    pub async fn payment_chain(&self, payment_id: Uuid) -> Result<Vec<Payment>, AllocationError> {
        Ok(self.store.payment_chain(payment_id).await?)
    }

    pub async fn allocations_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, AllocationError> {
        Ok(self.store.allocations_for_payment(payment_id).await?)
    }

    pub async fn allocations_for_invoice(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<AllocationRecord>, AllocationError> {
        Ok(self.store.allocations_for_invoice(invoice_id).await?)
    }

    pub async fn audit_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<AuditTransaction, AllocationError> {
        self.store
            .get_audit_transaction(transaction_id)
            .await?
            .ok_or_else(|| AllocationError::TransactionNotFound(transaction_id.to_string()))
    }

    /// The legacy pointer is written only while dual-write is active.
    fn legacy_pointer(&self, payment: &Payment, first_invoice: Uuid) -> Option<Uuid> {
        let ctx = FlagContext::representative(payment.representative_id);
        self.flags
            .is_enabled(FeatureFlag::AllocationDualWrite, &ctx)
            .then_some(first_invoice)
    }

    /// Re-verify conservation and invoice ceilings before commit.
    async fn check_invariants(
        &self,
        tx: &mut S::Tx,
        payment: &Payment,
        allocated: Decimal,
        remainder: Decimal,
        touched: &[Invoice],
    ) -> Result<(), AllocationError> {
        let ctx = FlagContext::representative(payment.representative_id);
        if !self
            .flags
            .is_enabled(FeatureFlag::AllocationRuntimeGuards, &ctx)
        {
            return Ok(());
        }

        let mut ceilings = Vec::with_capacity(touched.len());
        for invoice in touched {
            let total = tx.allocated_to_invoice(invoice.invoice_id).await?;
            ceilings.push((invoice.invoice_id, total, invoice.amount));
        }
        let violations = invariant_violations(payment, allocated, remainder, &ceilings);
        guard_outcome(self.flags.state(FeatureFlag::AllocationRuntimeGuards), violations)
    }

    /// Record the outcome and run post-commit side effects.
    async fn settle<T>(
        &self,
        operation: &'static str,
        result: Result<(T, Uuid), AllocationError>,
    ) -> Result<T, AllocationError> {
        match result {
            Ok((value, representative_id)) => {
                record_allocation_operation(operation, "success");
                self.invalidate_cache(representative_id).await;
                Ok(value)
            }
            Err(e) => {
                record_allocation_operation(operation, e.kind());
                record_error(e.kind());
                warn!(operation = operation, error = %e, "Allocation operation failed");
                Err(e)
            }
        }
    }

    async fn invalidate_cache(&self, representative_id: Uuid) {
        if let Err(e) = self.cache.invalidate_representative(representative_id).await {
            record_error("cache_invalidation");
            warn!(representative_id = %representative_id, error = %e, "Financial cache invalidation failed");
        }
    }
}

/// Roll back a failed transaction and hand the original error back.
async fn abort<T: LedgerTx>(tx: T, err: AllocationError) -> AllocationError {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Ledger rollback failed");
    }
    err
}

/// Conservation and per-invoice ceiling breaches. `ceilings` holds
/// `(invoice_id, allocated_total, invoice_amount)`.
fn invariant_violations(
    payment: &Payment,
    allocated: Decimal,
    remainder: Decimal,
    ceilings: &[(Uuid, Decimal, Decimal)],
) -> Vec<String> {
    let mut violations = Vec::new();
    if allocated + remainder != payment.amount {
        violations.push(format!(
            "payment {} conservation: allocated {} + remainder {} != amount {}",
            payment.payment_id, allocated, remainder, payment.amount
        ));
    }
    for (invoice_id, total, amount) in ceilings {
        if total > amount {
            violations.push(format!(
                "invoice {} over-allocated: {} > {}",
                invoice_id, total, amount
            ));
        }
    }
    violations
}

/// Only `enforce` rejects; lower stages log and let the allocation through.
fn guard_outcome(state: FlagState, violations: Vec<String>) -> Result<(), AllocationError> {
    if violations.is_empty() {
        return Ok(());
    }
    let message = violations.join("; ");
    if state == FlagState::Enforce {
        return Err(AllocationError::InvariantViolation(message));
    }
    warn!(violations = %message, state = state.as_str(), "Allocation invariant violated (not enforced)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn payment(amount: i64) -> Payment {
        Payment {
            payment_id: Uuid::new_v4(),
            representative_id: Uuid::new_v4(),
            amount: Decimal::new(amount, 0),
            payment_date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
            is_allocated: true,
            invoice_id: None,
            parent_payment_id: None,
            description: None,
            created_utc: Utc::now(),
        }
    }

    fn d(n: i64) -> Decimal {
        Decimal::new(n, 0)
    }

    #[test]
    fn balanced_allocation_has_no_violations() {
        let p = payment(1500);
        let ceilings = [(Uuid::new_v4(), d(1000), d(1000))];
        assert!(invariant_violations(&p, d(1000), d(500), &ceilings).is_empty());
    }

    #[test]
    fn conservation_breach_is_reported() {
        let p = payment(1500);
        let violations = invariant_violations(&p, d(1000), d(400), &[]);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("conservation"));
    }

    #[test]
    fn invoice_over_ceiling_is_reported() {
        let p = payment(600);
        let invoice_id = Uuid::new_v4();
        let ceilings = [(Uuid::new_v4(), d(200), d(200)), (invoice_id, d(1100), d(1000))];
        let violations = invariant_violations(&p, d(600), Decimal::ZERO, &ceilings);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains(&invoice_id.to_string()));
    }

    #[test]
    fn enforce_rejects_violations() {
        let result = guard_outcome(FlagState::Enforce, vec!["a".into(), "b".into()]);
        match result {
            Err(AllocationError::InvariantViolation(message)) => assert_eq!(message, "a; b"),
            other => panic!("expected invariant violation, got {:?}", other),
        }
    }

    #[test]
    fn lower_stages_only_warn() {
        for state in [FlagState::Shadow, FlagState::Dry] {
            assert!(guard_outcome(state, vec!["breach".into()]).is_ok());
        }
        assert!(guard_outcome(FlagState::Enforce, Vec::new()).is_ok());
    }
}
