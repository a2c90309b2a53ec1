//! Allocation engine integration tests against the in-memory ledger.

mod common;

use allocation_service::error::AllocationError;
use allocation_service::models::{
    AllocationMethod, AuditStatus, FeatureFlag, FlagState, InvoiceStatus,
};
use allocation_service::services::{CacheInvalidator, SYSTEM_ACTOR};
use async_trait::async_trait;
use common::{day, dec, ledger, manual, today};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// FIFO auto-allocation
// =============================================================================

#[tokio::test]
async fn test_fifo_pays_oldest_invoice_first() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let newer = t.invoice(rep, "500", day(2)).await;
    let older = t.invoice(rep, "1000", day(1)).await;
    let payment = t.payment(rep, "1200").await;

    let result = t.engine.auto_allocate(payment.payment_id).await.unwrap();

    assert_eq!(result.line_items.len(), 2);
    assert_eq!(result.line_items[0].invoice_id, older.invoice_id);
    assert_eq!(result.line_items[0].allocated_amount, dec("1000"));
    assert_eq!(result.line_items[0].invoice_status, InvoiceStatus::Paid);
    assert_eq!(result.line_items[1].invoice_id, newer.invoice_id);
    assert_eq!(result.line_items[1].allocated_amount, dec("200"));
    assert_eq!(result.line_items[1].invoice_status, InvoiceStatus::Partial);
    assert_eq!(result.allocated_amount, dec("1200"));
    assert_eq!(result.remainder_payment_id, None);
    assert_eq!(result.remainder_amount, Decimal::ZERO);

    assert_eq!(t.reload_invoice(older.invoice_id).await.parsed_status(), InvoiceStatus::Paid);
    assert_eq!(t.reload_invoice(newer.invoice_id).await.parsed_status(), InvoiceStatus::Partial);
    assert!(t.reload_payment(payment.payment_id).await.unwrap().is_allocated);
}

#[tokio::test]
async fn test_fifo_same_issue_date_orders_by_id() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let a = t.invoice(rep, "100", day(1)).await;
    let b = t.invoice(rep, "100", day(1)).await;
    let payment = t.payment(rep, "150").await;

    let result = t.engine.auto_allocate(payment.payment_id).await.unwrap();

    let first = a.invoice_id.min(b.invoice_id);
    let second = a.invoice_id.max(b.invoice_id);
    assert_eq!(result.line_items[0].invoice_id, first);
    assert_eq!(result.line_items[0].allocated_amount, dec("100"));
    assert_eq!(result.line_items[1].invoice_id, second);
    assert_eq!(result.line_items[1].allocated_amount, dec("50"));
}

#[tokio::test]
async fn test_leftover_balance_becomes_remainder_payment() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let invoice = t.invoice(rep, "300", day(1)).await;
    let payment = t.payment(rep, "1000").await;

    let result = t.engine.auto_allocate(payment.payment_id).await.unwrap();

    assert_eq!(result.allocated_amount, dec("300"));
    assert_eq!(result.remainder_amount, dec("700"));
    let remainder_id = result.remainder_payment_id.expect("remainder expected");
    let remainder = t.reload_payment(remainder_id).await.unwrap();
    assert_eq!(remainder.amount, dec("700"));
    assert!(!remainder.is_allocated);
    assert!(remainder.is_remainder());
    assert_eq!(remainder.parent_payment_id, Some(payment.payment_id));
    assert_eq!(remainder.representative_id, rep);

    let original = t.reload_payment(payment.payment_id).await.unwrap();
    assert!(original.is_allocated);
    assert_eq!(original.amount, dec("1000"));
    assert_eq!(t.reload_invoice(invoice.invoice_id).await.parsed_status(), InvoiceStatus::Paid);

    let chain = t.engine.payment_chain(payment.payment_id).await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].payment_id, remainder_id);
}

#[tokio::test]
async fn test_conservation_holds_across_remainder_chain() {
    let t = ledger();
    let rep = Uuid::new_v4();
    t.invoice(rep, "250.50", day(1)).await;
    t.invoice(rep, "100.25", day(3)).await;
    let payment = t.payment(rep, "500").await;

    let first = t.engine.auto_allocate(payment.payment_id).await.unwrap();
    t.invoice(rep, "80", day(5)).await;
    let remainder_id = first.remainder_payment_id.unwrap();
    let second = t.engine.auto_allocate(remainder_id).await.unwrap();

    let ledger_total: Decimal = t
        .store
        .all_allocations()
        .await
        .iter()
        .map(|a| a.allocated_amount)
        .sum();
    let final_remainder = second.remainder_amount;
    assert_eq!(ledger_total + final_remainder, dec("500"));
    assert_eq!(t.engine.payment_chain(payment.payment_id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_fifo_records_method_actor_and_transaction() {
    let t = ledger();
    let rep = Uuid::new_v4();
    t.invoice(rep, "400", day(1)).await;
    let payment = t.payment(rep, "400").await;

    let result = t.engine.auto_allocate(payment.payment_id).await.unwrap();

    let rows = t.engine.allocations_for_payment(payment.payment_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].parsed_method(), Some(AllocationMethod::Fifo));
    assert_eq!(rows[0].performed_by, SYSTEM_ACTOR);
    assert_eq!(rows[0].transaction_id, result.transaction_id);

    let audit = t.engine.audit_transaction(&result.transaction_id).await.unwrap();
    assert_eq!(audit.parsed_status(), AuditStatus::Completed);
    assert_eq!(audit.payment_id, payment.payment_id);
    assert!(audit.completed_utc.is_some());
    assert!(audit.parsed_rollback_data().is_some());
}

#[tokio::test]
async fn test_paid_invoices_are_skipped() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let paid = t.invoice(rep, "100", day(1)).await;
    let open = t.invoice(rep, "100", day(2)).await;
    let first = t.payment(rep, "100").await;
    t.engine.auto_allocate(first.payment_id).await.unwrap();

    let second = t.payment(rep, "60").await;
    let result = t.engine.auto_allocate(second.payment_id).await.unwrap();

    assert_eq!(result.line_items.len(), 1);
    assert_eq!(result.line_items[0].invoice_id, open.invoice_id);
    assert!(t
        .engine
        .allocations_for_invoice(paid.invoice_id)
        .await
        .unwrap()
        .iter()
        .all(|a| a.payment_id == first.payment_id));
}

#[tokio::test]
async fn test_other_representatives_invoices_untouched() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let other = Uuid::new_v4();
    let foreign = t.invoice(other, "100", day(1)).await;
    t.invoice(rep, "100", day(2)).await;
    let payment = t.payment(rep, "50").await;

    t.engine.auto_allocate(payment.payment_id).await.unwrap();

    assert!(t
        .engine
        .allocations_for_invoice(foreign.invoice_id)
        .await
        .unwrap()
        .is_empty());
}

// =============================================================================
// Auto-allocation errors
// =============================================================================

#[tokio::test]
async fn test_no_eligible_invoices_leaves_payment_untouched() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let payment = t.payment(rep, "100").await;

    let err = t.engine.auto_allocate(payment.payment_id).await.unwrap_err();

    assert!(matches!(err, AllocationError::NoEligibleInvoices(r) if r == rep));
    let reloaded = t.reload_payment(payment.payment_id).await.unwrap();
    assert!(!reloaded.is_allocated);
    assert_eq!(t.store.all_payments().await.len(), 1);
    assert!(t.store.all_allocations().await.is_empty());
}

#[tokio::test]
async fn test_already_allocated_payment_rejected() {
    let t = ledger();
    let rep = Uuid::new_v4();
    t.invoice(rep, "1000", day(1)).await;
    let payment = t.payment(rep, "100").await;
    t.engine.auto_allocate(payment.payment_id).await.unwrap();

    let err = t.engine.auto_allocate(payment.payment_id).await.unwrap_err();

    assert!(matches!(err, AllocationError::AlreadyAllocated(id) if id == payment.payment_id));
    assert_eq!(t.store.all_allocations().await.len(), 1);
}

#[tokio::test]
async fn test_missing_payment_rejected() {
    let t = ledger();
    let missing = Uuid::new_v4();

    let err = t.engine.auto_allocate(missing).await.unwrap_err();

    assert!(matches!(err, AllocationError::PaymentNotFound(id) if id == missing));
}

#[tokio::test]
async fn test_zero_amount_payment_rejected() {
    let t = ledger();
    let rep = Uuid::new_v4();
    t.invoice(rep, "100", day(1)).await;
    let payment = t.payment(rep, "0").await;

    let err = t.engine.auto_allocate(payment.payment_id).await.unwrap_err();

    assert!(matches!(err, AllocationError::InvalidAmount(_)));
    assert!(t.store.all_allocations().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocation_of_same_payment_succeeds_once() {
    let t = ledger();
    let rep = Uuid::new_v4();
    t.invoice(rep, "5000", day(1)).await;
    let payment = t.payment(rep, "700").await;

    let a = t.engine.clone();
    let b = t.engine.clone();
    let id = payment.payment_id;
    let (first, second) = tokio::join!(
        tokio::spawn(async move { a.auto_allocate(id).await }),
        tokio::spawn(async move { b.auto_allocate(id).await }),
    );
    let results = [first.unwrap(), second.unwrap()];

    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(AllocationError::AlreadyAllocated(_))))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 1);

    let total: Decimal = t
        .store
        .all_allocations()
        .await
        .iter()
        .map(|a| a.allocated_amount)
        .sum();
    assert_eq!(total, dec("700"));
}

// =============================================================================
// Manual allocation
// =============================================================================

#[tokio::test]
async fn test_manual_allocation_splits_payment() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let invoice = t.invoice(rep, "1000", day(1)).await;
    let payment = t.payment(rep, "800").await;

    let result = t
        .engine
        .manual_allocate(manual(&payment, &invoice, "300"))
        .await
        .unwrap();

    assert_eq!(result.allocated_amount, dec("300"));
    assert_eq!(result.invoice_status, InvoiceStatus::Partial);
    let remainder = t
        .reload_payment(result.remainder_payment_id.unwrap())
        .await
        .unwrap();
    assert_eq!(remainder.amount, dec("500"));
    assert_eq!(remainder.parent_payment_id, Some(payment.payment_id));

    let rows = t.engine.allocations_for_invoice(invoice.invoice_id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].parsed_method(), Some(AllocationMethod::Manual));
    assert_eq!(rows[0].performed_by, "operator@test");

    let audit = t.engine.audit_transaction(&result.transaction_id).await.unwrap();
    assert_eq!(audit.initiated_by, "operator@test");
    assert_eq!(audit.reason.as_deref(), Some("test allocation"));
}

#[tokio::test]
async fn test_manual_allocation_exact_balance_marks_paid() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let invoice = t.invoice(rep, "500", day(1)).await;
    let payment = t.payment(rep, "500").await;

    let result = t
        .engine
        .manual_allocate(manual(&payment, &invoice, "500"))
        .await
        .unwrap();

    assert_eq!(result.invoice_status, InvoiceStatus::Paid);
    assert_eq!(result.remainder_payment_id, None);
}

#[tokio::test]
async fn test_manual_over_allocation_rejected_without_changes() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let invoice = t.invoice(rep, "1000", day(1)).await;
    let first = t.payment(rep, "500").await;
    t.engine
        .manual_allocate(manual(&first, &invoice, "500"))
        .await
        .unwrap();
    let second = t.payment(rep, "600").await;

    let err = t
        .engine
        .manual_allocate(manual(&second, &invoice, "600"))
        .await
        .unwrap_err();

    match err {
        AllocationError::OverAllocation {
            invoice_id,
            requested,
            remaining,
        } => {
            assert_eq!(invoice_id, invoice.invoice_id);
            assert_eq!(requested, dec("600"));
            assert_eq!(remaining, dec("500"));
        }
        other => panic!("expected OverAllocation, got {:?}", other),
    }
    assert_eq!(t.store.all_allocations().await.len(), 1);
    assert!(!t.reload_payment(second.payment_id).await.unwrap().is_allocated);
    assert_eq!(t.reload_invoice(invoice.invoice_id).await.parsed_status(), InvoiceStatus::Partial);
}

#[tokio::test]
async fn test_manual_cross_representative_rejected() {
    let t = ledger();
    let invoice = t.invoice(Uuid::new_v4(), "1000", day(1)).await;
    let payment = t.payment(Uuid::new_v4(), "100").await;

    let err = t
        .engine
        .manual_allocate(manual(&payment, &invoice, "100"))
        .await
        .unwrap_err();

    assert!(matches!(err, AllocationError::CrossRepresentativeMismatch { .. }));
    assert!(t.store.all_allocations().await.is_empty());
}

#[tokio::test]
async fn test_manual_amount_validation() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let invoice = t.invoice(rep, "1000", day(1)).await;
    let payment = t.payment(rep, "100").await;

    let zero = t
        .engine
        .manual_allocate(manual(&payment, &invoice, "0"))
        .await
        .unwrap_err();
    assert!(matches!(zero, AllocationError::InvalidAmount(_)));

    let too_much = t
        .engine
        .manual_allocate(manual(&payment, &invoice, "100.01"))
        .await
        .unwrap_err();
    assert!(matches!(too_much, AllocationError::InvalidAmount(_)));
}

#[tokio::test]
async fn test_manual_missing_invoice_rejected() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let invoice = t.invoice(rep, "1000", day(1)).await;
    let payment = t.payment(rep, "100").await;
    let mut request = manual(&payment, &invoice, "50");
    request.invoice_id = Uuid::new_v4();

    let err = t.engine.manual_allocate(request).await.unwrap_err();

    assert!(matches!(err, AllocationError::InvoiceNotFound(_)));
}

#[tokio::test]
async fn test_manual_already_allocated_rejected() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let invoice = t.invoice(rep, "1000", day(1)).await;
    let payment = t.payment(rep, "100").await;
    t.engine.auto_allocate(payment.payment_id).await.unwrap();

    let err = t
        .engine
        .manual_allocate(manual(&payment, &invoice, "50"))
        .await
        .unwrap_err();

    assert!(matches!(err, AllocationError::AlreadyAllocated(_)));
}

// =============================================================================
// Rollback
// =============================================================================

#[tokio::test]
async fn test_rollback_restores_pre_allocation_state() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let i1 = t.invoice(rep, "1000", day(1)).await;
    let i2 = t.invoice(rep, "500", day(2)).await;
    let payment = t.payment(rep, "1700").await;
    let allocation = t.engine.auto_allocate(payment.payment_id).await.unwrap();
    let remainder_id = allocation.remainder_payment_id.unwrap();

    let reversal = t
        .engine
        .rollback_transaction(&allocation.transaction_id, "ops@test", "wrong representative")
        .await
        .unwrap();

    assert_eq!(reversal.reversed_amount, dec("1500"));
    assert_eq!(reversal.removed_remainder_payment_id, Some(remainder_id));
    assert!(t.store.all_allocations().await.is_empty());
    assert!(t.reload_payment(remainder_id).await.is_none());
    let restored = t.reload_payment(payment.payment_id).await.unwrap();
    assert!(!restored.is_allocated);
    assert_eq!(t.reload_invoice(i1.invoice_id).await.parsed_status(), InvoiceStatus::Unpaid);
    assert_eq!(t.reload_invoice(i2.invoice_id).await.parsed_status(), InvoiceStatus::Unpaid);

    let audit = t.engine.audit_transaction(&allocation.transaction_id).await.unwrap();
    assert_eq!(audit.parsed_status(), AuditStatus::RolledBack);
    assert!(audit.rolled_back_utc.is_some());

    // the payment can be allocated again
    let again = t.engine.auto_allocate(payment.payment_id).await.unwrap();
    assert_eq!(again.allocated_amount, dec("1500"));
}

#[tokio::test]
async fn test_rollback_recomputes_overdue_status() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let past_due = today().pred_opt().unwrap();
    let invoice = t.invoice_due(rep, "1000", day(1), Some(past_due)).await;
    assert_eq!(invoice.parsed_status(), InvoiceStatus::Unpaid);
    let payment = t.payment(rep, "400").await;
    let allocation = t
        .engine
        .manual_allocate(manual(&payment, &invoice, "400"))
        .await
        .unwrap();
    assert_eq!(allocation.invoice_status, InvoiceStatus::Partial);

    let reversal = t
        .engine
        .rollback_transaction(&allocation.transaction_id, "ops@test", "duplicate")
        .await
        .unwrap();

    assert_eq!(
        reversal.invoice_statuses,
        vec![(invoice.invoice_id, InvoiceStatus::Overdue)]
    );
    assert_eq!(t.reload_invoice(invoice.invoice_id).await.parsed_status(), InvoiceStatus::Overdue);
}

#[tokio::test]
async fn test_rollback_twice_rejected() {
    let t = ledger();
    let rep = Uuid::new_v4();
    t.invoice(rep, "100", day(1)).await;
    let payment = t.payment(rep, "100").await;
    let allocation = t.engine.auto_allocate(payment.payment_id).await.unwrap();
    t.engine
        .rollback_transaction(&allocation.transaction_id, "ops@test", "first")
        .await
        .unwrap();

    let err = t
        .engine
        .rollback_transaction(&allocation.transaction_id, "ops@test", "second")
        .await
        .unwrap_err();

    assert!(matches!(err, AllocationError::RollbackRejected { .. }));
}

#[tokio::test]
async fn test_rollback_rejected_when_remainder_since_allocated() {
    let t = ledger();
    let rep = Uuid::new_v4();
    t.invoice(rep, "100", day(1)).await;
    let payment = t.payment(rep, "300").await;
    let allocation = t.engine.auto_allocate(payment.payment_id).await.unwrap();
    t.invoice(rep, "500", day(2)).await;
    t.engine
        .auto_allocate(allocation.remainder_payment_id.unwrap())
        .await
        .unwrap();

    let err = t
        .engine
        .rollback_transaction(&allocation.transaction_id, "ops@test", "too late")
        .await
        .unwrap_err();

    assert!(matches!(err, AllocationError::RollbackRejected { .. }));
    assert_eq!(t.store.all_allocations().await.len(), 2);
}

#[tokio::test]
async fn test_rollback_unknown_transaction() {
    let t = ledger();

    let err = t
        .engine
        .rollback_transaction("TXN_missing", "ops@test", "n/a")
        .await
        .unwrap_err();

    assert!(matches!(err, AllocationError::TransactionNotFound(_)));
}

// =============================================================================
// Flags, side effects and failure handling
// =============================================================================

#[tokio::test]
async fn test_legacy_pointer_written_only_with_dual_write() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let first_invoice = t.invoice(rep, "100", day(1)).await;
    t.invoice(rep, "100", day(2)).await;

    let without = t.payment(rep, "50").await;
    t.engine.auto_allocate(without.payment_id).await.unwrap();
    assert_eq!(t.reload_payment(without.payment_id).await.unwrap().invoice_id, None);

    t.flags
        .set_flag_state(FeatureFlag::AllocationDualWrite, FlagState::Enforce, "ops", "migration")
        .await
        .unwrap();
    let with = t.payment(rep, "80").await;
    t.engine.auto_allocate(with.payment_id).await.unwrap();
    assert_eq!(
        t.reload_payment(with.payment_id).await.unwrap().invoice_id,
        Some(first_invoice.invoice_id)
    );
}

#[tokio::test]
async fn test_enforced_runtime_guards_allow_valid_allocations() {
    let t = ledger();
    t.flags
        .set_flag_state(FeatureFlag::AllocationRuntimeGuards, FlagState::Enforce, "ops", "guard")
        .await
        .unwrap();
    let rep = Uuid::new_v4();
    t.invoice(rep, "1000", day(1)).await;
    t.invoice(rep, "500", day(2)).await;
    let payment = t.payment(rep, "1600").await;

    let result = t.engine.auto_allocate(payment.payment_id).await.unwrap();

    assert_eq!(result.allocated_amount + result.remainder_amount, dec("1600"));
}

struct FailingCache {
    calls: AtomicUsize,
}

#[async_trait]
impl CacheInvalidator for FailingCache {
    async fn invalidate_representative(&self, _representative_id: Uuid) -> Result<(), AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::ServiceUnavailable)
    }
}

#[tokio::test]
async fn test_failing_cache_invalidation_does_not_fail_allocation() {
    let t = ledger();
    let cache = Arc::new(FailingCache {
        calls: AtomicUsize::new(0),
    });
    let engine = t.engine.clone().with_cache_invalidator(cache.clone());
    let rep = Uuid::new_v4();
    t.invoice(rep, "100", day(1)).await;
    let payment = t.payment(rep, "100").await;

    let result = engine.auto_allocate(payment.payment_id).await;

    assert!(result.is_ok());
    assert_eq!(cache.calls.load(Ordering::SeqCst), 1);
    assert!(t.reload_payment(payment.payment_id).await.unwrap().is_allocated);
}

#[tokio::test]
async fn test_commit_failure_leaves_no_partial_state() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let invoice = t.invoice(rep, "100", day(1)).await;
    let payment = t.payment(rep, "250").await;
    t.store.set_fail_commits(true);

    let err = t.engine.auto_allocate(payment.payment_id).await.unwrap_err();

    assert!(matches!(err, AllocationError::Store(AppError::DatabaseError(_))));
    t.store.set_fail_commits(false);
    assert!(!t.reload_payment(payment.payment_id).await.unwrap().is_allocated);
    assert_eq!(t.store.all_payments().await.len(), 1);
    assert!(t.store.all_allocations().await.is_empty());
    assert_eq!(t.reload_invoice(invoice.invoice_id).await.parsed_status(), InvoiceStatus::Unpaid);
}

#[tokio::test]
async fn test_unavailable_store_surfaces_error() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let payment = t.payment(rep, "100").await;
    t.store.set_unavailable(true);

    let err = t.engine.auto_allocate(payment.payment_id).await.unwrap_err();

    assert!(matches!(err, AllocationError::Store(AppError::ServiceUnavailable)));
}

#[tokio::test]
async fn test_failed_manual_allocation_leaves_invoice_open() {
    let t = ledger();
    let rep = Uuid::new_v4();
    let invoice = t.invoice(rep, "100", day(1)).await;
    let payment = t.payment(rep, "100").await;
    t.store.set_fail_commits(true);

    let result = t.engine.manual_allocate(manual(&payment, &invoice, "100")).await;

    assert!(result.is_err());
    t.store.set_fail_commits(false);
    assert!(t
        .engine
        .allocations_for_invoice(invoice.invoice_id)
        .await
        .unwrap()
        .is_empty());
    let retry = t
        .engine
        .manual_allocate(manual(&payment, &invoice, "100"))
        .await
        .unwrap();
    assert_eq!(retry.invoice_status, InvoiceStatus::Paid);
}
