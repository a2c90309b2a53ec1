//! Common test utilities for allocation-service integration tests.

#![allow(dead_code)]

use allocation_service::models::{Invoice, ManualAllocationRequest, NewInvoice, NewPayment, Payment};
use allocation_service::services::{
    AllocationEngine, DriftThresholds, FeatureFlagManager, FixedClock, FlagStore, LedgerStore,
    MemoryLedgerStore, ReconciliationService,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,allocation_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// The day every test ledger considers "today".
pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 6, 1).unwrap()
}

/// A day in January 2026.
pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, d).unwrap()
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Engine, reconciliation and flags wired to one in-memory store.
pub struct TestLedger {
    pub store: Arc<MemoryLedgerStore>,
    pub flags: Arc<FeatureFlagManager>,
    pub engine: AllocationEngine<MemoryLedgerStore>,
    pub reconciliation: Arc<ReconciliationService<MemoryLedgerStore>>,
}

pub fn ledger() -> TestLedger {
    init_tracing();

    let store = Arc::new(MemoryLedgerStore::new());
    let flag_store: Arc<dyn FlagStore> = store.clone();
    let flags = Arc::new(FeatureFlagManager::new(Some(flag_store)));
    let engine = AllocationEngine::new(store.clone(), flags.clone())
        .with_clock(Arc::new(FixedClock(today())));
    let reconciliation = Arc::new(ReconciliationService::new(
        store.clone(),
        flags.clone(),
        DriftThresholds::default(),
    ));

    TestLedger {
        store,
        flags,
        engine,
        reconciliation,
    }
}

impl TestLedger {
    pub async fn invoice(&self, representative_id: Uuid, amount: &str, issued: NaiveDate) -> Invoice {
        self.invoice_due(representative_id, amount, issued, None).await
    }

    pub async fn invoice_due(
        &self,
        representative_id: Uuid,
        amount: &str,
        issued: NaiveDate,
        due: Option<NaiveDate>,
    ) -> Invoice {
        self.store
            .insert_invoice(&NewInvoice {
                representative_id,
                invoice_number: None,
                amount: dec(amount),
                issue_date: issued,
                due_date: due,
            })
            .await
            .expect("Failed to insert invoice")
    }

    pub async fn payment(&self, representative_id: Uuid, amount: &str) -> Payment {
        self.store
            .insert_payment(&NewPayment::received(representative_id, dec(amount), day(15)))
            .await
            .expect("Failed to insert payment")
    }

    /// A historical payment flagged allocated with no ledger rows behind it.
    pub async fn legacy_payment(&self, representative_id: Uuid, amount: &str) -> Payment {
        let mut payment = NewPayment::received(representative_id, dec(amount), day(15));
        payment.is_allocated = true;
        self.store
            .insert_payment(&payment)
            .await
            .expect("Failed to insert legacy payment")
    }

    pub async fn reload_invoice(&self, invoice_id: Uuid) -> Invoice {
        self.store
            .get_invoice(invoice_id)
            .await
            .unwrap()
            .expect("invoice disappeared")
    }

    pub async fn reload_payment(&self, payment_id: Uuid) -> Option<Payment> {
        self.store.get_payment(payment_id).await.unwrap()
    }
}

pub fn manual(payment: &Payment, invoice: &Invoice, amount: &str) -> ManualAllocationRequest {
    ManualAllocationRequest {
        payment_id: payment.payment_id,
        invoice_id: invoice.invoice_id,
        amount: dec(amount),
        performed_by: "operator@test".to_string(),
        reason: Some("test allocation".to_string()),
    }
}
