//! Drift reconciliation between the legacy allocated flag and the allocation ledger.
//!
//! Read-only with respect to payments, invoices and allocations. The only write is the
//! optional [`ReconciliationRun`] row, gated by the `active_reconciliation` flag.

use crate::models::{
    DriftBreakdownRow, DriftReport, DriftScope, DriftStatus, FeatureFlag, NewReconciliationRun,
    Payment, ReconciliationRun,
};
use crate::services::flags::FeatureFlagManager;
use crate::services::metrics::{record_drift_run, record_error};
use crate::services::store::LedgerStore;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// Legacy allocation aggregate computed on demand from payment rows: the full
/// `amount` of every payment flagged allocated. A remainder split off by the engine
/// is not subtracted, so it shows up as drift.
pub struct LegacyAllocationView<S: LedgerStore> {
    store: Arc<S>,
}

impl<S: LedgerStore> LegacyAllocationView<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn by_representative(
        &self,
        representative_id: Option<Uuid>,
    ) -> Result<BTreeMap<Uuid, Decimal>, AppError> {
        Ok(self
            .store
            .legacy_allocated_by_representative(representative_id)
            .await?
            .into_iter()
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftThresholds {
    pub warn: Decimal,
    pub fail: Decimal,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            warn: Decimal::new(5, 4),
            fail: Decimal::new(5, 3),
        }
    }
}

impl DriftThresholds {
    pub fn new(warn: Decimal, fail: Decimal) -> Result<Self, AppError> {
        if warn < Decimal::ZERO || fail < warn {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Drift thresholds must satisfy 0 <= warn <= fail (warn={}, fail={})",
                warn,
                fail
            )));
        }
        Ok(Self { warn, fail })
    }

    pub fn classify(&self, diff_ratio: Decimal) -> DriftStatus {
        if diff_ratio >= self.fail {
            DriftStatus::Fail
        } else if diff_ratio >= self.warn {
            DriftStatus::Warn
        } else {
            DriftStatus::Ok
        }
    }
}

/// `(|legacy − ledger|, diff / max(legacy, 1))`.
pub fn drift(legacy_sum: Decimal, ledger_sum: Decimal) -> (Decimal, Decimal) {
    let diff_abs = (legacy_sum - ledger_sum).abs();
    let denominator = legacy_sum.max(Decimal::ONE);
    (diff_abs, diff_abs / denominator)
}

pub struct ReconciliationService<S: LedgerStore> {
    store: Arc<S>,
    legacy: LegacyAllocationView<S>,
    flags: Arc<FeatureFlagManager>,
    thresholds: DriftThresholds,
}

impl<S: LedgerStore> ReconciliationService<S> {
    pub fn new(store: Arc<S>, flags: Arc<FeatureFlagManager>, thresholds: DriftThresholds) -> Self {
        Self {
            legacy: LegacyAllocationView::new(store.clone()),
            store,
            flags,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> DriftThresholds {
        self.thresholds
    }

    /// Compare legacy and ledger totals for a scope.
    #[instrument(skip(self), fields(scope = %scope.label()))]
    pub async fn compute_drift(&self, scope: DriftScope) -> Result<DriftReport, AppError> {
        let representative_id = scope.representative_id();
        let legacy_sum: Decimal = self
            .legacy
            .by_representative(representative_id)
            .await?
            .values()
            .sum();
        let ledger_sum: Decimal = self
            .store
            .ledger_allocated_by_representative(representative_id)
            .await?
            .into_iter()
            .map(|(_, amount)| amount)
            .sum();

        let (diff_abs, diff_ratio) = drift(legacy_sum, ledger_sum);
        let status = self.thresholds.classify(diff_ratio);

        let mode = self.flags.state(FeatureFlag::ActiveReconciliation);
        match status {
            DriftStatus::Fail => error!(
                legacy_sum = %legacy_sum,
                ledger_sum = %ledger_sum,
                diff_ratio = %diff_ratio,
                "Allocation drift above fail threshold"
            ),
            DriftStatus::Warn => warn!(
                legacy_sum = %legacy_sum,
                ledger_sum = %ledger_sum,
                diff_ratio = %diff_ratio,
                "Allocation drift above warn threshold"
            ),
            DriftStatus::Ok => debug!(diff_ratio = %diff_ratio, mode = mode.as_str(), "Allocation drift within tolerance"),
        }

        let mut recorded = false;
        if mode.records() {
            let run = NewReconciliationRun {
                scope: scope.label(),
                diff_abs,
                diff_ratio,
                status,
                mode: mode.as_str().to_string(),
                meta: json!({
                    "legacy_sum": legacy_sum,
                    "ledger_sum": ledger_sum,
                    "warn_threshold": self.thresholds.warn,
                    "fail_threshold": self.thresholds.fail,
                }),
            };
            match self.store.insert_reconciliation_run(&run).await {
                Ok(_) => recorded = true,
                Err(e) => {
                    error!(error = %e, "Reconciliation run insert failed");
                    record_error("reconciliation_run_insert");
                }
            }
        }
        record_drift_run(
            scope.kind(),
            status.as_str(),
            recorded,
            diff_ratio.to_f64().unwrap_or_default(),
        );

        Ok(DriftReport {
            scope,
            legacy_sum,
            ledger_sum,
            diff_abs,
            diff_ratio,
            status,
            warn_threshold: self.thresholds.warn,
            fail_threshold: self.thresholds.fail,
            recorded,
        })
    }

    /// Per-representative drift, worst first.
    #[instrument(skip(self))]
    pub async fn breakdown(&self, limit: usize) -> Result<Vec<DriftBreakdownRow>, AppError> {
        let legacy = self.legacy.by_representative(None).await?;
        let ledger: BTreeMap<Uuid, Decimal> = self
            .store
            .ledger_allocated_by_representative(None)
            .await?
            .into_iter()
            .collect();

        let mut representatives: Vec<Uuid> = legacy.keys().chain(ledger.keys()).copied().collect();
        representatives.sort();
        representatives.dedup();

        let mut rows: Vec<DriftBreakdownRow> = representatives
            .into_iter()
            .map(|representative_id| {
                let legacy_sum = legacy.get(&representative_id).copied().unwrap_or_default();
                let ledger_sum = ledger.get(&representative_id).copied().unwrap_or_default();
                let (diff_abs, diff_ratio) = drift(legacy_sum, ledger_sum);
                DriftBreakdownRow {
                    representative_id,
                    legacy_sum,
                    ledger_sum,
                    diff_abs,
                    diff_ratio,
                }
            })
            .collect();
        // stable: equal ratios keep representative id order
        rows.sort_by(|a, b| b.diff_ratio.cmp(&a.diff_ratio));
        rows.truncate(limit);
        Ok(rows)
    }

    /// Most recent persisted runs, newest first.
    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<ReconciliationRun>, AppError> {
        self.store.list_reconciliation_runs(limit).await
    }

    /// Payments flagged allocated that have no ledger row. Read-only.
    #[instrument(skip(self))]
    pub async fn backfill_candidates(&self, limit: i64) -> Result<Vec<Payment>, AppError> {
        let candidates = self.store.backfill_candidates(limit).await?;
        debug!(count = candidates.len(), "Listed backfill candidates");
        Ok(candidates)
    }
}
