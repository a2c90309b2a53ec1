//! Periodic drift detection.

use crate::models::{DriftReport, DriftScope};
use crate::services::metrics::{record_drift_failure, record_error};
use crate::services::reconciliation::ReconciliationService;
use crate::services::store::LedgerStore;
use service_core::error::AppError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct RunCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Re-arming global drift check.
///
/// The next run is armed only after the previous one finishes. Cancellation is
/// observed while waiting; a run that has started always completes.
pub struct DriftScheduler<S: LedgerStore> {
    reconciliation: Arc<ReconciliationService<S>>,
    interval: Duration,
    counters: Arc<RunCounters>,
    shutdown_token: CancellationToken,
}

impl<S: LedgerStore> Clone for DriftScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            reconciliation: self.reconciliation.clone(),
            interval: self.interval,
            counters: self.counters.clone(),
            shutdown_token: self.shutdown_token.clone(),
        }
    }
}

impl<S: LedgerStore> DriftScheduler<S> {
    pub fn new(reconciliation: Arc<ReconciliationService<S>>, interval: Duration) -> Self {
        Self {
            reconciliation,
            interval,
            counters: Arc::new(RunCounters::default()),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        let shutdown = self.shutdown_token.clone();

        tracing::info!(interval_secs = self.interval.as_secs(), "Starting drift scheduler");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Drift scheduler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(scheduler.interval) => {}
                }
                // Errors are counted inside run_once; the loop keeps going.
                let _ = scheduler.run_once().await;
            }
        })
    }

    /// One global drift computation, counted as completed or failed.
    pub async fn run_once(&self) -> Result<DriftReport, AppError> {
        match self.reconciliation.compute_drift(DriftScope::Global).await {
            Ok(report) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    status = %report.status,
                    diff_ratio = %report.diff_ratio,
                    recorded = report.recorded,
                    "Scheduled drift check completed"
                );
                Ok(report)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                record_drift_failure();
                record_error(e.kind());
                tracing::error!(error = %e, "Scheduled drift check failed");
                Err(e)
            }
        }
    }

    pub fn stop(&self) {
        tracing::info!("Stopping drift scheduler");
        self.shutdown_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn completed_runs(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn failed_runs(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }
}
