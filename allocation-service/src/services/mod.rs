//! Services module for allocation-service.

pub mod allocation;
pub mod audit;
pub mod cache;
pub mod clock;
pub mod database;
pub mod flags;
pub mod memory;
pub mod metrics;
pub mod reconciliation;
pub mod scheduler;
pub mod status;
pub mod store;

pub use allocation::{AllocationEngine, SYSTEM_ACTOR};
pub use cache::{CacheInvalidator, NoopCacheInvalidator};
pub use clock::{Clock, FixedClock, SystemClock};
pub use database::{Database, PgLedgerTx};
pub use flags::{rollout_bucket, FeatureFlagManager};
pub use memory::{MemoryLedgerStore, MemoryLedgerTx};
pub use metrics::{get_metrics, init_metrics};
pub use reconciliation::{DriftThresholds, LegacyAllocationView, ReconciliationService};
pub use scheduler::DriftScheduler;
pub use store::{FlagStore, LedgerStore, LedgerTx};
