//! service-core: Shared infrastructure for the ledger services.
pub mod config;
pub mod error;
pub mod observability;

pub use tracing;
