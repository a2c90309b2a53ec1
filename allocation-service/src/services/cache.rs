//! Downstream financial cache invalidation.
//!
//! Called only after an allocation has committed. Failures are logged by the
//! engine and never affect the allocation result.

use async_trait::async_trait;
use service_core::error::AppError;
use uuid::Uuid;

#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate_representative(&self, representative_id: Uuid) -> Result<(), AppError>;
}

/// Used when no downstream cache is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCacheInvalidator;

#[async_trait]
impl CacheInvalidator for NoopCacheInvalidator {
    async fn invalidate_representative(&self, representative_id: Uuid) -> Result<(), AppError> {
        tracing::debug!(representative_id = %representative_id, "No financial cache configured");
        Ok(())
    }
}
