//! Feature flag / staged-rollout manager.
//!
//! Reads are lock-free against a [`DashMap`]; writes are serialized through a single
//! writer lock and written through to the [`FlagStore`] when one is configured.

use crate::models::{FeatureFlag, FeatureFlagState, FlagContext, FlagState};
use crate::services::metrics::record_flag_transition;
use crate::services::store::FlagStore;
use chrono::Utc;
use dashmap::DashMap;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const EMERGENCY_ACTOR: &str = "emergency";

pub struct FeatureFlagManager {
    flags: DashMap<FeatureFlag, FeatureFlagState>,
    store: Option<Arc<dyn FlagStore>>,
    writer: Mutex<()>,
}

impl FeatureFlagManager {
    /// Every flag starts `off` at 100% rollout.
    pub fn new(store: Option<Arc<dyn FlagStore>>) -> Self {
        let flags = DashMap::new();
        for flag in FeatureFlag::ALL {
            flags.insert(flag, FeatureFlagState::initial(flag));
        }
        Self {
            flags,
            store,
            writer: Mutex::new(()),
        }
    }

    /// A manager with no persistence, for tests and local runs.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Replace in-memory flags with the persisted rows. Unknown names are ignored.
    #[instrument(skip(self))]
    pub async fn hydrate(&self) -> Result<usize, AppError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let _guard = self.writer.lock().await;
        let rows = store.load_flags().await?;
        let mut loaded = 0;
        for row in rows {
            match FeatureFlag::parse(&row.name) {
                Some(flag) => {
                    info!(flag = %flag, state = %row.state, rollout = row.rollout_percentage, "Feature flag loaded");
                    self.flags.insert(flag, row);
                    loaded += 1;
                }
                None => warn!(name = %row.name, "Ignoring unknown persisted feature flag"),
            }
        }
        Ok(loaded)
    }

    /// Current state of a flag.
    pub fn state(&self, flag: FeatureFlag) -> FlagState {
        self.flags
            .get(&flag)
            .map(|f| f.parsed_state())
            .unwrap_or(FlagState::Off)
    }

    /// Full row for a flag.
    pub fn get(&self, flag: FeatureFlag) -> FeatureFlagState {
        self.flags
            .get(&flag)
            .map(|f| f.clone())
            .unwrap_or_else(|| FeatureFlagState::initial(flag))
    }

    /// All flags ordered by name.
    pub fn snapshot(&self) -> Vec<FeatureFlagState> {
        let mut all: Vec<FeatureFlagState> = self.flags.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Whether a flag is active for the given context.
    ///
    /// A flag below 100% rollout is only active for representatives whose bucket
    /// falls under the percentage; without a representative it is inactive.
    pub fn is_enabled(&self, flag: FeatureFlag, context: &FlagContext) -> bool {
        let Some(entry) = self.flags.get(&flag) else {
            return false;
        };
        if entry.parsed_state() == FlagState::Off {
            return false;
        }
        let percentage = entry.rollout_percentage;
        if percentage >= 100 {
            return true;
        }
        if percentage <= 0 {
            return false;
        }
        match context.representative_id {
            Some(id) => i32::from(rollout_bucket(id)) < percentage,
            None => false,
        }
    }

    /// Move a flag to a new state. Setting the current state again is a no-op.
    #[instrument(skip(self, reason), fields(flag = %flag, state = %state))]
    pub async fn set_flag_state(
        &self,
        flag: FeatureFlag,
        state: FlagState,
        changed_by: &str,
        reason: &str,
    ) -> Result<FeatureFlagState, AppError> {
        let _guard = self.writer.lock().await;
        let current = self.get(flag);
        if current.parsed_state() == state {
            return Ok(current);
        }

        let next = FeatureFlagState {
            state: state.as_str().to_string(),
            last_changed_by: changed_by.to_string(),
            reason: Some(reason.to_string()),
            updated_utc: Utc::now(),
            ..current
        };
        if let Some(store) = &self.store {
            store.save_flag(&next).await?;
        }
        self.flags.insert(flag, next.clone());

        record_flag_transition(flag.as_str(), state.as_str());
        info!(changed_by = %changed_by, reason = %reason, "Feature flag state changed");
        Ok(next)
    }

    /// Change the rollout percentage (0–100) of a flag.
    #[instrument(skip(self), fields(flag = %flag))]
    pub async fn set_rollout(
        &self,
        flag: FeatureFlag,
        percentage: i32,
        changed_by: &str,
    ) -> Result<FeatureFlagState, AppError> {
        if !(0..=100).contains(&percentage) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Rollout percentage must be between 0 and 100, got {}",
                percentage
            )));
        }
        let _guard = self.writer.lock().await;
        let next = FeatureFlagState {
            rollout_percentage: percentage,
            last_changed_by: changed_by.to_string(),
            updated_utc: Utc::now(),
            ..self.get(flag)
        };
        if let Some(store) = &self.store {
            store.save_flag(&next).await?;
        }
        self.flags.insert(flag, next.clone());
        info!(percentage = percentage, changed_by = %changed_by, "Feature flag rollout changed");
        Ok(next)
    }

    /// Force every flag to `off`.
    ///
    /// The in-memory switch happens before persistence so it takes effect even when
    /// the store is unreachable; persistence failures are logged, not returned.
    #[instrument(skip(self))]
    pub async fn emergency_disable_all(&self, reason: &str) -> Vec<FeatureFlagState> {
        let _guard = self.writer.lock().await;
        error!(reason = %reason, "EMERGENCY: disabling all feature flags");

        let mut changed = Vec::new();
        for flag in FeatureFlag::ALL {
            let current = self.get(flag);
            if current.parsed_state() == FlagState::Off {
                continue;
            }
            let next = FeatureFlagState {
                state: FlagState::Off.as_str().to_string(),
                last_changed_by: EMERGENCY_ACTOR.to_string(),
                reason: Some(reason.to_string()),
                updated_utc: Utc::now(),
                ..current
            };
            self.flags.insert(flag, next.clone());
            record_flag_transition(flag.as_str(), FlagState::Off.as_str());
            changed.push(next);
        }

        if let Some(store) = &self.store {
            for row in &changed {
                if let Err(e) = store.save_flag(row).await {
                    error!(flag = %row.name, error = %e, "Failed to persist emergency flag change");
                }
            }
        }
        changed
    }
}

/// Deterministic 0–99 bucket for a representative.
pub fn rollout_bucket(representative_id: Uuid) -> u8 {
    let digest = Sha256::digest(representative_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % 100) as u8
}
