//! Feature flag models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Staged rollout state shared by every flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagState {
    /// Nothing runs.
    Off,
    /// Computes and records, does not govern live behavior.
    Dry,
    /// Computes only. Never records, never governs.
    Shadow,
    /// Computes, records and governs live behavior.
    Enforce,
}

impl FlagState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Dry => "dry",
            Self::Shadow => "shadow",
            Self::Enforce => "enforce",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(Self::Off),
            "dry" => Some(Self::Dry),
            "shadow" => Some(Self::Shadow),
            "enforce" => Some(Self::Enforce),
            _ => None,
        }
    }

    /// States in which results are persisted.
    pub fn records(&self) -> bool {
        matches!(self, Self::Dry | Self::Enforce)
    }
}

impl std::fmt::Display for FlagState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flags read by the engine and the reconciliation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFlag {
    /// Gates persistence of drift runs.
    ActiveReconciliation,
    /// Maintains the legacy single-invoice pointer on payments.
    AllocationDualWrite,
    /// In-transaction invariant re-checks before commit.
    AllocationRuntimeGuards,
}

impl FeatureFlag {
    pub const ALL: [FeatureFlag; 3] = [
        FeatureFlag::ActiveReconciliation,
        FeatureFlag::AllocationDualWrite,
        FeatureFlag::AllocationRuntimeGuards,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveReconciliation => "active_reconciliation",
            Self::AllocationDualWrite => "allocation_dual_write",
            Self::AllocationRuntimeGuards => "allocation_runtime_guards",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }
}

impl std::fmt::Display for FeatureFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted flag row.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct FeatureFlagState {
    pub name: String,
    pub state: String,
    pub rollout_percentage: i32,
    pub last_changed_by: String,
    pub reason: Option<String>,
    pub updated_utc: DateTime<Utc>,
}

impl FeatureFlagState {
    /// Initial row for a flag nobody has touched yet.
    pub fn initial(flag: FeatureFlag) -> Self {
        Self {
            name: flag.as_str().to_string(),
            state: FlagState::Off.as_str().to_string(),
            rollout_percentage: 100,
            last_changed_by: "init".to_string(),
            reason: None,
            updated_utc: Utc::now(),
        }
    }

    pub fn parsed_state(&self) -> FlagState {
        FlagState::parse(&self.state).unwrap_or(FlagState::Off)
    }
}

/// Per-call context for percentage gating.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagContext {
    pub representative_id: Option<uuid::Uuid>,
}

impl FlagContext {
    pub fn representative(id: uuid::Uuid) -> Self {
        Self {
            representative_id: Some(id),
        }
    }
}
