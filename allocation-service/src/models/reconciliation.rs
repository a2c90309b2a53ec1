//! Drift reconciliation models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Drift classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DriftStatus {
    Ok,
    Warn,
    Fail,
}

impl DriftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "WARN" => Self::Warn,
            "FAIL" => Self::Fail,
            _ => Self::Ok,
        }
    }
}

impl std::fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a drift computation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriftScope {
    Global,
    Representative(Uuid),
}

impl DriftScope {
    pub fn representative_id(&self) -> Option<Uuid> {
        match self {
            Self::Global => None,
            Self::Representative(id) => Some(*id),
        }
    }

    /// Persisted scope label: `global` or `representative:<id>`.
    pub fn label(&self) -> String {
        match self {
            Self::Global => "global".to_string(),
            Self::Representative(id) => format!("representative:{}", id),
        }
    }

    /// Bounded metric label: `global` or `representative`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Representative(_) => "representative",
        }
    }
}

/// Result of comparing the legacy and ledger aggregates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub scope: DriftScope,
    pub legacy_sum: Decimal,
    pub ledger_sum: Decimal,
    pub diff_abs: Decimal,
    pub diff_ratio: Decimal,
    pub status: DriftStatus,
    pub warn_threshold: Decimal,
    pub fail_threshold: Decimal,
    /// Whether a reconciliation run row was written for this report.
    pub recorded: bool,
}

/// Per-representative drift line used for triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftBreakdownRow {
    pub representative_id: Uuid,
    pub legacy_sum: Decimal,
    pub ledger_sum: Decimal,
    pub diff_abs: Decimal,
    pub diff_ratio: Decimal,
}

/// Persisted drift run. Append-only.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub run_id: Uuid,
    pub scope: String,
    pub diff_abs: Decimal,
    pub diff_ratio: Decimal,
    pub status: String,
    pub mode: String,
    pub meta: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}

impl ReconciliationRun {
    pub fn parsed_status(&self) -> DriftStatus {
        DriftStatus::from_string(&self.status)
    }
}

/// Input for appending a reconciliation run.
#[derive(Debug, Clone)]
pub struct NewReconciliationRun {
    pub scope: String,
    pub diff_abs: Decimal,
    pub diff_ratio: Decimal,
    pub status: DriftStatus,
    pub mode: String,
    pub meta: serde_json::Value,
}
