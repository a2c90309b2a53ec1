//! Audit transaction model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    Pending,
    Completed,
    RolledBack,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "COMPLETED" => Self::Completed,
            "ROLLED_BACK" => Self::RolledBack,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditType {
    PaymentAutoAllocate,
    PaymentManualAllocate,
}

impl AuditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentAutoAllocate => "PAYMENT_AUTO_ALLOCATE",
            Self::PaymentManualAllocate => "PAYMENT_MANUAL_ALLOCATE",
        }
    }
}

/// Business-level record of one mutating allocation.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct AuditTransaction {
    pub transaction_id: String,
    pub transaction_type: String,
    pub status: String,
    pub representative_id: Uuid,
    pub payment_id: Uuid,
    pub original_state: serde_json::Value,
    pub target_state: serde_json::Value,
    pub actual_state: Option<serde_json::Value>,
    pub rollback_data: Option<serde_json::Value>,
    pub initiated_by: String,
    pub reason: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub rolled_back_utc: Option<DateTime<Utc>>,
}

impl AuditTransaction {
    pub fn parsed_status(&self) -> AuditStatus {
        AuditStatus::from_string(&self.status)
    }

    /// Decode the rollback payload written on completion.
    pub fn parsed_rollback_data(&self) -> Option<RollbackData> {
        self.rollback_data
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Input for opening a PENDING audit transaction.
#[derive(Debug, Clone)]
pub struct NewAuditTransaction {
    pub transaction_id: String,
    pub transaction_type: AuditType,
    pub representative_id: Uuid,
    pub payment_id: Uuid,
    pub original_state: serde_json::Value,
    pub target_state: serde_json::Value,
    pub initiated_by: String,
    pub reason: Option<String>,
}

/// What an explicit rollback needs to undo a completed allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackData {
    pub payment_id: Uuid,
    pub remainder_payment_id: Option<Uuid>,
    pub invoice_ids: Vec<Uuid>,
    pub allocation_ids: Vec<Uuid>,
    pub previous_invoice_pointer: Option<Uuid>,
}
