//! Domain models for allocation-service.

mod allocation;
mod audit;
mod flag;
mod invoice;
mod payment;
mod reconciliation;

pub use allocation::{
    AllocationLine, AllocationMethod, AllocationRecord, AllocationReversal, AutoAllocation,
    ManualAllocation, ManualAllocationRequest, NewAllocation,
};
pub use audit::{AuditStatus, AuditTransaction, AuditType, NewAuditTransaction, RollbackData};
pub use flag::{FeatureFlag, FeatureFlagState, FlagContext, FlagState};
pub use invoice::{Invoice, InvoiceStatus, NewInvoice};
pub use payment::{NewPayment, Payment};
pub use reconciliation::{
    DriftBreakdownRow, DriftReport, DriftScope, DriftStatus, NewReconciliationRun,
    ReconciliationRun,
};
