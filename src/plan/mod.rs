//! Plan model and content-addressed plan store.

pub mod model;
pub mod store;

pub use model::{
    Change, ChangeAction, CheckType, ClusterOperation, OperationType, Plan, PlannedOperation,
    PlannedPhase, ResourceEstimate, SafetyCheck, Severity, Target, ValidationIssue,
    ValidationResult,
};
pub use store::{PlanMetadata, PlanStore};
