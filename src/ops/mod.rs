//! Extension operations
//!
//! Submission, validation, execution and tracking of extension
//! operations: one bill, a parsed CSV batch, or an auto-selected set of
//! expiring bills.

mod model;
mod orchestrator;
mod retry;

pub use model::{
    AutoSelectSpec, BillItemSpec, FailureKind, ItemError, ItemState, Operation, OperationItem,
    OperationStatus, OperationType, SubmitError, SubmitRequest, Summary,
};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use retry::{calculate_backoff_with_jitter, RetryPolicy};
