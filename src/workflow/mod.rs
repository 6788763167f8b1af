//! Pipeline domain model.
//!
//! Node identifiers, statuses and the serializable `GraphState` aggregate
//! that every node reads and every checkpoint stores.

mod dag;
mod state;
mod types;

pub use dag::TaskGraph;
pub use state::{
    update_task, CaughtError, EntropyRecord, ErrorRecord, GraphState, HitlApprovalSignal,
    HitlDecisionRecord, ProjectConfig, StateDelta, TaskRecord,
};
pub use types::{ErrorKind, HitlGate, NodeId, ProjectStatus, TaskStatus, Transition};
