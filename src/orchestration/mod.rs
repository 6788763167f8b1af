//! Orchestration layer for the flightdeck pipeline.
//!
//! The graph itself is a pure step function over [`GraphState`]; the
//! [`GraphEngine`] drives it, runs node side effects through a
//! [`NodeHandler`], and checkpoints after every step. Approval gates,
//! error recovery and git coupling each live in their own module.
//!
//! [`GraphState`]: crate::workflow::GraphState

mod engine;
mod git_atomic;
mod guard;
pub mod hitl;
mod nodes;
pub mod robustness;
pub mod task_git;

pub use engine::{GitIntegration, GraphEngine, NodeHandler, NoopHandler, RunOutcome};
pub use git_atomic::GitAtomicManager;
pub use guard::{StateTransitionGuard, PRE_TOOL_EXECUTION};
pub use nodes::{
    design_node, distill_node, implement_node, research_node, route_after_implement,
    route_after_verify, step, step_with, verify_node,
};
pub use robustness::{find_stale_or_dirty_states, mask_sensitive_data, RobustnessLimits, StaleTaskState};
pub use task_git::{
    task_git_node, GitHashStore, IntegrityCheckResult, IntegrityChecker, IntegrityViolation,
    ObjectStoreCheckResult, SnapshotContext, SnapshotManager, ViolationKind, WorkspaceStatus,
};
