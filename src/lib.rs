pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod persistence;
pub mod recovery;
pub mod util;
pub mod workflow;

pub use checkpoint::{Checkpoint, CheckpointMetadata, SqliteCheckpointStore};
pub use error::{Error, Result};
pub use orchestration::{GraphEngine, NodeHandler, RunOutcome};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use workflow::{GraphState, HitlApprovalSignal, HitlGate, NodeId, ProjectStatus, Transition};
