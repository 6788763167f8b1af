//! Durable, append-only snapshots of `GraphState` keyed by thread.

mod store;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::workflow::{GraphState, NodeId, Transition};

pub use store::SqliteCheckpointStore;

/// What produced a checkpoint and where the graph goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// 1-based count of steps executed on the thread.
    pub step: u64,
    pub node: NodeId,
    pub next: Transition,
}

impl FromSql for CheckpointMetadata {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        serde_json::from_str(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// One immutable checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: i64,
    pub parent_checkpoint_id: Option<i64>,
    /// Serialized `GraphState`, stored byte for byte.
    pub payload: String,
    pub metadata: CheckpointMetadata,
    pub created_at: String,
}

impl Checkpoint {
    pub fn state(&self) -> Result<GraphState> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// Whether the thread is waiting on a gate at this checkpoint.
    pub fn is_suspended(&self) -> bool {
        matches!(self.metadata.next, Transition::Suspended(_))
    }
}
