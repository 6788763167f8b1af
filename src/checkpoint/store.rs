use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{Checkpoint, CheckpointMetadata};
use crate::error::{Error, Result};
use crate::persistence::schema::timestamp;
use crate::persistence::Database;
use crate::workflow::GraphState;
use crate::{flog_debug, flog_trace};

/// Append-only checkpoint log in the `checkpoints` table.
///
/// Every query is scoped by `thread_id`; ids start at 1 and increase by one
/// per thread.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    db: Arc<Database>,
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        thread_id: row.get("thread_id")?,
        checkpoint_id: row.get("checkpoint_id")?,
        parent_checkpoint_id: row.get("parent_checkpoint_id")?,
        payload: row.get("channel_values")?,
        metadata: row.get("metadata")?,
        created_at: row.get("created_at")?,
    })
}

impl SqliteCheckpointStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Serialize `state` and append it as the thread's next checkpoint.
    pub fn put(
        &self,
        thread_id: &str,
        state: &GraphState,
        metadata: CheckpointMetadata,
    ) -> Result<Checkpoint> {
        let payload = serde_json::to_string(state)?;
        let metadata_json = serde_json::to_string(&metadata)?;
        let created_at = timestamp(Utc::now());

        let (checkpoint_id, parent) = self.db.transaction(|| {
            self.db.with_conn(|conn| {
                let parent: Option<i64> = conn.query_row(
                    "SELECT MAX(checkpoint_id) FROM checkpoints WHERE thread_id = ?1",
                    [thread_id],
                    |row| row.get(0),
                )?;
                let id = parent.unwrap_or(0) + 1;
                conn.execute(
                    "INSERT INTO checkpoints
                         (thread_id, checkpoint_id, parent_checkpoint_id, channel_values, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![thread_id, id, parent, payload, metadata_json, created_at],
                )?;
                Ok((id, parent))
            })
        })?;

        flog_trace!(
            "checkpoint {}#{} step={} node={} next={}",
            thread_id,
            checkpoint_id,
            metadata.step,
            metadata.node,
            metadata.next
        );
        Ok(Checkpoint {
            thread_id: thread_id.to_string(),
            checkpoint_id,
            parent_checkpoint_id: parent,
            payload,
            metadata,
            created_at,
        })
    }

    /// The thread's highest-numbered checkpoint.
    pub fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM checkpoints WHERE thread_id = ?1
                 ORDER BY checkpoint_id DESC LIMIT 1",
                [thread_id],
                checkpoint_from_row,
            )
            .optional()
        })
    }

    pub fn get(&self, thread_id: &str, checkpoint_id: i64) -> Result<Checkpoint> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT * FROM checkpoints WHERE thread_id = ?1 AND checkpoint_id = ?2",
                    params![thread_id, checkpoint_id],
                    checkpoint_from_row,
                )
                .optional()
            })?
            .ok_or_else(|| Error::CheckpointNotFound {
                thread_id: thread_id.to_string(),
                checkpoint_id,
            })
    }

    /// All checkpoints of a thread, oldest first.
    pub fn list(&self, thread_id: &str) -> Result<Vec<Checkpoint>> {
        self.db.with_conn(|conn| {
            conn.prepare("SELECT * FROM checkpoints WHERE thread_id = ?1 ORDER BY checkpoint_id")?
                .query_map([thread_id], checkpoint_from_row)?
                .collect()
        })
    }

    pub fn count(&self, thread_id: &str) -> Result<usize> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE thread_id = ?1",
                [thread_id],
                |row| row.get(0),
            )
        })?;
        Ok(count as usize)
    }

    pub fn delete_thread(&self, thread_id: &str) -> Result<usize> {
        flog_debug!("SqliteCheckpointStore::delete_thread thread={}", thread_id);
        self.db.transaction(|| {
            self.db.with_conn(|conn| {
                conn.execute("DELETE FROM checkpoints WHERE thread_id = ?1", [thread_id])
            })
        })
    }
}
