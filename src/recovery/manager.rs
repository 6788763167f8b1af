//! RecoveryManager - locate the last committed checkpoint and reconcile task rows.

use std::sync::Arc;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, SqliteCheckpointStore};
use crate::orchestration::{find_stale_or_dirty_states, StaleTaskState};
use crate::persistence::Database;
use crate::{flog, flog_debug, Result};

/// Where a recovered thread should continue from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryHandle {
    pub thread_id: String,
    pub checkpoint_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub handle: Option<RecoveryHandle>,
    /// Tasks still `in_progress` in the latest checkpointed state.
    pub stale_tasks: Vec<StaleTaskState>,
    /// `tasks` rows flipped from `in_progress` to `resumed`.
    pub resumed_tasks: usize,
}

pub struct RecoveryManager {
    store: SqliteCheckpointStore,
    db: Arc<Database>,
}

impl RecoveryManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            store: SqliteCheckpointStore::new(db.clone()),
            db,
        }
    }

    pub fn has_checkpoint(&self, thread_id: &str) -> Result<bool> {
        Ok(self.get_checkpoint_count(thread_id)? > 0)
    }

    pub fn get_checkpoint_count(&self, thread_id: &str) -> Result<usize> {
        self.store.count(thread_id)
    }

    pub fn get_latest_checkpoint(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        self.store.latest(thread_id)
    }

    /// Handle for the most recent checkpoint of `thread_id`, if any.
    pub fn recover_project(&self, thread_id: &str) -> Result<Option<RecoveryHandle>> {
        let handle = self.store.latest(thread_id)?.map(|cp| RecoveryHandle {
            thread_id: cp.thread_id,
            checkpoint_id: cp.checkpoint_id,
        });
        match &handle {
            Some(h) => flog!(
                "recovery: thread {} resumes from checkpoint {}",
                h.thread_id,
                h.checkpoint_id
            ),
            None => flog_debug!("recovery: no checkpoint for thread {}", thread_id),
        }
        Ok(handle)
    }

    /// Flip every `in_progress` task of the project to `resumed`.
    pub fn mark_in_progress_tasks_as_resumed(&self, project_db_id: i64) -> Result<usize> {
        let changed = self.db.transaction(|| {
            self.db.with_conn(|conn| {
                conn.execute(
                    "UPDATE tasks
                     SET    status = 'resumed'
                     WHERE  status = 'in_progress'
                       AND  epic_id IN (SELECT id FROM epics WHERE project_id = ?1)",
                    params![project_db_id],
                )
            })
        })?;
        flog_debug!(
            "recovery: {} task(s) of project {} marked resumed",
            changed,
            project_db_id
        );
        Ok(changed)
    }

    /// Recover the thread and, when the numeric project id is known, mark
    /// its interrupted task rows as resumed.
    pub fn reconcile(&self, thread_id: &str, project_db_id: Option<i64>) -> Result<RecoveryReport> {
        let stale_tasks = match self.store.latest(thread_id)? {
            Some(cp) => find_stale_or_dirty_states(&cp.state()?),
            None => Vec::new(),
        };
        let handle = self.recover_project(thread_id)?;
        let resumed_tasks = match project_db_id {
            Some(id) => self.mark_in_progress_tasks_as_resumed(id)?,
            None => 0,
        };
        Ok(RecoveryReport {
            handle,
            stale_tasks,
            resumed_tasks,
        })
    }
}
