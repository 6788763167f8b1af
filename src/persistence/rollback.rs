use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use super::database::Database;
use crate::error::{Error, Result};
use crate::flog;

/// Rows removed by [`RelationalRollback::rollback_to_snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    pub agent_logs: usize,
    pub tasks: usize,
    pub requirements: usize,
}

/// Brings relational rows back in line with an earlier checkpoint.
pub struct RelationalRollback {
    db: Arc<Database>,
}

impl RelationalRollback {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Delete the project's agent logs, tasks and requirements that were
    /// written after checkpoint `checkpoint_id` of `thread_id`.
    pub fn rollback_to_snapshot(
        &self,
        project_id: i64,
        thread_id: &str,
        checkpoint_id: i64,
    ) -> Result<RollbackSummary> {
        self.db.transaction(|| {
            let cutoff: String = self
                .db
                .with_conn(|conn| {
                    conn.query_row(
                        "SELECT created_at FROM checkpoints
                         WHERE thread_id = ?1 AND checkpoint_id = ?2",
                        params![thread_id, checkpoint_id],
                        |row| row.get(0),
                    )
                    .optional()
                })?
                .ok_or_else(|| Error::CheckpointNotFound {
                    thread_id: thread_id.to_string(),
                    checkpoint_id,
                })?;

            let summary = self.db.with_conn(|conn| {
                let agent_logs = conn.execute(
                    "DELETE FROM agent_logs
                     WHERE timestamp > ?2
                       AND task_id IN (SELECT t.id FROM tasks t JOIN epics e ON t.epic_id = e.id
                                       WHERE e.project_id = ?1)",
                    params![project_id, cutoff],
                )?;
                let tasks = conn.execute(
                    "DELETE FROM tasks
                     WHERE updated_at > ?2
                       AND epic_id IN (SELECT id FROM epics WHERE project_id = ?1)",
                    params![project_id, cutoff],
                )?;
                let requirements = conn.execute(
                    "DELETE FROM requirements WHERE project_id = ?1 AND created_at > ?2",
                    params![project_id, cutoff],
                )?;
                Ok(RollbackSummary {
                    agent_logs,
                    tasks,
                    requirements,
                })
            })?;

            flog!(
                "rolled back project {} to {}#{}: {:?}",
                project_id,
                thread_id,
                checkpoint_id,
                summary
            );
            Ok(summary)
        })
    }
}
