//! Task completion that keeps the `tasks` table and git history in step.
//!
//! The status update, the commit and the hash write share one async
//! savepoint. A task is never stored as completed without its commit hash,
//! and a hash is never stored for a commit that did not happen.

use super::task_git::SnapshotManager;
use crate::error::Result;
use crate::persistence::{StateRepository, TaskRepository};
use crate::workflow::TaskStatus;
use crate::{flog, flog_debug};

pub struct GitAtomicManager<S> {
    state: StateRepository,
    tasks: TaskRepository,
    snapshot: S,
}

impl<S: SnapshotManager> GitAtomicManager<S> {
    pub fn new(state: StateRepository, snapshot: S) -> Self {
        let tasks = TaskRepository::new(state.database().clone());
        Self {
            state,
            tasks,
            snapshot,
        }
    }

    /// Mark `task_db_id` completed, commit the workspace and record the hash.
    ///
    /// On any failure the task row is left exactly as it was.
    pub async fn commit_task_change(&self, task_db_id: i64, commit_message: &str) -> Result<String> {
        flog_debug!("GitAtomicManager::commit_task_change task={}", task_db_id);
        let hash = self
            .state
            .database()
            .transaction_async(|| async move {
                self.state
                    .update_task_status(task_db_id, TaskStatus::Completed)?;
                let hash = self.snapshot.take_snapshot(commit_message).await?;
                self.tasks.update_git_hash(task_db_id, &hash)?;
                Ok(hash)
            })
            .await?;
        flog!("task {} committed as {}", task_db_id, hash);
        Ok(hash)
    }
}
