use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use super::database::Database;
use super::schema::SQL_NOW;
use super::state_repository::Task;
use crate::error::{Error, Result};
use crate::flog_debug;
use crate::orchestration::task_git::GitHashStore;

/// Task-row access used by the git integration.
#[derive(Clone)]
pub struct TaskRepository {
    db: Arc<Database>,
}

impl TaskRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn update_git_hash(&self, task_id: i64, hash: &str) -> Result<()> {
        flog_debug!("TaskRepository::update_git_hash id={} hash={}", task_id, hash);
        let changed = self.db.transaction(|| {
            self.db.with_conn(|conn| {
                conn.execute(
                    &format!(
                        "UPDATE tasks SET git_commit_hash = ?1, updated_at = {} WHERE id = ?2",
                        SQL_NOW
                    ),
                    params![hash, task_id],
                )
            })
        })?;
        if changed == 0 {
            return Err(Error::TaskNotFound {
                id: task_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT * FROM tasks WHERE id = ?1", [task_id], Task::from_row)
                .optional()
        })
    }

    pub fn get_task_by_git_hash(&self, hash: &str) -> Result<Option<Task>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM tasks WHERE git_commit_hash = ?1 ORDER BY id LIMIT 1",
                [hash],
                Task::from_row,
            )
            .optional()
        })
    }
}

impl GitHashStore for TaskRepository {
    async fn update_git_hash(&self, task_db_id: i64, hash: &str) -> Result<()> {
        TaskRepository::update_git_hash(self, task_db_id, hash)
    }
}
