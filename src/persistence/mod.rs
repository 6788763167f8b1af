//! SQLite-backed storage: connection and transactions, schema, and the
//! business-entity repositories.

mod database;
mod rollback;
pub mod schema;
mod state_repository;
mod task_repository;

use std::path::Path;

pub use database::Database;
pub use rollback::{RelationalRollback, RollbackSummary};
pub use state_repository::{
    AgentLog, DecisionLog, Document, EntropyEvent, Epic, Project, ProjectState, Requirement,
    StateRepository, Task,
};
pub use task_repository::TaskRepository;

/// Open the database file with owner-only permissions and the full schema.
pub fn open_database(path: &Path) -> crate::Result<Database> {
    Database::open(path)
}
