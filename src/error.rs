use thiserror::Error;

use crate::workflow::NodeId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    #[error("Project not found: {id}")]
    ProjectNotFound { id: String },

    #[error("Checkpoint {checkpoint_id} not found for thread {thread_id}")]
    CheckpointNotFound {
        thread_id: String,
        checkpoint_id: i64,
    },

    #[error("No checkpoint recorded for thread {thread_id}")]
    NoCheckpoint { thread_id: String },

    #[error("Thread {thread_id} is not suspended at an approval gate")]
    NotSuspended { thread_id: String },

    #[error("Node '{node}' failed: {message}")]
    Node { node: NodeId, message: String },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Git integrity violations detected: {0}")]
    Integrity(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
