//! Table definitions.
//!
//! Every statement is `CREATE ... IF NOT EXISTS`, so [`initialize`] is safe
//! to call on every open. Parent tables come before their dependents.

use chrono::{DateTime, Utc};

use super::database::Database;
use crate::error::Result;

/// SQL expression for "now" in the same format as [`timestamp`].
pub const SQL_NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

/// Millisecond-precision UTC timestamp that sorts lexically like `SQL_NOW`.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Business-entity and checkpoint tables, in creation order.
pub const CORE_TABLES: [&str; 9] = [
    "projects",
    "documents",
    "requirements",
    "epics",
    "tasks",
    "agent_logs",
    "entropy_events",
    "decision_logs",
    "checkpoints",
];

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    name           TEXT    NOT NULL UNIQUE,
    status         TEXT    NOT NULL DEFAULT 'pending',
    current_phase  TEXT,
    last_milestone TEXT,
    metadata       TEXT
);

CREATE TABLE IF NOT EXISTS documents (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name       TEXT    NOT NULL,
    content    TEXT,
    version    INTEGER NOT NULL DEFAULT 1,
    status     TEXT    NOT NULL DEFAULT 'draft'
);

CREATE TABLE IF NOT EXISTS requirements (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id  INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    description TEXT    NOT NULL,
    priority    TEXT    NOT NULL DEFAULT 'medium',
    status      TEXT    NOT NULL DEFAULT 'pending',
    metadata    TEXT,
    created_at  TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS epics (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id  INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name        TEXT    NOT NULL,
    order_index INTEGER NOT NULL DEFAULT 0,
    status      TEXT    NOT NULL DEFAULT 'pending'
);

CREATE TABLE IF NOT EXISTS tasks (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    epic_id         INTEGER NOT NULL REFERENCES epics(id) ON DELETE CASCADE,
    title           TEXT    NOT NULL,
    description     TEXT,
    status          TEXT    NOT NULL DEFAULT 'pending',
    git_commit_hash TEXT,
    updated_at      TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS agent_logs (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id      INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    epic_id      INTEGER          REFERENCES epics(id) ON DELETE CASCADE,
    timestamp    TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    role         TEXT    NOT NULL,
    content_type TEXT    NOT NULL,
    content      TEXT    NOT NULL,
    commit_hash  TEXT
);

CREATE TABLE IF NOT EXISTS entropy_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id      INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    hash_chain   TEXT    NOT NULL,
    error_output TEXT,
    timestamp    TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE IF NOT EXISTS decision_logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id  INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    gate        TEXT    NOT NULL,
    approved    INTEGER NOT NULL,
    feedback    TEXT,
    approved_by TEXT,
    decided_at  TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    thread_id            TEXT    NOT NULL,
    checkpoint_id        INTEGER NOT NULL,
    parent_checkpoint_id INTEGER,
    channel_values       TEXT    NOT NULL,
    metadata             TEXT    NOT NULL,
    created_at           TEXT    NOT NULL,
    PRIMARY KEY (thread_id, checkpoint_id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_epic ON tasks(epic_id);
CREATE INDEX IF NOT EXISTS idx_tasks_git_hash ON tasks(git_commit_hash);
CREATE INDEX IF NOT EXISTS idx_agent_logs_task ON agent_logs(task_id);
"#;

/// Create every table in one transaction.
pub fn initialize(db: &Database) -> Result<()> {
    db.transaction(|| db.with_conn(|conn| conn.execute_batch(DDL)))
}
