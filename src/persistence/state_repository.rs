//! Business-entity storage.
//!
//! Every write goes through [`Database::transaction`]; a caller that needs
//! several writes to be atomic wraps them in [`StateRepository::transaction`]
//! and the per-method transactions nest as savepoints. Free text headed for
//! `agent_logs` and `entropy_events` is masked before it is stored.

use std::sync::Arc;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::database::Database;
use super::schema::{timestamp, SQL_NOW};
use crate::error::{Error, Result};
use crate::flog_debug;
use crate::orchestration::robustness::mask_sensitive_data;
use crate::workflow::{HitlDecisionRecord, TaskStatus};

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: Error| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Option<i64>,
    pub name: String,
    pub status: String,
    pub current_phase: Option<String>,
    pub last_milestone: Option<String>,
    pub metadata: Option<String>,
}

impl Project {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            status: "pending".to_string(),
            current_phase: None,
            last_milestone: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Option<i64>,
    pub project_id: i64,
    pub name: String,
    pub content: Option<String>,
    pub version: i64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: Option<i64>,
    pub project_id: i64,
    pub description: String,
    pub priority: String,
    pub status: String,
    pub metadata: Option<String>,
}

impl Requirement {
    pub fn new(project_id: i64, description: &str) -> Self {
        Self {
            id: None,
            project_id,
            description: description.to_string(),
            priority: "medium".to_string(),
            status: "pending".to_string(),
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epic {
    pub id: Option<i64>,
    pub project_id: i64,
    pub name: String,
    pub order_index: i64,
    pub status: String,
}

impl Epic {
    pub fn new(project_id: i64, name: &str, order_index: i64) -> Self {
        Self {
            id: None,
            project_id,
            name: name.to_string(),
            order_index,
            status: "pending".to_string(),
        }
    }
}

/// A persisted task row. `status` is the durable counterpart of
/// `TaskRecord::status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Option<i64>,
    pub epic_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub git_commit_hash: Option<String>,
}

impl Task {
    pub fn new(epic_id: i64, title: &str) -> Self {
        Self {
            id: None,
            epic_id,
            title: title.to_string(),
            description: None,
            status: TaskStatus::Pending,
            git_commit_hash: None,
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            epic_id: row.get("epic_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            status: row.get("status")?,
            git_commit_hash: row.get("git_commit_hash")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentLog {
    pub id: Option<i64>,
    pub task_id: i64,
    pub epic_id: Option<i64>,
    pub timestamp: Option<String>,
    pub role: String,
    pub content_type: String,
    pub content: String,
    pub commit_hash: Option<String>,
}

impl AgentLog {
    pub fn new(task_id: i64, role: &str, content_type: &str, content: &str) -> Self {
        Self {
            id: None,
            task_id,
            epic_id: None,
            timestamp: None,
            role: role.to_string(),
            content_type: content_type.to_string(),
            content: content.to_string(),
            commit_hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntropyEvent {
    pub id: Option<i64>,
    pub task_id: i64,
    pub hash_chain: String,
    pub error_output: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionLog {
    pub id: i64,
    pub project_id: i64,
    pub gate: String,
    pub approved: bool,
    pub feedback: Option<String>,
    pub approved_by: Option<String>,
    pub decided_at: String,
}

/// Everything stored for one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    pub project: Project,
    pub documents: Vec<Document>,
    pub requirements: Vec<Requirement>,
    pub epics: Vec<Epic>,
    pub tasks: Vec<Task>,
    pub agent_logs: Vec<AgentLog>,
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        status: row.get("status")?,
        current_phase: row.get("current_phase")?,
        last_milestone: row.get("last_milestone")?,
        metadata: row.get("metadata")?,
    })
}

fn agent_log_from_row(row: &Row<'_>) -> rusqlite::Result<AgentLog> {
    Ok(AgentLog {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        epic_id: row.get("epic_id")?,
        timestamp: row.get("timestamp")?,
        role: row.get("role")?,
        content_type: row.get("content_type")?,
        content: row.get("content")?,
        commit_hash: row.get("commit_hash")?,
    })
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<DecisionLog> {
    Ok(DecisionLog {
        id: row.get(0)?,
        project_id: row.get(1)?,
        gate: row.get(2)?,
        approved: row.get(3)?,
        feedback: row.get(4)?,
        approved_by: row.get(5)?,
        decided_at: row.get(6)?,
    })
}

#[derive(Clone)]
pub struct StateRepository {
    db: Arc<Database>,
}

impl StateRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Run several repository calls as one atomic unit.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.db.transaction(f)
    }

    /// Insert a project, or update status/phase/metadata of the one with the same name.
    pub fn upsert_project(&self, project: &Project) -> Result<i64> {
        flog_debug!("StateRepository::upsert_project name={}", project.name);
        self.db.transaction(|| {
            self.db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO projects (name, status, current_phase, last_milestone, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(name) DO UPDATE SET
                         status = excluded.status,
                         current_phase = excluded.current_phase,
                         last_milestone = excluded.last_milestone,
                         metadata = excluded.metadata",
                    params![
                        project.name,
                        project.status,
                        project.current_phase,
                        project.last_milestone,
                        project.metadata
                    ],
                )?;
                conn.query_row(
                    "SELECT id FROM projects WHERE name = ?1",
                    [&project.name],
                    |row| row.get(0),
                )
            })
        })
    }

    pub fn add_document(&self, doc: &Document) -> Result<i64> {
        self.db.transaction(|| {
            self.db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO documents (project_id, name, content, version, status)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![doc.project_id, doc.name, doc.content, doc.version, doc.status],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
    }

    pub fn save_requirements(&self, reqs: &[Requirement]) -> Result<Vec<i64>> {
        self.db.transaction(|| {
            self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "INSERT INTO requirements (project_id, description, priority, status, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                reqs.iter()
                    .map(|r| {
                        stmt.insert(params![
                            r.project_id,
                            r.description,
                            r.priority,
                            r.status,
                            r.metadata
                        ])
                    })
                    .collect()
            })
        })
    }

    pub fn save_epics(&self, epics: &[Epic]) -> Result<Vec<i64>> {
        self.db.transaction(|| {
            self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "INSERT INTO epics (project_id, name, order_index, status)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                epics
                    .iter()
                    .map(|e| stmt.insert(params![e.project_id, e.name, e.order_index, e.status]))
                    .collect()
            })
        })
    }

    pub fn save_tasks(&self, tasks: &[Task]) -> Result<Vec<i64>> {
        self.db.transaction(|| {
            self.db.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "INSERT INTO tasks (epic_id, title, description, status, git_commit_hash)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                tasks
                    .iter()
                    .map(|t| {
                        stmt.insert(params![
                            t.epic_id,
                            t.title,
                            t.description,
                            t.status,
                            t.git_commit_hash
                        ])
                    })
                    .collect()
            })
        })
    }

    pub fn update_task_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
        flog_debug!("StateRepository::update_task_status id={} status={}", task_id, status);
        let changed = self.db.transaction(|| {
            self.db.with_conn(|conn| {
                conn.execute(
                    &format!(
                        "UPDATE tasks SET status = ?1, updated_at = {} WHERE id = ?2",
                        SQL_NOW
                    ),
                    params![status, task_id],
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

    pub fn append_agent_log(&self, log: &AgentLog) -> Result<i64> {
        let content = mask_sensitive_data(&log.content);
        self.db.transaction(|| {
            self.db.with_conn(|conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO agent_logs
                             (task_id, epic_id, timestamp, role, content_type, content, commit_hash)
                         VALUES (?1, ?2, COALESCE(?3, {}), ?4, ?5, ?6, ?7)",
                        SQL_NOW
                    ),
                    params![
                        log.task_id,
                        log.epic_id,
                        log.timestamp,
                        log.role,
                        log.content_type,
                        content,
                        log.commit_hash
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
    }

    pub fn record_entropy_event(&self, event: &EntropyEvent) -> Result<i64> {
        let output = event.error_output.as_deref().map(mask_sensitive_data);
        self.db.transaction(|| {
            self.db.with_conn(|conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO entropy_events (task_id, hash_chain, error_output, timestamp)
                         VALUES (?1, ?2, ?3, COALESCE(?4, {}))",
                        SQL_NOW
                    ),
                    params![event.task_id, event.hash_chain, output, event.timestamp],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
    }

    /// Append a human gate decision to the decision log.
    pub fn record_decision(&self, project_id: i64, decision: &HitlDecisionRecord) -> Result<i64> {
        let feedback = decision.signal.feedback.as_deref().map(mask_sensitive_data);
        self.db.transaction(|| {
            self.db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO decision_logs
                         (project_id, gate, approved, feedback, approved_by, decided_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        project_id,
                        decision.gate.as_str(),
                        decision.signal.approved,
                        feedback,
                        decision.signal.approved_by,
                        timestamp(decision.decided_at)
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT * FROM projects WHERE id = ?1", [id], project_from_row)
                .optional()
        })
    }

    pub fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM projects WHERE name = ?1",
                [name],
                project_from_row,
            )
            .optional()
        })
    }

    /// Load a project together with all of its child rows.
    pub fn get_project_state(&self, id: i64) -> Result<Option<ProjectState>> {
        let Some(project) = self.get_project(id)? else {
            return Ok(None);
        };

        self.db.with_conn(|conn| {
            let documents = conn
                .prepare(
                    "SELECT id, project_id, name, content, version, status
                     FROM documents WHERE project_id = ?1 ORDER BY id",
                )?
                .query_map([id], |row| {
                    Ok(Document {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        name: row.get(2)?,
                        content: row.get(3)?,
                        version: row.get(4)?,
                        status: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let requirements = conn
                .prepare(
                    "SELECT id, project_id, description, priority, status, metadata
                     FROM requirements WHERE project_id = ?1 ORDER BY id",
                )?
                .query_map([id], |row| {
                    Ok(Requirement {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        description: row.get(2)?,
                        priority: row.get(3)?,
                        status: row.get(4)?,
                        metadata: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let epics = conn
                .prepare(
                    "SELECT id, project_id, name, order_index, status
                     FROM epics WHERE project_id = ?1 ORDER BY order_index, id",
                )?
                .query_map([id], |row| {
                    Ok(Epic {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        name: row.get(2)?,
                        order_index: row.get(3)?,
                        status: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let tasks = conn
                .prepare(
                    "SELECT t.* FROM tasks t JOIN epics e ON t.epic_id = e.id
                     WHERE e.project_id = ?1 ORDER BY t.id",
                )?
                .query_map([id], Task::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let agent_logs = conn
                .prepare(
                    "SELECT l.* FROM agent_logs l
                     JOIN tasks t ON l.task_id = t.id
                     JOIN epics e ON t.epic_id = e.id
                     WHERE e.project_id = ?1 ORDER BY l.id",
                )?
                .query_map([id], agent_log_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(Some(ProjectState {
                project,
                documents,
                requirements,
                epics,
                tasks,
                agent_logs,
            }))
        })
    }

    pub fn get_task_logs(&self, task_id: i64) -> Result<Vec<AgentLog>> {
        self.db.with_conn(|conn| {
            conn.prepare("SELECT * FROM agent_logs WHERE task_id = ?1 ORDER BY id")?
                .query_map([task_id], agent_log_from_row)?
                .collect()
        })
    }

    pub fn get_entropy_events(&self, task_id: i64) -> Result<Vec<EntropyEvent>> {
        self.db.with_conn(|conn| {
            conn.prepare(
                "SELECT id, task_id, hash_chain, error_output, timestamp
                 FROM entropy_events WHERE task_id = ?1 ORDER BY id",
            )?
            .query_map([task_id], |row| {
                Ok(EntropyEvent {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    hash_chain: row.get(2)?,
                    error_output: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?
            .collect()
        })
    }

    /// Project that owns the task row, through its epic.
    pub fn project_of_task(&self, task_id: i64) -> Result<Option<i64>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT e.project_id FROM tasks t JOIN epics e ON e.id = t.epic_id
                 WHERE t.id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    /// Decisions whose gate, feedback or approver contains `query`, ignoring
    /// ASCII case.
    pub fn search_decisions(&self, project_id: i64, query: &str) -> Result<Vec<DecisionLog>> {
        let escaped = query
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{}%", escaped);
        self.db.with_conn(|conn| {
            conn.prepare(
                "SELECT id, project_id, gate, approved, feedback, approved_by, decided_at
                 FROM decision_logs
                 WHERE project_id = ?1
                   AND (gate LIKE ?2 ESCAPE '\\'
                        OR feedback LIKE ?2 ESCAPE '\\'
                        OR approved_by LIKE ?2 ESCAPE '\\')
                 ORDER BY id",
            )?
            .query_map(params![project_id, pattern], decision_from_row)?
            .collect()
        })
    }

    pub fn get_decisions(&self, project_id: i64) -> Result<Vec<DecisionLog>> {
        self.db.with_conn(|conn| {
            conn.prepare(
                "SELECT id, project_id, gate, approved, feedback, approved_by, decided_at
                 FROM decision_logs WHERE project_id = ?1 ORDER BY id",
            )?
            .query_map([project_id], decision_from_row)?
            .collect()
        })
    }
}
