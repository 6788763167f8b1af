//! Task git-integration node.
//!
//! Couples an optional integrity check, a workspace snapshot and a git hash
//! write into one step that runs after a task is verified. Collaborator
//! errors are not caught here; they reach the engine and route to `error`.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::workflow::{update_task, GraphState, ProjectStatus, StateDelta};
use crate::{flog_debug, flog_warn};

/// Context handed to the snapshot manager for a task commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotContext {
    pub task_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub is_clean: bool,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DirtyWorkspace,
    DetachedHead,
    UnreachableHead,
    CorruptObject,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ViolationKind::DirtyWorkspace => "dirty_workspace",
            ViolationKind::DetachedHead => "detached_head",
            ViolationKind::UnreachableHead => "unreachable_head",
            ViolationKind::CorruptObject => "corrupt_object",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    pub kind: ViolationKind,
    pub detail: String,
}

impl IntegrityViolation {
    pub fn new(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityCheckResult {
    pub passed: bool,
    pub is_dirty: bool,
    pub is_detached_head: bool,
    pub head_reachable: bool,
    pub violations: Vec<IntegrityViolation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStoreCheckResult {
    pub passed: bool,
    pub violations: Vec<IntegrityViolation>,
}

/// Version-control snapshots of the agent workspace.
#[allow(async_fn_in_trait)]
pub trait SnapshotManager {
    async fn initialize(&self) -> Result<()>;

    /// Commit pending workspace changes for a task. `None` when there was
    /// nothing to commit.
    async fn create_task_snapshot(
        &self,
        task_id: &str,
        context: &SnapshotContext,
    ) -> Result<Option<String>>;

    /// Commit whatever is in the workspace and return the snapshot id.
    async fn take_snapshot(&self, message: &str) -> Result<String>;

    async fn get_status(&self) -> Result<WorkspaceStatus>;
}

/// Workspace and object-store integrity verification.
#[allow(async_fn_in_trait)]
pub trait IntegrityChecker {
    async fn verify_workspace(&self) -> Result<IntegrityCheckResult>;
    async fn check_object_store_integrity(&self) -> Result<ObjectStoreCheckResult>;
}

/// Durable home of a task's commit hash.
#[allow(async_fn_in_trait)]
pub trait GitHashStore {
    async fn update_git_hash(&self, task_db_id: i64, hash: &str) -> Result<()>;
}

/// Snapshot the active task's work and record the resulting commit.
///
/// - no active task: empty delta
/// - integrity failure: `security_pause`, no snapshot taken
/// - `None` snapshot: empty delta
/// - `Some(hash)`: the active task's `git_hash` is set, and persisted when
///   both `store` and `task_db_id` are given
pub async fn task_git_node<S, C, R>(
    state: &GraphState,
    snapshot: &S,
    checker: Option<&C>,
    store: Option<&R>,
    task_db_id: Option<i64>,
) -> Result<StateDelta>
where
    S: SnapshotManager,
    C: IntegrityChecker,
    R: GitHashStore,
{
    let Some(task) = state.active_task() else {
        return Ok(StateDelta::default());
    };

    if let Some(checker) = checker {
        let workspace = checker.verify_workspace().await?;
        let objects = checker.check_object_store_integrity().await?;
        if !workspace.passed || !objects.passed {
            let violations: Vec<String> = workspace
                .violations
                .iter()
                .chain(objects.violations.iter())
                .map(|v| format!("{}: {}", v.kind, v.detail))
                .collect();
            flog_warn!(
                "integrity check failed for task {}, pausing: {}",
                task.task_id,
                violations.join("; ")
            );
            return Ok(StateDelta::status(
                &state.project_config,
                ProjectStatus::SecurityPause,
            ));
        }
    }

    snapshot.initialize().await?;
    let context = SnapshotContext {
        task_name: task.name.clone(),
    };
    let Some(hash) = snapshot.create_task_snapshot(&task.task_id, &context).await? else {
        flog_debug!("task {} left no changes to snapshot", task.task_id);
        return Ok(StateDelta::default());
    };

    flog_debug!("task {} snapshot {}", task.task_id, hash);
    let tasks = update_task(&state.tasks, &task.task_id, |t| t.git_hash = Some(hash.clone()));

    if let (Some(store), Some(id)) = (store, task_db_id) {
        store.update_git_hash(id, &hash).await?;
    }

    Ok(StateDelta {
        tasks: Some(tasks),
        ..Default::default()
    })
}
