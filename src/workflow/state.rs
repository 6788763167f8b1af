//! The pipeline state aggregate and the deltas nodes return.
//!
//! `GraphState` is the single value threaded through every node and the
//! exact payload of a checkpoint. Nodes never mutate it directly: they
//! return a `StateDelta` that the engine merges with [`GraphState::apply`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{ErrorKind, HitlGate, NodeId, ProjectStatus, TaskStatus};

/// Identity and lifecycle status of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Thread identity under which checkpoints are stored.
    pub project_id: String,
    pub name: String,
    pub status: ProjectStatus,
}

/// A unit of implementation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub epic_id: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub agent_role: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub git_hash: Option<String>,
    /// Row id of the matching `tasks` row, when the task is persisted.
    #[serde(default)]
    pub db_id: Option<i64>,
}

impl TaskRecord {
    pub fn new(task_id: &str, epic_id: &str, name: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            epic_id: epic_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            agent_role: "developer".to_string(),
            depends_on: Vec::new(),
            git_hash: None,
            db_id: None,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_db_id(mut self, id: i64) -> Self {
        self.db_id = Some(id);
        self
    }
}

/// One captured failure. Appended to `error_history`, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error_id: String,
    pub captured_at: DateTime<Utc>,
    pub source_node: String,
    /// Already passed through secret masking.
    pub message: String,
    pub stack_trace: String,
    pub kind: ErrorKind,
    pub consecutive_count: u32,
    pub task_id: Option<String>,
}

/// A failure caught at the engine boundary, waiting for the error node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaughtError {
    /// Already passed through secret masking.
    pub message: String,
    pub stack_trace: String,
}

/// Evidence that an agent produced the same failing output again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntropyRecord {
    pub output_hash: String,
    pub seen_at: DateTime<Utc>,
    pub task_id: String,
    pub loop_count: u32,
}

/// The payload a human supplies to resume a suspended gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitlApprovalSignal {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub approved_by: Option<String>,
    pub approved_at: DateTime<Utc>,
}

impl HitlApprovalSignal {
    pub fn approve() -> Self {
        Self {
            approved: true,
            feedback: None,
            approved_by: None,
            approved_at: Utc::now(),
        }
    }

    pub fn reject(feedback: &str) -> Self {
        Self {
            approved: false,
            feedback: Some(feedback.to_string()),
            approved_by: None,
            approved_at: Utc::now(),
        }
    }

    pub fn by(mut self, who: &str) -> Self {
        self.approved_by = Some(who.to_string());
        self
    }
}

/// A recorded human decision. Routing consults the latest one per gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitlDecisionRecord {
    pub gate: HitlGate,
    pub signal: HitlApprovalSignal,
    pub decided_at: DateTime<Utc>,
}

/// The aggregate threaded through every node and serialized into checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphState {
    pub project_config: ProjectConfig,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
    #[serde(default)]
    pub active_task_id: Option<String>,
    #[serde(default)]
    pub hitl_decisions: Vec<HitlDecisionRecord>,
    #[serde(default)]
    pub pending_approval_gate: Option<HitlGate>,
    #[serde(default)]
    pub pending_recovery_node: Option<NodeId>,
    /// Failure caught by the engine, consumed by the error node.
    #[serde(default)]
    pub pending_error: Option<CaughtError>,
    #[serde(default)]
    pub error_history: Vec<ErrorRecord>,
    #[serde(default)]
    pub entropy: Vec<EntropyRecord>,
    #[serde(default)]
    pub implementation_turns: u32,
    pub status: ProjectStatus,
}

impl GraphState {
    pub fn new(project_id: &str, name: &str) -> Self {
        Self {
            project_config: ProjectConfig {
                project_id: project_id.to_string(),
                name: name.to_string(),
                status: ProjectStatus::Initializing,
            },
            tasks: Vec::new(),
            active_task_id: None,
            hitl_decisions: Vec::new(),
            pending_approval_gate: None,
            pending_recovery_node: None,
            pending_error: None,
            error_history: Vec::new(),
            entropy: Vec::new(),
            implementation_turns: 0,
            status: ProjectStatus::Initializing,
        }
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskRecord>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_config.project_id
    }

    pub fn active_task(&self) -> Option<&TaskRecord> {
        self.task(self.active_task_id.as_deref()?)
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// The most recent decision recorded for `gate`.
    pub fn latest_decision(&self, gate: HitlGate) -> Option<&HitlDecisionRecord> {
        self.hitl_decisions.iter().rev().find(|d| d.gate == gate)
    }

    /// Merge a node's delta into this state.
    pub fn apply(&mut self, delta: StateDelta) {
        if let Some(config) = delta.project_config {
            self.project_config = config;
        }
        if let Some(tasks) = delta.tasks {
            self.tasks = tasks;
        }
        if let Some(active) = delta.active_task_id {
            self.active_task_id = active;
        }
        self.hitl_decisions.extend(delta.new_hitl_decisions);
        if let Some(gate) = delta.pending_approval_gate {
            self.pending_approval_gate = gate;
        }
        if let Some(node) = delta.pending_recovery_node {
            self.pending_recovery_node = node;
        }
        if let Some(caught) = delta.pending_error {
            self.pending_error = caught;
        }
        self.error_history.extend(delta.new_errors);
        self.entropy.extend(delta.new_entropy);
        if let Some(turns) = delta.implementation_turns {
            self.implementation_turns = turns;
        }
        if let Some(status) = delta.status {
            self.status = status;
        }
    }
}

/// Partial update returned by a node.
///
/// `Option<Option<_>>` fields distinguish "leave unchanged" (`None`) from
/// "clear" (`Some(None)`). Vector fields named `new_*` are appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDelta {
    pub project_config: Option<ProjectConfig>,
    pub tasks: Option<Vec<TaskRecord>>,
    pub active_task_id: Option<Option<String>>,
    pub new_hitl_decisions: Vec<HitlDecisionRecord>,
    pub pending_approval_gate: Option<Option<HitlGate>>,
    pub pending_recovery_node: Option<Option<NodeId>>,
    pub pending_error: Option<Option<CaughtError>>,
    pub new_errors: Vec<ErrorRecord>,
    pub new_entropy: Vec<EntropyRecord>,
    pub implementation_turns: Option<u32>,
    pub status: Option<ProjectStatus>,
}

impl StateDelta {
    /// A delta that moves both status fields to `status`.
    pub fn status(config: &ProjectConfig, status: ProjectStatus) -> Self {
        Self {
            status: Some(status),
            project_config: Some(ProjectConfig {
                status,
                ..config.clone()
            }),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Return a copy of `tasks` with `f` applied to the task named `task_id`.
///
/// Every other element is cloned unchanged.
pub fn update_task<F>(tasks: &[TaskRecord], task_id: &str, f: F) -> Vec<TaskRecord>
where
    F: FnOnce(&mut TaskRecord),
{
    let mut f = Some(f);
    tasks
        .iter()
        .map(|task| {
            let mut task = task.clone();
            if task.task_id == task_id {
                if let Some(f) = f.take() {
                    f(&mut task);
                }
            }
            task
        })
        .collect()
}
