//! Core pipeline type definitions.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle status of a pipeline run.
///
/// The value doubles as the failure class seen by operators:
/// `Error` will be retried, `StrategyPivot` needs a new plan and
/// `SecurityPause` needs a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Run created, no node executed yet
    #[default]
    Initializing,
    /// Discovery and report generation
    Researching,
    /// PRD/TAS blueprinting, awaiting or revising design approval
    Specifying,
    /// Requirement distillation and task DAG generation
    Planning,
    /// Task implementation loop
    Implementing,
    /// Forced strategy change (budget, repetition or repeated failure)
    StrategyPivot,
    /// Workspace integrity failure, human intervention required
    SecurityPause,
    /// A node failed and was routed to error recovery
    Error,
    /// Every task completed
    Completed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Initializing => "initializing",
            ProjectStatus::Researching => "researching",
            ProjectStatus::Specifying => "specifying",
            ProjectStatus::Planning => "planning",
            ProjectStatus::Implementing => "implementing",
            ProjectStatus::StrategyPivot => "strategy_pivot",
            ProjectStatus::SecurityPause => "security_pause",
            ProjectStatus::Error => "error",
            ProjectStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier of a node in the pipeline graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Research,
    Design,
    /// Suspend point for the design approval gate
    ApproveDesign,
    Distill,
    /// Suspend point for the task DAG approval gate
    ApproveTaskDag,
    Implement,
    Verify,
    Error,
    PivotAgent,
}

impl NodeId {
    pub const ALL: [NodeId; 9] = [
        NodeId::Research,
        NodeId::Design,
        NodeId::ApproveDesign,
        NodeId::Distill,
        NodeId::ApproveTaskDag,
        NodeId::Implement,
        NodeId::Verify,
        NodeId::Error,
        NodeId::PivotAgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeId::Research => "research",
            NodeId::Design => "design",
            NodeId::ApproveDesign => "approve_design",
            NodeId::Distill => "distill",
            NodeId::ApproveTaskDag => "approve_task_dag",
            NodeId::Implement => "implement",
            NodeId::Verify => "verify",
            NodeId::Error => "error",
            NodeId::PivotAgent => "pivot_agent",
        }
    }

    /// The approval gate this node suspends on, if it is a HITL node.
    pub fn gate(&self) -> Option<HitlGate> {
        match self {
            NodeId::ApproveDesign => Some(HitlGate::DesignApproval),
            NodeId::ApproveTaskDag => Some(HitlGate::DagApproval),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        NodeId::ALL
            .into_iter()
            .find(|node| node.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown node: {}", s)))
    }
}

/// Human approval gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlGate {
    DesignApproval,
    DagApproval,
}

impl HitlGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            HitlGate::DesignApproval => "design_approval",
            HitlGate::DagApproval => "dag_approval",
        }
    }

    /// The graph node that suspends on this gate.
    pub fn node(&self) -> NodeId {
        match self {
            HitlGate::DesignApproval => NodeId::ApproveDesign,
            HitlGate::DagApproval => NodeId::ApproveTaskDag,
        }
    }
}

impl std::fmt::Display for HitlGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where the graph goes after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum Transition {
    Next(NodeId),
    /// Reached a gate node; waiting for an approval signal.
    Suspended(HitlGate),
    End,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Next(node) => write!(f, "-> {}", node),
            Transition::Suspended(gate) => write!(f, "suspended on {}", gate),
            Transition::End => write!(f, "end"),
        }
    }
}

/// Status of a single task.
///
/// `Resumed` marks a task that was `InProgress` when the process died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Resumed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Resumed => "resumed",
        }
    }

    /// Whether the task still has work left.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Resumed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "resumed" => Ok(TaskStatus::Resumed),
            other => Err(Error::Validation(format!("Unknown task status: {}", other))),
        }
    }
}

/// Classification of a captured failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Expected to self-resolve on retry
    Transient,
    /// Programming or contract violation
    Logic,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Logic => write!(f, "logic"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}
