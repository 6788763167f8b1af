//! Failure policy for the pipeline.
//!
//! Everything here is a pure function of its inputs: classification and
//! masking of captured errors, consecutive-failure counting, the
//! implementation turn budget and repetition ("entropy") loop detection.
//! Node functions return a [`StateDelta`]; nothing mutates the state passed in.
//!
//! Escalation rules:
//! - three consecutive identical failures of the same task route to `pivot_agent`
//! - `implementation_turns >= MAX_IMPLEMENTATION_TURNS` forces a pivot
//! - an entropy record for the active task with `loop_count >= ENTROPY_LOOP_THRESHOLD`
//!   forces a pivot
//!
//! When the turn budget and the entropy loop breach together, the turn budget
//! wins: it is checked first and its delta is returned unchanged.

use std::sync::LazyLock;

use chrono::Utc;
use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::flog_warn;
use crate::workflow::{
    update_task, EntropyRecord, ErrorKind, ErrorRecord, GraphState, NodeId, ProjectStatus,
    StateDelta, TaskStatus,
};

/// Passes through `implement` allowed before a forced pivot.
pub const MAX_IMPLEMENTATION_TURNS: u32 = 10;

/// Consecutive identical failures that escalate to `pivot_agent`.
pub const CONSECUTIVE_ERROR_PIVOT_THRESHOLD: u32 = 3;

/// Repeats of the same failing output that count as a loop.
pub const ENTROPY_LOOP_THRESHOLD: u32 = 3;

/// Redaction rules applied in order by [`mask_sensitive_data`].
static SENSITIVE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)Bearer\s+[A-Za-z0-9\-._~+/]+=*").unwrap(),
            "Bearer [REDACTED]",
        ),
        (
            Regex::new(r#"(?i)(?:api[_-]?key|apikey|x-api-key)[=:\s]+['"]?[\w\-]{8,}['"]?"#)
                .unwrap(),
            "[API_KEY=REDACTED]",
        ),
        (Regex::new(r"AKIA[0-9A-Z]{16}").unwrap(), "[AWS_KEY=REDACTED]"),
        (
            Regex::new(r#"(?i)(?:password|passwd|secret|token)[=:\s]+['"]?[^\s'"]{4,}['"]?"#)
                .unwrap(),
            "[SECRET=REDACTED]",
        ),
        (
            Regex::new(r"(?i)https?://[^:@\s]+:[^@\s]+@").unwrap(),
            "https://[CREDENTIALS_REDACTED]@",
        ),
    ]
});

const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "econnreset",
    "econnrefused",
    "connection reset",
    "network",
    "503",
    "429",
];

const LOGIC_SIGNATURES: &[&str] = &[
    "typeerror",
    "referenceerror",
    "assertion",
    "invariant",
    "cannot read",
    "is not a function",
    "undefined is not",
];

/// Tunable thresholds. `Default` uses the crate constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RobustnessLimits {
    pub max_implementation_turns: u32,
    pub consecutive_error_threshold: u32,
    pub entropy_loop_threshold: u32,
}

impl Default for RobustnessLimits {
    fn default() -> Self {
        Self {
            max_implementation_turns: MAX_IMPLEMENTATION_TURNS,
            consecutive_error_threshold: CONSECUTIVE_ERROR_PIVOT_THRESHOLD,
            entropy_loop_threshold: ENTROPY_LOOP_THRESHOLD,
        }
    }
}

/// A failure as seen by the error recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSource {
    /// A real error with a message and a (possibly empty) cause chain.
    Error { message: String, stack: String },
    /// Anything that is not an error value; only its string form is kept.
    Value(String),
}

impl ErrorSource {
    pub fn message(&self) -> &str {
        match self {
            ErrorSource::Error { message, .. } => message,
            ErrorSource::Value(v) => v,
        }
    }

    fn stack(&self) -> &str {
        match self {
            ErrorSource::Error { stack, .. } => stack,
            ErrorSource::Value(_) => "",
        }
    }
}

impl From<&crate::Error> for ErrorSource {
    fn from(err: &crate::Error) -> Self {
        let mut stack = Vec::new();
        let mut cause = std::error::Error::source(err);
        while let Some(inner) = cause {
            stack.push(format!("caused by: {}", inner));
            cause = inner.source();
        }
        ErrorSource::Error {
            message: err.to_string(),
            stack: stack.join("\n"),
        }
    }
}

/// Redact bearer tokens, API keys, AWS access keys, password-like
/// assignments and credentials embedded in URLs.
pub fn mask_sensitive_data(text: &str) -> String {
    let mut masked = text.to_string();
    for (pattern, replacement) in SENSITIVE_PATTERNS.iter() {
        if pattern.is_match(&masked) {
            masked = pattern
                .replace_all(&masked, NoExpand(replacement))
                .into_owned();
        }
    }
    masked
}

pub fn classify_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if TRANSIENT_SIGNATURES.iter().any(|s| lower.contains(s)) {
        ErrorKind::Transient
    } else if LOGIC_SIGNATURES.iter().any(|s| lower.contains(s)) {
        ErrorKind::Logic
    } else {
        ErrorKind::Unknown
    }
}

fn new_error_id() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(5).collect();
    format!("err-{}-{}", Utc::now().timestamp_millis(), suffix)
}

pub fn build_error_record(
    source: &ErrorSource,
    source_node: &str,
    task_id: Option<&str>,
    consecutive_count: u32,
) -> ErrorRecord {
    ErrorRecord {
        error_id: new_error_id(),
        captured_at: Utc::now(),
        source_node: source_node.to_string(),
        message: mask_sensitive_data(source.message()),
        stack_trace: mask_sensitive_data(source.stack()),
        kind: classify_error(source.message()),
        consecutive_count,
        task_id: task_id.map(str::to_string),
    }
}

/// Count the current failure plus every directly preceding record with the
/// same message and task.
pub fn count_consecutive_errors(
    history: &[ErrorRecord],
    message: &str,
    task_id: Option<&str>,
) -> u32 {
    let preceding = history
        .iter()
        .rev()
        .take_while(|r| r.message == message && r.task_id.as_deref() == task_id)
        .count() as u32;
    1 + preceding
}

/// Record the failure that routed here and mark the run as errored.
///
/// The active task, unless already completed, is marked failed and its
/// masked failure text is hashed into the entropy history.
pub fn error_node(state: &GraphState) -> StateDelta {
    let source_node = state
        .pending_recovery_node
        .map(|n| n.as_str())
        .unwrap_or("unknown");

    let source = match &state.pending_error {
        Some(caught) => ErrorSource::Error {
            message: caught.message.clone(),
            stack: caught.stack_trace.clone(),
        },
        None => ErrorSource::Value(format!(
            "Node '{}' routed to error recovery.",
            source_node
        )),
    };

    // A task already verified stays completed; the failure belongs to
    // whatever runs next.
    let task_id = state
        .active_task()
        .filter(|t| t.status != TaskStatus::Completed)
        .map(|t| t.task_id.as_str());
    let masked = mask_sensitive_data(source.message());
    let count = count_consecutive_errors(&state.error_history, &masked, task_id);
    let record = build_error_record(&source, source_node, task_id, count);

    let mut delta = StateDelta::status(&state.project_config, ProjectStatus::Error);
    if let Some(id) = task_id {
        delta.tasks = Some(update_task(&state.tasks, id, |t| {
            t.status = TaskStatus::Failed
        }));
        delta.new_entropy = record_entropy(state, id, &masked).new_entropy;
    }
    delta.new_errors = vec![record];
    delta.pending_recovery_node = Some(None);
    delta.pending_error = Some(None);
    delta
}

/// Record a (possibly repeated) failing output for `task_id`.
///
/// The loop count grows while the output hash stays the same and restarts
/// at 1 when it changes.
pub fn record_entropy(state: &GraphState, task_id: &str, output: &str) -> StateDelta {
    let output_hash = format!("{:x}", Sha256::digest(output.as_bytes()));
    let loop_count = match state.entropy.iter().rev().find(|e| e.task_id == task_id) {
        Some(last) if last.output_hash == output_hash => last.loop_count + 1,
        _ => 1,
    };
    StateDelta {
        new_entropy: vec![EntropyRecord {
            output_hash,
            seen_at: Utc::now(),
            task_id: task_id.to_string(),
            loop_count,
        }],
        ..Default::default()
    }
}

pub fn increment_turn_budget(state: &GraphState) -> StateDelta {
    StateDelta {
        implementation_turns: Some(state.implementation_turns + 1),
        ..Default::default()
    }
}

pub fn reset_turn_budget() -> StateDelta {
    StateDelta {
        implementation_turns: Some(0),
        ..Default::default()
    }
}

fn pivot_delta(state: &GraphState) -> StateDelta {
    let mut delta = StateDelta::status(&state.project_config, ProjectStatus::StrategyPivot);
    delta.pending_recovery_node = Some(Some(NodeId::PivotAgent));
    delta
}

impl RobustnessLimits {
    pub fn route_after_error(&self, state: &GraphState) -> NodeId {
        match state.error_history.last() {
            Some(last) if last.consecutive_count >= self.consecutive_error_threshold => {
                NodeId::PivotAgent
            }
            _ => NodeId::Implement,
        }
    }

    /// `None` while turns remain, otherwise the pivot delta.
    pub fn check_turn_budget(&self, state: &GraphState) -> Option<StateDelta> {
        if state.implementation_turns < self.max_implementation_turns {
            None
        } else {
            Some(pivot_delta(state))
        }
    }

    pub fn detect_entropy(&self, state: &GraphState) -> bool {
        let Some(active) = state.active_task_id.as_deref() else {
            return false;
        };
        state
            .entropy
            .iter()
            .rev()
            .find(|e| e.task_id == active)
            .map(|e| e.loop_count >= self.entropy_loop_threshold)
            .unwrap_or(false)
    }

    /// Budget and loop checks for one pass through `implement`.
    pub fn implement_node(&self, state: &GraphState) -> StateDelta {
        if let Some(pivot) = self.check_turn_budget(state) {
            if self.detect_entropy(state) {
                flog_warn!(
                    "turn budget and entropy loop both breached for {}; pivoting on turn budget",
                    state.project_id()
                );
            }
            return pivot;
        }
        if self.detect_entropy(state) {
            return pivot_delta(state);
        }

        let mut delta = StateDelta::status(&state.project_config, ProjectStatus::Implementing);
        delta.implementation_turns = increment_turn_budget(state).implementation_turns;
        delta
    }
}

pub fn route_after_error(state: &GraphState) -> NodeId {
    RobustnessLimits::default().route_after_error(state)
}

pub fn check_turn_budget(state: &GraphState) -> Option<StateDelta> {
    RobustnessLimits::default().check_turn_budget(state)
}

pub fn detect_entropy(state: &GraphState) -> bool {
    RobustnessLimits::default().detect_entropy(state)
}

pub fn implement_node(state: &GraphState) -> StateDelta {
    RobustnessLimits::default().implement_node(state)
}

/// Force a strategy change and give the new strategy a fresh turn budget.
pub fn pivot_agent_node(state: &GraphState) -> StateDelta {
    let mut delta = StateDelta::status(&state.project_config, ProjectStatus::StrategyPivot);
    delta.implementation_turns = reset_turn_budget().implementation_turns;
    delta.pending_recovery_node = Some(None);
    delta
}

/// A task that may have been interrupted by an unclean shutdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleTaskState {
    pub task_id: String,
    pub name: String,
    pub epic_id: String,
    pub status: TaskStatus,
}

pub fn find_stale_or_dirty_states(state: &GraphState) -> Vec<StaleTaskState> {
    state
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .map(|t| StaleTaskState {
            task_id: t.task_id.clone(),
            name: t.name.clone(),
            epic_id: t.epic_id.clone(),
            status: t.status,
        })
        .collect()
}
