//! Markdown audit reports rebuilt from the stored agent logs, decisions,
//! entropy events and task commits.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::flog_debug;
use crate::persistence::{AgentLog, Database, DecisionLog, StateRepository, TaskRepository};

pub const THOUGHT: &str = "THOUGHT";
pub const ACTION: &str = "ACTION";
pub const OBSERVATION: &str = "OBSERVATION";

/// Reads the business tables and renders what happened to a task or project.
pub struct AuditTrail {
    state: StateRepository,
    tasks: TaskRepository,
}

impl AuditTrail {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            state: StateRepository::new(db.clone()),
            tasks: TaskRepository::new(db),
        }
    }

    /// Report for one task row: its reasoning, tool calls, results, the
    /// decisions taken on its project, recorded failures and its commit.
    pub fn task_report(&self, task_id: i64) -> Result<String> {
        flog_debug!("AuditTrail::task_report id={}", task_id);
        let task = self.tasks.get_task(task_id)?.ok_or_else(|| Error::TaskNotFound {
            id: task_id.to_string(),
        })?;
        let logs = self.state.get_task_logs(task_id)?;
        let decisions = match self.state.project_of_task(task_id)? {
            Some(project_id) => self.state.get_decisions(project_id)?,
            None => Vec::new(),
        };
        let failures = self.state.get_entropy_events(task_id)?;

        let mut md = format!("# Audit Trail: Task {} ({})\n\n", task_id, task.title);
        md.push_str(&format!("Status: {}\n\n", task.status));

        log_section(&mut md, "Thoughts", &logs, THOUGHT, "_No thought logs found._", |v| {
            v.get("thought").map(display_value)
        });
        log_section(&mut md, "Actions", &logs, ACTION, "_No action logs found._", |v| {
            let tool = v.get("tool_name").and_then(Value::as_str)?;
            Some(match v.get("tool_input") {
                Some(input) => format!("{} {}", tool, input),
                None => tool.to_string(),
            })
        });
        log_section(
            &mut md,
            "Observations",
            &logs,
            OBSERVATION,
            "_No observations found._",
            |v| v.get("tool_result").map(|r| r.to_string()),
        );

        let other: Vec<&AgentLog> = logs
            .iter()
            .filter(|l| ![THOUGHT, ACTION, OBSERVATION].contains(&l.content_type.as_str()))
            .collect();
        if !other.is_empty() {
            md.push_str("## Other Events\n\n");
            for log in other {
                md.push_str(&format!(
                    "- {} ({}) {}\n",
                    log.content_type,
                    log.role,
                    log.timestamp.as_deref().unwrap_or("?")
                ));
            }
            md.push('\n');
        }

        decision_section(&mut md, &decisions);

        md.push_str("## Failures\n\n");
        if failures.is_empty() {
            md.push_str("_No failures recorded._\n\n");
        } else {
            for event in &failures {
                md.push_str(&format!(
                    "- {} {}\n",
                    event.hash_chain,
                    event.error_output.as_deref().unwrap_or("[no output]")
                ));
            }
            md.push('\n');
        }

        md.push_str("## Commits\n\n");
        match &task.git_commit_hash {
            Some(hash) => md.push_str(&format!("- Task commit: {}\n\n", hash)),
            None => md.push_str("_No commit recorded for this task._\n\n"),
        }
        Ok(md)
    }

    /// Summary for a project row: task statuses and every gate decision.
    pub fn project_report(&self, project_id: i64) -> Result<String> {
        let state = self
            .state
            .get_project_state(project_id)?
            .ok_or_else(|| Error::ProjectNotFound {
                id: project_id.to_string(),
            })?;
        let decisions = self.state.get_decisions(project_id)?;

        let mut md = format!(
            "# Audit Trail: Project {} ({})\n\nStatus: {}\n\n## Tasks\n\n",
            project_id, state.project.name, state.project.status
        );
        if state.tasks.is_empty() {
            md.push_str("_No tasks recorded._\n\n");
        } else {
            for task in &state.tasks {
                md.push_str(&format!(
                    "- {} {} [{}]{}\n",
                    task.id.unwrap_or_default(),
                    task.title,
                    task.status,
                    task.git_commit_hash
                        .as_deref()
                        .map(|h| format!(" {}", h))
                        .unwrap_or_default()
                ));
            }
            md.push('\n');
        }
        decision_section(&mut md, &decisions);
        Ok(md)
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render logs of one content type. Rows that are not JSON objects, or that
/// lack the expected field, are listed as malformed.
fn log_section<F>(md: &mut String, title: &str, logs: &[AgentLog], kind: &str, empty: &str, f: F)
where
    F: Fn(&Value) -> Option<String>,
{
    md.push_str(&format!("## {}\n\n", title));
    let rows: Vec<&AgentLog> = logs.iter().filter(|l| l.content_type == kind).collect();
    if rows.is_empty() {
        md.push_str(empty);
        md.push_str("\n\n");
        return;
    }
    for log in rows {
        let parsed = serde_json::from_str::<Value>(&log.content).ok();
        let text = parsed.as_ref().and_then(&f);
        match (parsed.as_ref(), text) {
            (Some(value), Some(text)) => {
                let turn = value
                    .get("turn_index")
                    .map(display_value)
                    .unwrap_or_else(|| "?".to_string());
                md.push_str(&format!("- [turn {}] ({}) {}\n", turn, log.role, text));
            }
            _ => md.push_str(&format!("- (malformed) {}\n", log.content)),
        }
    }
    md.push('\n');
}

fn decision_section(md: &mut String, decisions: &[DecisionLog]) {
    md.push_str("## Decisions\n\n");
    if decisions.is_empty() {
        md.push_str("_No decisions recorded._\n\n");
        return;
    }
    for d in decisions {
        md.push_str(&format!(
            "- {} {} at {}",
            d.gate,
            if d.approved { "approved" } else { "rejected" },
            d.decided_at
        ));
        if let Some(by) = &d.approved_by {
            md.push_str(&format!(" by {}", by));
        }
        md.push('\n');
        if let Some(feedback) = &d.feedback {
            md.push_str(&format!("  - Feedback: {}\n", feedback));
        }
    }
    md.push('\n');
}
