//! Audit write ahead of every tool invocation.

use std::future::Future;

use chrono::Utc;

use crate::error::Result;
use crate::flog_trace;
use crate::persistence::{AgentLog, StateRepository};

pub const PRE_TOOL_EXECUTION: &str = "PRE_TOOL_EXECUTION";

pub struct StateTransitionGuard {
    repo: StateRepository,
}

impl StateTransitionGuard {
    pub fn new(repo: StateRepository) -> Self {
        Self { repo }
    }

    /// Persist a `PRE_TOOL_EXECUTION` log row for `task_db_id`, then await `tool`.
    ///
    /// If the write fails the tool future is dropped without being polled.
    pub async fn run_with_guard<T, Fut>(&self, task_db_id: i64, tool: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let content = serde_json::json!({ "timestamp": Utc::now().to_rfc3339() }).to_string();
        self.repo.append_agent_log(&AgentLog::new(
            task_db_id,
            "system",
            PRE_TOOL_EXECUTION,
            &content,
        ))?;
        flog_trace!("guard: audit written for task {}", task_db_id);
        tool.await
    }
}
