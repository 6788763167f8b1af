//! The driver loop.
//!
//! One node runs per step. After every step the resulting `GraphState` is
//! written as a checkpoint together with the transition that follows it, so a
//! thread can always be continued from its latest checkpoint. The loop stops
//! when a gate suspends or the graph ends.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::hitl;
use super::nodes;
use super::robustness::{mask_sensitive_data, ErrorSource, RobustnessLimits};
use super::task_git::{task_git_node, IntegrityChecker, SnapshotManager};
use crate::checkpoint::{Checkpoint, CheckpointMetadata, SqliteCheckpointStore};
use crate::error::{Error, Result};
use crate::git::{GitIntegrityChecker, GitSnapshotManager};
use crate::persistence::{EntropyEvent, StateRepository, TaskRepository};
use crate::workflow::{
    CaughtError, GraphState, HitlApprovalSignal, HitlGate, NodeId, ProjectStatus, Transition,
};
use crate::{flog, flog_debug, flog_trace, flog_warn};

/// Agent work performed when a node runs.
///
/// Called before the node's own state update for every work node
/// (`research`, `design`, `distill`, `implement`, `verify`). An `Err` is
/// caught by the engine and routes the thread to `error`.
pub trait NodeHandler: Send + Sync {
    fn run<'a>(&'a self, node: NodeId, state: &'a GraphState) -> BoxFuture<'a, Result<()>>;
}

/// Handler that does nothing; the graph advances on state alone.
pub struct NoopHandler;

impl NodeHandler for NoopHandler {
    fn run<'a>(&'a self, _node: NodeId, _state: &'a GraphState) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

fn runs_handler(node: NodeId) -> bool {
    matches!(
        node,
        NodeId::Research | NodeId::Design | NodeId::Distill | NodeId::Implement | NodeId::Verify
    )
}

/// Where a call into the engine left the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Waiting at `gate`; resume with an approval signal.
    Interrupted { gate: HitlGate, checkpoint_id: i64 },
    /// The graph reached its end.
    Finished {
        status: ProjectStatus,
        checkpoint_id: i64,
    },
    /// Stopped between steps (e.g. a crash); continue with
    /// [`GraphEngine::resume_from_checkpoint`].
    Incomplete { next: NodeId, checkpoint_id: i64 },
}

impl RunOutcome {
    pub fn checkpoint_id(&self) -> i64 {
        match self {
            RunOutcome::Interrupted { checkpoint_id, .. }
            | RunOutcome::Finished { checkpoint_id, .. }
            | RunOutcome::Incomplete { checkpoint_id, .. } => *checkpoint_id,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunOutcome::Interrupted { .. })
    }

    fn of(checkpoint: &Checkpoint, state: &GraphState) -> Self {
        let checkpoint_id = checkpoint.checkpoint_id;
        match checkpoint.metadata.next {
            Transition::Suspended(gate) => RunOutcome::Interrupted {
                gate,
                checkpoint_id,
            },
            Transition::End => RunOutcome::Finished {
                status: state.status,
                checkpoint_id,
            },
            Transition::Next(next) => RunOutcome::Incomplete {
                next,
                checkpoint_id,
            },
        }
    }
}

/// Snapshot and integrity collaborators run by `verify`.
pub struct GitIntegration<S, C> {
    snapshot: S,
    checker: Option<C>,
    tasks: Option<TaskRepository>,
}

impl<S, C> GitIntegration<S, C> {
    pub fn new(snapshot: S, checker: Option<C>) -> Self {
        Self {
            snapshot,
            checker,
            tasks: None,
        }
    }

    /// Persist commit hashes for tasks that carry a `db_id`.
    pub fn with_task_repository(mut self, tasks: TaskRepository) -> Self {
        self.tasks = Some(tasks);
        self
    }
}

pub struct GraphEngine<S = GitSnapshotManager, C = GitIntegrityChecker> {
    store: SqliteCheckpointStore,
    handler: Arc<dyn NodeHandler>,
    limits: RobustnessLimits,
    git: Option<GitIntegration<S, C>>,
    repository: Option<(StateRepository, i64)>,
}

impl GraphEngine {
    pub fn new(store: SqliteCheckpointStore) -> Self {
        Self {
            store,
            handler: Arc::new(NoopHandler),
            limits: RobustnessLimits::default(),
            git: None,
            repository: None,
        }
    }
}

impl<S, C> GraphEngine<S, C> {
    pub fn with_handler(mut self, handler: Arc<dyn NodeHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_limits(mut self, limits: RobustnessLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Mirror each step into the business tables of `project_db_id`: gate
    /// decisions, status changes of tasks that carry a `db_id`, and their
    /// entropy events.
    pub fn with_repository(mut self, repository: StateRepository, project_db_id: i64) -> Self {
        self.repository = Some((repository, project_db_id));
        self
    }

    pub fn with_git<S2, C2>(self, git: GitIntegration<S2, C2>) -> GraphEngine<S2, C2> {
        GraphEngine {
            store: self.store,
            handler: self.handler,
            limits: self.limits,
            git: Some(git),
            repository: self.repository,
        }
    }

    pub fn store(&self) -> &SqliteCheckpointStore {
        &self.store
    }

    pub fn limits(&self) -> &RobustnessLimits {
        &self.limits
    }
}

impl<S: SnapshotManager, C: IntegrityChecker> GraphEngine<S, C> {
    /// Start a new thread at `research` and run until it suspends or ends.
    pub async fn start(&self, state: GraphState) -> Result<RunOutcome> {
        let thread_id = state.project_id().to_string();
        if self.store.count(&thread_id)? > 0 {
            return Err(Error::Validation(format!(
                "Thread {} already has checkpoints; resume it instead",
                thread_id
            )));
        }
        flog!("starting thread {}", thread_id);
        self.drive(state, NodeId::Research, None, 0).await
    }

    /// Resume a thread suspended at a gate.
    ///
    /// A signal equal to one already recorded on the thread is a replay and
    /// returns the thread's current outcome without running anything.
    pub async fn resume(&self, thread_id: &str, signal: HitlApprovalSignal) -> Result<RunOutcome> {
        let checkpoint = self.latest(thread_id)?;
        let state = checkpoint.state()?;

        if hitl::is_replayed(&state, &signal) {
            flog_debug!("resume {}: signal already recorded, ignoring", thread_id);
            return Ok(RunOutcome::of(&checkpoint, &state));
        }

        let Transition::Suspended(gate) = checkpoint.metadata.next else {
            return Err(Error::NotSuspended {
                thread_id: thread_id.to_string(),
            });
        };

        flog!(
            "resume {} at {}: approved={}",
            thread_id,
            gate,
            signal.approved
        );
        self.drive(state, gate.node(), Some(signal), checkpoint.metadata.step)
            .await
    }

    /// Continue a thread from its latest checkpoint.
    ///
    /// Only the transition recorded in the checkpoint is followed; steps
    /// already checkpointed are never run again.
    pub async fn resume_from_checkpoint(&self, thread_id: &str) -> Result<RunOutcome> {
        let checkpoint = self.latest(thread_id)?;
        let state = checkpoint.state()?;
        match checkpoint.metadata.next {
            Transition::Next(node) => {
                flog!(
                    "recovering {} from checkpoint {} at {}",
                    thread_id,
                    checkpoint.checkpoint_id,
                    node
                );
                self.drive(state, node, None, checkpoint.metadata.step).await
            }
            _ => Ok(RunOutcome::of(&checkpoint, &state)),
        }
    }

    fn latest(&self, thread_id: &str) -> Result<Checkpoint> {
        self.store
            .latest(thread_id)?
            .ok_or_else(|| Error::NoCheckpoint {
                thread_id: thread_id.to_string(),
            })
    }

    async fn drive(
        &self,
        mut state: GraphState,
        mut node: NodeId,
        mut signal: Option<HitlApprovalSignal>,
        mut step: u64,
    ) -> Result<RunOutcome> {
        let thread_id = state.project_id().to_string();
        loop {
            step += 1;
            let signal_for_step = signal.take();
            let (next_state, transition) =
                match self.execute(&state, node, signal_for_step.as_ref()).await {
                    Ok(result) => result,
                    Err(err) => (caught(&state, node, &err), Transition::Next(NodeId::Error)),
                };

            let checkpoint = self.commit(&thread_id, &state, &next_state, step, node, transition)?;
            flog_trace!(
                "{} step {}: {} {} (status={})",
                thread_id,
                step,
                node,
                transition,
                next_state.status
            );
            state = next_state;

            match transition {
                Transition::Next(next) => node = next,
                Transition::Suspended(gate) => {
                    flog!("{} suspended at {}", thread_id, gate);
                    return Ok(RunOutcome::Interrupted {
                        gate,
                        checkpoint_id: checkpoint.checkpoint_id,
                    });
                }
                Transition::End => {
                    flog!("{} finished with status {}", thread_id, state.status);
                    return Ok(RunOutcome::Finished {
                        status: state.status,
                        checkpoint_id: checkpoint.checkpoint_id,
                    });
                }
            }
        }
    }

    async fn execute(
        &self,
        state: &GraphState,
        node: NodeId,
        signal: Option<&HitlApprovalSignal>,
    ) -> Result<(GraphState, Transition)> {
        if runs_handler(node) {
            self.handler.run(node, state).await?;
        }

        let (delta, mut transition) = nodes::step_with(&self.limits, state, node, signal)?;
        let mut next = state.clone();
        next.apply(delta);

        if node == NodeId::Verify {
            if let Some(git) = &self.git {
                let db_id = next.active_task().and_then(|t| t.db_id);
                let git_delta = task_git_node(
                    &next,
                    &git.snapshot,
                    git.checker.as_ref(),
                    git.tasks.as_ref(),
                    db_id,
                )
                .await?;
                if !git_delta.is_empty() {
                    next.apply(git_delta);
                    transition = nodes::route_after_verify(&next);
                }
            }
        }

        Ok((next, transition))
    }

    /// Write the checkpoint and the rows mirroring this step atomically.
    fn commit(
        &self,
        thread_id: &str,
        before: &GraphState,
        after: &GraphState,
        step: u64,
        node: NodeId,
        next: Transition,
    ) -> Result<Checkpoint> {
        let metadata = CheckpointMetadata { step, node, next };

        self.store.database().transaction(|| {
            if let Some((repository, project_db_id)) = &self.repository {
                mirror_step(repository, *project_db_id, before, after)?;
            }
            self.store.put(thread_id, after, metadata)
        })
    }
}

fn mirror_step(
    repository: &StateRepository,
    project_db_id: i64,
    before: &GraphState,
    after: &GraphState,
) -> Result<()> {
    for decision in after.hitl_decisions.iter().skip(before.hitl_decisions.len()) {
        repository.record_decision(project_db_id, decision)?;
    }

    for task in &after.tasks {
        let Some(db_id) = task.db_id else { continue };
        let previous = before
            .tasks
            .iter()
            .find(|t| t.task_id == task.task_id)
            .map(|t| t.status);
        if previous != Some(task.status) {
            repository.update_task_status(db_id, task.status)?;
        }
    }

    let last_error = after.error_history.last().map(|e| e.message.clone());
    for record in after.entropy.iter().skip(before.entropy.len()) {
        let Some(db_id) = after.task(&record.task_id).and_then(|t| t.db_id) else {
            continue;
        };
        repository.record_entropy_event(&EntropyEvent {
            id: None,
            task_id: db_id,
            hash_chain: record.output_hash.clone(),
            error_output: last_error.clone(),
            timestamp: None,
        })?;
    }
    Ok(())
}

/// State after `node` failed with `err`: the failure is parked for the
/// error node and nothing else changes.
fn caught(state: &GraphState, node: NodeId, err: &Error) -> GraphState {
    let source = ErrorSource::from(err);
    let message = mask_sensitive_data(source.message());
    flog_warn!("{}: node {} failed: {}", state.project_id(), node, message);

    let stack_trace = match &source {
        ErrorSource::Error { stack, .. } => mask_sensitive_data(stack),
        ErrorSource::Value(_) => String::new(),
    };
    let mut next = state.clone();
    next.pending_recovery_node = Some(node);
    next.pending_error = Some(CaughtError {
        message,
        stack_trace,
    });
    next
}
