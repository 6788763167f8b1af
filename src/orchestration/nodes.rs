//! The pipeline graph: node functions, routing and the pure step function.
//!
//! ```text
//! research -> design -> approve_design -> {distill | design}
//! distill -> approve_task_dag -> {implement | distill}
//! implement -> {verify | pivot_agent}
//! verify -> {pivot_agent | implement | end}
//! error -> {implement | pivot_agent}, or back before an unapproved gate
//! pivot_agent -> end
//! ```

use super::hitl;
use super::robustness::{self, RobustnessLimits};
use crate::error::Result;
use crate::flog_debug;
use crate::workflow::{
    update_task, GraphState, HitlApprovalSignal, NodeId, ProjectStatus, StateDelta, TaskGraph,
    TaskStatus, Transition,
};

pub fn research_node(state: &GraphState) -> StateDelta {
    StateDelta::status(&state.project_config, ProjectStatus::Researching)
}

pub fn design_node(state: &GraphState) -> StateDelta {
    StateDelta::status(&state.project_config, ProjectStatus::Specifying)
}

/// Move to planning. Fails when the task list does not form a DAG.
pub fn distill_node(state: &GraphState) -> Result<StateDelta> {
    TaskGraph::build(&state.tasks)?.topological_order()?;
    Ok(StateDelta::status(&state.project_config, ProjectStatus::Planning))
}

/// Budget and loop checks, then pick and start the next task.
pub fn implement_node(limits: &RobustnessLimits, state: &GraphState) -> Result<StateDelta> {
    let mut delta = limits.implement_node(state);
    if delta.pending_recovery_node == Some(Some(NodeId::PivotAgent)) {
        return Ok(delta);
    }

    let chosen = match state.active_task() {
        Some(task) if task.status != TaskStatus::Completed => Some(task.task_id.clone()),
        _ => TaskGraph::build(&state.tasks)?
            .next_ready()?
            .map(|t| t.task_id.clone()),
    };

    match &chosen {
        Some(id) => {
            flog_debug!("implement: task {} for {}", id, state.project_id());
            delta.tasks = Some(update_task(&state.tasks, id, |t| {
                t.status = TaskStatus::InProgress
            }));
        }
        None => flog_debug!("implement: no ready task for {}", state.project_id()),
    }
    delta.active_task_id = Some(chosen);
    Ok(delta)
}

/// Mark the active task completed; finish the run once every task is.
pub fn verify_node(state: &GraphState) -> StateDelta {
    let tasks = match state.active_task_id.as_deref() {
        Some(id) => update_task(&state.tasks, id, |t| t.status = TaskStatus::Completed),
        None => state.tasks.clone(),
    };

    let all_done = !tasks.is_empty() && tasks.iter().all(|t| t.status == TaskStatus::Completed);
    let mut delta = if all_done {
        StateDelta::status(&state.project_config, ProjectStatus::Completed)
    } else {
        StateDelta::default()
    };
    if state.active_task_id.is_some() {
        delta.tasks = Some(tasks);
    }
    delta
}

pub fn route_after_implement(state: &GraphState) -> NodeId {
    if state.pending_recovery_node == Some(NodeId::PivotAgent) {
        NodeId::PivotAgent
    } else {
        NodeId::Verify
    }
}

/// First match wins: pending pivot, security pause, failed active task,
/// remaining open tasks, end.
pub fn route_after_verify(state: &GraphState) -> Transition {
    if state.pending_recovery_node == Some(NodeId::PivotAgent) {
        return Transition::Next(NodeId::PivotAgent);
    }
    if state.status == ProjectStatus::SecurityPause {
        return Transition::End;
    }
    if state
        .active_task()
        .is_some_and(|t| t.status == TaskStatus::Failed)
    {
        return Transition::Next(NodeId::Implement);
    }
    if state.tasks.iter().any(|t| t.status.is_open()) {
        return Transition::Next(NodeId::Implement);
    }
    Transition::End
}

/// Run `node` against `state` and decide where the graph goes next.
///
/// `signal` is only consulted by gate nodes. Routing sees the state with
/// the returned delta already applied.
pub fn step_with(
    limits: &RobustnessLimits,
    state: &GraphState,
    node: NodeId,
    signal: Option<&HitlApprovalSignal>,
) -> Result<(StateDelta, Transition)> {
    let delta = match node {
        NodeId::Research => research_node(state),
        NodeId::Design => design_node(state),
        NodeId::ApproveDesign => hitl::approve_design_node(state, signal),
        NodeId::Distill => distill_node(state)?,
        NodeId::ApproveTaskDag => hitl::approve_task_dag_node(state, signal),
        NodeId::Implement => implement_node(limits, state)?,
        NodeId::Verify => verify_node(state),
        NodeId::Error => robustness::error_node(state),
        NodeId::PivotAgent => robustness::pivot_agent_node(state),
    };

    let mut next = state.clone();
    next.apply(delta.clone());

    let transition = if let (Some(gate), None) = (node.gate(), signal) {
        Transition::Suspended(gate)
    } else {
        match node {
            NodeId::Research => Transition::Next(NodeId::Design),
            NodeId::Design => Transition::Next(NodeId::ApproveDesign),
            NodeId::ApproveDesign => Transition::Next(hitl::route_after_approve_design(&next)),
            NodeId::Distill => Transition::Next(NodeId::ApproveTaskDag),
            NodeId::ApproveTaskDag => Transition::Next(hitl::route_after_approve_task_dag(&next)),
            NodeId::Implement => Transition::Next(route_after_implement(&next)),
            NodeId::Verify => route_after_verify(&next),
            NodeId::Error => match limits.route_after_error(&next) {
                NodeId::Implement => Transition::Next(hitl::gated_retry_target(
                    &next,
                    state.pending_recovery_node,
                )),
                target => Transition::Next(target),
            },
            NodeId::PivotAgent => Transition::End,
        }
    };

    Ok((delta, transition))
}

/// [`step_with`] under the default limits.
pub fn step(
    state: &GraphState,
    node: NodeId,
    signal: Option<&HitlApprovalSignal>,
) -> Result<(StateDelta, Transition)> {
    step_with(&RobustnessLimits::default(), state, node, signal)
}
