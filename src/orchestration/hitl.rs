//! Human approval gates.
//!
//! A gate node reached without a signal suspends the run. Resuming appends
//! one `HitlDecisionRecord` and clears the pending gate; routing afterwards
//! only ever looks at the most recent decision for that gate, so an old
//! approval cannot outlive a newer rejection.

use chrono::Utc;

use crate::workflow::{
    GraphState, HitlApprovalSignal, HitlDecisionRecord, HitlGate, NodeId, ProjectStatus,
    StateDelta,
};

/// Delta for a gate node reached without a signal.
pub fn suspend(gate: HitlGate) -> StateDelta {
    StateDelta {
        pending_approval_gate: Some(Some(gate)),
        ..Default::default()
    }
}

/// Record `signal` as a decision for `gate`.
pub fn decide(state: &GraphState, gate: HitlGate, signal: &HitlApprovalSignal) -> StateDelta {
    let status = match (gate, signal.approved) {
        (HitlGate::DesignApproval, true) => ProjectStatus::Planning,
        (HitlGate::DesignApproval, false) => ProjectStatus::Specifying,
        (HitlGate::DagApproval, true) => ProjectStatus::Implementing,
        (HitlGate::DagApproval, false) => ProjectStatus::Planning,
    };
    let mut delta = StateDelta::status(&state.project_config, status);
    delta.new_hitl_decisions = vec![HitlDecisionRecord {
        gate,
        signal: signal.clone(),
        decided_at: Utc::now(),
    }];
    delta.pending_approval_gate = Some(None);
    delta
}

pub fn approve_design_node(state: &GraphState, signal: Option<&HitlApprovalSignal>) -> StateDelta {
    match signal {
        Some(signal) => decide(state, HitlGate::DesignApproval, signal),
        None => suspend(HitlGate::DesignApproval),
    }
}

pub fn approve_task_dag_node(
    state: &GraphState,
    signal: Option<&HitlApprovalSignal>,
) -> StateDelta {
    match signal {
        Some(signal) => decide(state, HitlGate::DagApproval, signal),
        None => suspend(HitlGate::DagApproval),
    }
}

fn latest_approved(state: &GraphState, gate: HitlGate) -> bool {
    state
        .latest_decision(gate)
        .map(|d| d.signal.approved)
        .unwrap_or(false)
}

pub fn route_after_approve_design(state: &GraphState) -> NodeId {
    if latest_approved(state, HitlGate::DesignApproval) {
        NodeId::Distill
    } else {
        NodeId::Design
    }
}

pub fn route_after_approve_task_dag(state: &GraphState) -> NodeId {
    if latest_approved(state, HitlGate::DagApproval) {
        NodeId::Implement
    } else {
        NodeId::Distill
    }
}

/// Where a failed node may be retried without passing an unapproved gate.
///
/// `implement` needs the latest decision on both gates to be an approval.
/// Without design approval the retry goes back to the failing research or
/// design node (design otherwise); without DAG approval it goes to distill.
pub fn gated_retry_target(state: &GraphState, failed: Option<NodeId>) -> NodeId {
    if !latest_approved(state, HitlGate::DesignApproval) {
        match failed {
            Some(NodeId::Research) => NodeId::Research,
            _ => NodeId::Design,
        }
    } else if !latest_approved(state, HitlGate::DagApproval) {
        NodeId::Distill
    } else {
        NodeId::Implement
    }
}

/// Whether `signal` was already recorded as a decision on this thread.
pub fn is_replayed(state: &GraphState, signal: &HitlApprovalSignal) -> bool {
    state.hitl_decisions.iter().any(|d| d.signal == *signal)
}
