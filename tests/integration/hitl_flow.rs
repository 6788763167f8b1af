//! Approval gate integration tests.
//!
//! These tests verify that a run halts at each gate, that decisions are
//! recorded in order and routed by the latest one, and that replaying a
//! signal never advances the run twice.

use std::sync::Arc;

use flightdeck::orchestration::{GraphEngine, RunOutcome};
use flightdeck::workflow::{
    GraphState, HitlApprovalSignal, HitlGate, NodeId, ProjectStatus, TaskStatus,
};
use flightdeck::{Error, Transition};

use super::fixtures::{two_task_state, ScriptedHandler, TestDb};

/// Test: Fresh run halts at design approval
/// Given a new project
/// When the run is started
/// Then it is interrupted at design_approval before any implementation
#[tokio::test]
async fn test_fresh_run_halts_at_design_gate() {
    let t = TestDb::new();
    let engine = GraphEngine::new(t.store());

    let outcome = engine.start(GraphState::new("proj-a", "alpha")).await.unwrap();
    assert!(outcome.is_interrupted());
    assert!(matches!(
        outcome,
        RunOutcome::Interrupted {
            gate: HitlGate::DesignApproval,
            ..
        }
    ));

    let latest = t.store().latest("proj-a").unwrap().unwrap();
    let state = latest.state().unwrap();
    assert_eq!(state.pending_approval_gate, Some(HitlGate::DesignApproval));
    assert_ne!(state.status, ProjectStatus::Implementing);
    assert_eq!(latest.metadata.node, NodeId::ApproveDesign);
    assert_eq!(
        latest.metadata.next,
        Transition::Suspended(HitlGate::DesignApproval)
    );
}

/// Test: Approving both gates reaches implementation
/// Given a run suspended at design_approval
/// When design and then the task DAG are approved
/// Then status is implementing with two decisions in gate order
#[tokio::test]
async fn test_approve_both_gates() {
    let t = TestDb::new();
    let repo = t.repo();
    let project_db_id = repo
        .upsert_project(&flightdeck::persistence::Project::new("proj-b"))
        .unwrap();
    let engine = GraphEngine::new(t.store()).with_repository(repo.clone(), project_db_id);

    engine.start(GraphState::new("proj-b", "beta")).await.unwrap();

    let outcome = engine
        .resume("proj-b", HitlApprovalSignal::approve().by("lead"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Interrupted {
            gate: HitlGate::DagApproval,
            ..
        }
    ));

    let outcome = engine
        .resume("proj-b", HitlApprovalSignal::approve().by("lead"))
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Finished { .. }));

    let state = t.store().latest("proj-b").unwrap().unwrap().state().unwrap();
    assert_eq!(state.status, ProjectStatus::Implementing);
    let gates: Vec<HitlGate> = state.hitl_decisions.iter().map(|d| d.gate).collect();
    assert_eq!(gates, vec![HitlGate::DesignApproval, HitlGate::DagApproval]);
    assert!(state.hitl_decisions.iter().all(|d| d.signal.approved));

    let logged = repo.get_decisions(project_db_id).unwrap();
    assert_eq!(logged.len(), 2);
    assert_eq!(logged[0].gate, "design_approval");
    assert_eq!(logged[1].gate, "dag_approval");
    assert_eq!(logged[1].approved_by.as_deref(), Some("lead"));
}

/// Test: Rejection loops back through design
/// Given a run suspended at design_approval
/// When design is rejected with feedback
/// Then the run suspends at design_approval again and keeps the feedback
#[tokio::test]
async fn test_reject_design_loops_back() {
    let t = TestDb::new();
    let engine = GraphEngine::new(t.store());
    engine.start(GraphState::new("proj-c", "gamma")).await.unwrap();

    let outcome = engine
        .resume("proj-c", HitlApprovalSignal::reject("Add a threat model"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Interrupted {
            gate: HitlGate::DesignApproval,
            ..
        }
    ));

    let store = t.store();
    let state = store.latest("proj-c").unwrap().unwrap().state().unwrap();
    assert_eq!(state.status, ProjectStatus::Specifying);
    let latest = state.latest_decision(HitlGate::DesignApproval).unwrap();
    assert!(!latest.signal.approved);
    assert_eq!(latest.signal.feedback.as_deref(), Some("Add a threat model"));

    let nodes: Vec<NodeId> = store
        .list("proj-c")
        .unwrap()
        .iter()
        .map(|cp| cp.metadata.node)
        .collect();
    assert_eq!(
        &nodes[nodes.len() - 3..],
        &[NodeId::ApproveDesign, NodeId::Design, NodeId::ApproveDesign]
    );
}

/// Test: Replayed signal is idempotent
/// Given a run that was resumed with a signal
/// When the same signal is delivered again
/// Then no checkpoint or decision is added
#[tokio::test]
async fn test_replayed_signal_is_ignored() {
    let t = TestDb::new();
    let engine = GraphEngine::new(t.store());
    engine.start(GraphState::new("proj-i", "idem")).await.unwrap();

    let signal = HitlApprovalSignal::approve().by("lead");
    let first = engine.resume("proj-i", signal.clone()).await.unwrap();
    let count = t.store().count("proj-i").unwrap();

    let second = engine.resume("proj-i", signal).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(t.store().count("proj-i").unwrap(), count);

    let state = t.store().latest("proj-i").unwrap().unwrap().state().unwrap();
    assert_eq!(state.hitl_decisions.len(), 1);
}

/// Test: Resuming a thread that is not waiting
/// Given a finished run and an unknown thread
/// When each is resumed
/// Then NotSuspended and NoCheckpoint are returned
#[tokio::test]
async fn test_resume_errors() {
    let t = TestDb::new();
    let engine = GraphEngine::new(t.store());

    let err = engine
        .resume("missing", HitlApprovalSignal::approve())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoCheckpoint { .. }));

    engine.start(GraphState::new("proj-n", "n")).await.unwrap();
    engine
        .resume("proj-n", HitlApprovalSignal::approve().by("a"))
        .await
        .unwrap();
    engine
        .resume("proj-n", HitlApprovalSignal::approve().by("b"))
        .await
        .unwrap();

    let err = engine
        .resume("proj-n", HitlApprovalSignal::approve().by("c"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotSuspended { ref thread_id } if thread_id == "proj-n"));
}

/// Test: Starting an existing thread is refused
#[tokio::test]
async fn test_start_twice_fails() {
    let t = TestDb::new();
    let engine = GraphEngine::new(t.store());
    engine.start(GraphState::new("proj-d", "d")).await.unwrap();
    let err = engine
        .start(GraphState::new("proj-d", "d"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

/// Test: Failures before approval never skip a gate
/// Given research and distill each fail once
/// When the run is started and design is approved
/// Then each failing node is retried and the run still halts at both gates
#[tokio::test]
async fn test_failure_before_approval_keeps_gates() {
    let t = TestDb::new();
    let handler = Arc::new(
        ScriptedHandler::new()
            .failing(NodeId::Research, 1, "request timeout")
            .failing(NodeId::Distill, 1, "rate limit exceeded"),
    );
    let engine = GraphEngine::new(t.store()).with_handler(handler.clone());

    let outcome = engine.start(two_task_state("proj-gated")).await.unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Interrupted {
            gate: HitlGate::DesignApproval,
            ..
        }
    ));
    assert_eq!(handler.calls_to(NodeId::Research), 2);

    let outcome = engine
        .resume("proj-gated", HitlApprovalSignal::approve())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Interrupted {
            gate: HitlGate::DagApproval,
            ..
        }
    ));
    assert_eq!(handler.calls_to(NodeId::Distill), 2);
    assert_eq!(handler.calls_to(NodeId::Implement), 0);

    let state = t.store().latest("proj-gated").unwrap().unwrap().state().unwrap();
    assert_eq!(state.error_history.len(), 2);
    assert_eq!(state.hitl_decisions.len(), 1);
    assert!(state.tasks.iter().all(|t| t.status == TaskStatus::Pending));
    assert!(t
        .store()
        .list("proj-gated")
        .unwrap()
        .iter()
        .all(|cp| cp.metadata.node != NodeId::Implement));
}
