//! Error escalation integration tests.
//!
//! These tests verify that node failures are caught at the engine boundary,
//! recorded with masked text, retried, and escalated to a strategy pivot
//! once the same failure repeats.

use std::sync::Arc;

use flightdeck::orchestration::{GraphEngine, RobustnessLimits, RunOutcome};
use flightdeck::persistence::TaskRepository;
use flightdeck::workflow::{
    ErrorKind, HitlApprovalSignal, NodeId, ProjectStatus, TaskStatus, Transition,
};

use super::fixtures::{
    seed_tasks, two_task_state, two_task_state_with_rows, ScriptedHandler, TestDb,
};

async fn run_to_implementation(engine: &GraphEngine, project: &str) -> RunOutcome {
    run_state_to_implementation(engine, two_task_state(project)).await
}

async fn run_state_to_implementation(
    engine: &GraphEngine,
    state: flightdeck::GraphState,
) -> RunOutcome {
    let project = state.project_id().to_string();
    let project = project.as_str();
    engine.start(state).await.unwrap();
    engine
        .resume(project, HitlApprovalSignal::approve())
        .await
        .unwrap();
    engine
        .resume(project, HitlApprovalSignal::approve().by("lead"))
        .await
        .unwrap()
}

/// Test: A single failure is retried
/// Given implement fails once with a timeout
/// When the run passes the DAG gate
/// Then the failure is recorded as transient and the run still completes
#[tokio::test]
async fn test_single_failure_retries() {
    let t = TestDb::new();
    let handler = Arc::new(ScriptedHandler::new().failing(
        NodeId::Implement,
        1,
        "request timeout after 30s",
    ));
    let engine = GraphEngine::new(t.store()).with_handler(handler.clone());

    let outcome = run_to_implementation(&engine, "proj-retry").await;
    assert!(matches!(
        outcome,
        RunOutcome::Finished {
            status: ProjectStatus::Completed,
            ..
        }
    ));

    let state = t.store().latest("proj-retry").unwrap().unwrap().state().unwrap();
    assert_eq!(state.error_history.len(), 1);
    let record = &state.error_history[0];
    assert_eq!(record.source_node, "implement");
    assert_eq!(record.kind, ErrorKind::Transient);
    assert_eq!(record.consecutive_count, 1);
    assert!(state.pending_error.is_none());
    assert!(state.pending_recovery_node.is_none());
    assert_eq!(handler.calls_to(NodeId::Implement), 3);

    let routed: Vec<Transition> = t
        .store()
        .list("proj-retry")
        .unwrap()
        .iter()
        .filter(|cp| cp.metadata.node == NodeId::Implement)
        .map(|cp| cp.metadata.next)
        .collect();
    assert_eq!(routed[0], Transition::Next(NodeId::Error));
}

/// Test: Three identical failures pivot
/// Given implement fails with the same message every time
/// When the run passes the DAG gate
/// Then the third consecutive failure routes to pivot_agent and the run ends
#[tokio::test]
async fn test_repeated_failure_pivots() {
    let t = TestDb::new();
    let handler = Arc::new(ScriptedHandler::new().failing(
        NodeId::Implement,
        u32::MAX,
        "assertion failed: parser.is_ok()",
    ));
    let engine = GraphEngine::new(t.store()).with_handler(handler.clone());

    let outcome = run_to_implementation(&engine, "proj-pivot").await;
    assert!(matches!(
        outcome,
        RunOutcome::Finished {
            status: ProjectStatus::StrategyPivot,
            ..
        }
    ));

    let state = t.store().latest("proj-pivot").unwrap().unwrap().state().unwrap();
    let counts: Vec<u32> = state
        .error_history
        .iter()
        .map(|r| r.consecutive_count)
        .collect();
    assert_eq!(counts, vec![1, 2, 3]);
    assert!(state.error_history.iter().all(|r| r.kind == ErrorKind::Logic));
    assert_eq!(handler.calls_to(NodeId::Implement), 3);
    assert_eq!(state.implementation_turns, 0);

    let last = t.store().latest("proj-pivot").unwrap().unwrap();
    assert_eq!(last.metadata.node, NodeId::PivotAgent);
    assert_eq!(last.metadata.next, Transition::End);
}

/// Test: Secrets in failures are masked before they are stored
#[tokio::test]
async fn test_failure_text_is_masked() {
    let t = TestDb::new();
    let handler = Arc::new(ScriptedHandler::new().failing(
        NodeId::Implement,
        1,
        "deploy failed: password=hunter22",
    ));
    let engine = GraphEngine::new(t.store()).with_handler(handler);
    run_to_implementation(&engine, "proj-mask").await;

    for cp in t.store().list("proj-mask").unwrap() {
        assert!(!cp.payload.contains("hunter22"), "checkpoint {} leaked", cp.checkpoint_id);
    }
}

/// Test: Turn budget forces a pivot
/// Given a budget of one implementation turn
/// When two tasks need implementing
/// Then the second pass through implement pivots instead
#[tokio::test]
async fn test_turn_budget_pivots() {
    let t = TestDb::new();
    let engine = GraphEngine::new(t.store()).with_limits(RobustnessLimits {
        max_implementation_turns: 1,
        ..Default::default()
    });

    let outcome = run_to_implementation(&engine, "proj-budget").await;
    assert!(matches!(
        outcome,
        RunOutcome::Finished {
            status: ProjectStatus::StrategyPivot,
            ..
        }
    ));
    let state = t.store().latest("proj-budget").unwrap().unwrap().state().unwrap();
    assert!(state.error_history.is_empty());
    assert_eq!(state.tasks[0].status, TaskStatus::Completed);
    assert_eq!(state.tasks[1].status, TaskStatus::Pending);
}

/// Test: A failure after a verified task does not reopen it
/// Given implement succeeds once and then fails once
/// When the run passes the DAG gate
/// Then the verified task stays completed and the next task is picked
#[tokio::test]
async fn test_failure_after_verify_keeps_task_completed() {
    let t = TestDb::new();
    let handler = Arc::new(ScriptedHandler::new().failing_after(
        NodeId::Implement,
        1,
        1,
        "connection reset by peer",
    ));
    let engine = GraphEngine::new(t.store()).with_handler(handler.clone());

    let outcome = run_to_implementation(&engine, "proj-keep").await;
    assert!(matches!(
        outcome,
        RunOutcome::Finished {
            status: ProjectStatus::Completed,
            ..
        }
    ));
    assert_eq!(handler.calls_to(NodeId::Implement), 3);

    let checkpoints = t.store().list("proj-keep").unwrap();
    let mut completed = false;
    for cp in &checkpoints {
        let t1 = cp.state().unwrap().tasks[0].status;
        if t1 == TaskStatus::Completed {
            completed = true;
        } else if completed {
            panic!("t1 left completed at checkpoint {}", cp.checkpoint_id);
        }
    }

    let state = checkpoints.last().unwrap().state().unwrap();
    assert_eq!(state.error_history.len(), 1);
    assert_eq!(state.error_history[0].task_id, None);
}

/// Test: The same failing output loops into a pivot
/// Given verify keeps failing the same task with the same text
/// When consecutive counting alone would not escalate yet
/// Then the entropy loop pivots the run and each repeat is persisted
#[tokio::test]
async fn test_repeated_output_pivots_on_entropy() {
    let t = TestDb::new();
    let repo = t.repo();
    let (project_db_id, ids) = seed_tasks(&repo, "proj-loop", &["Schema", "Repository"]);
    let handler = Arc::new(ScriptedHandler::new().failing(
        NodeId::Verify,
        u32::MAX,
        "assertion failed: schema.len() == 3",
    ));
    let engine = GraphEngine::new(t.store())
        .with_handler(handler.clone())
        .with_repository(repo.clone(), project_db_id)
        .with_limits(RobustnessLimits {
            consecutive_error_threshold: 10,
            ..Default::default()
        });

    let outcome =
        run_state_to_implementation(&engine, two_task_state_with_rows("proj-loop", &ids)).await;
    assert!(matches!(
        outcome,
        RunOutcome::Finished {
            status: ProjectStatus::StrategyPivot,
            ..
        }
    ));
    assert_eq!(handler.calls_to(NodeId::Verify), 3);

    let state = t.store().latest("proj-loop").unwrap().unwrap().state().unwrap();
    let loops: Vec<u32> = state.entropy.iter().map(|e| e.loop_count).collect();
    assert_eq!(loops, vec![1, 2, 3]);
    assert!(state.error_history.iter().all(|r| r.consecutive_count < 10));

    let events = repo.get_entropy_events(ids[0]).unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.hash_chain == state.entropy[0].output_hash));
    let row = TaskRepository::new(t.db.clone()).get_task(ids[0]).unwrap().unwrap();
    assert_eq!(row.status, TaskStatus::Failed);
}
