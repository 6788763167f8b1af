//! Crash recovery integration tests.
//!
//! These tests verify that checkpoints survive closing and reopening the
//! backing file unchanged, that interrupted runs continue from their last
//! checkpoint without replaying work, and that threads sharing one file
//! never see each other's rows.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use flightdeck::checkpoint::CheckpointMetadata;
use flightdeck::orchestration::{hitl, GraphEngine, NodeHandler, RunOutcome};
use flightdeck::persistence::{open_database, AgentLog, StateRepository, TaskRepository};
use flightdeck::recovery::RecoveryManager;
use flightdeck::workflow::{
    GraphState, HitlApprovalSignal, HitlGate, NodeId, ProjectStatus, TaskStatus, Transition,
};
use flightdeck::Result;

use super::fixtures::{
    seed_tasks, two_task_state, two_task_state_with_rows, ScriptedHandler, TestDb,
};

const CHILD_DB: &str = "FLIGHTDECK_CHILD_DB";
const CHILD_IDS: &str = "FLIGHTDECK_CHILD_IDS";
const CHILD_READY: &str = "FLIGHTDECK_CHILD_READY";

/// Test: Checkpoints survive a reopen byte for byte
/// Given a project with N committed checkpoints
/// When the backing store is closed and reopened
/// Then the count, latest id and payload are unchanged
#[tokio::test]
async fn test_reopen_preserves_checkpoints() {
    let t = TestDb::new();
    let engine = GraphEngine::new(t.store());
    engine.start(two_task_state("proj-e")).await.unwrap();
    engine
        .resume("proj-e", HitlApprovalSignal::approve())
        .await
        .unwrap();

    let manager = RecoveryManager::new(t.db.clone());
    let count = manager.get_checkpoint_count("proj-e").unwrap();
    let latest = manager.get_latest_checkpoint("proj-e").unwrap().unwrap();
    assert!(count >= 5);
    drop(manager);
    drop(engine);

    let t = t.reopen();
    let manager = RecoveryManager::new(t.db.clone());
    assert!(manager.has_checkpoint("proj-e").unwrap());
    assert_eq!(manager.get_checkpoint_count("proj-e").unwrap(), count);
    let reopened = manager.get_latest_checkpoint("proj-e").unwrap().unwrap();
    assert_eq!(reopened.checkpoint_id, latest.checkpoint_id);
    assert_eq!(reopened.payload, latest.payload);
    assert_eq!(reopened.metadata, latest.metadata);
    assert!(reopened.is_suspended());
}

/// Test: Interrupted run continues from its last checkpoint
/// Given a thread whose last checkpoint points at implement
/// When the store is reopened and the run is recovered
/// Then it finishes without re-running any checkpointed node
#[tokio::test]
async fn test_resume_from_checkpoint_after_crash() {
    let t = TestDb::new();
    let engine = GraphEngine::new(t.store());
    engine.start(two_task_state("proj-crash")).await.unwrap();
    engine
        .resume("proj-crash", HitlApprovalSignal::approve())
        .await
        .unwrap();

    // The DAG gate was decided but the process died before implement ran.
    let gate = t.store().latest("proj-crash").unwrap().unwrap();
    let mut state = gate.state().unwrap();
    state.apply(hitl::decide(
        &state,
        HitlGate::DagApproval,
        &HitlApprovalSignal::approve(),
    ));
    let crashed = t
        .store()
        .put(
            "proj-crash",
            &state,
            CheckpointMetadata {
                step: gate.metadata.step + 1,
                node: NodeId::ApproveTaskDag,
                next: Transition::Next(NodeId::Implement),
            },
        )
        .unwrap();
    drop(engine);

    let t = t.reopen();
    let handle = RecoveryManager::new(t.db.clone())
        .recover_project("proj-crash")
        .unwrap()
        .unwrap();
    assert_eq!(handle.checkpoint_id, crashed.checkpoint_id);

    let handler = std::sync::Arc::new(ScriptedHandler::new());
    let engine = GraphEngine::new(t.store()).with_handler(handler.clone());
    let outcome = engine.resume_from_checkpoint("proj-crash").await.unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Finished {
            status: ProjectStatus::Completed,
            ..
        }
    ));
    assert_eq!(handler.calls_to(NodeId::Research), 0);
    assert_eq!(handler.calls_to(NodeId::Distill), 0);
    assert_eq!(handler.calls_to(NodeId::Implement), 2);

    let checkpoints = t.store().list("proj-crash").unwrap();
    let after: Vec<&_> = checkpoints
        .iter()
        .filter(|cp| cp.checkpoint_id > crashed.checkpoint_id)
        .collect();
    assert_eq!(after[0].metadata.node, NodeId::Implement);
    assert_eq!(after[0].metadata.step, crashed.metadata.step + 1);
    assert_eq!(after[0].parent_checkpoint_id, Some(crashed.checkpoint_id));
}

/// Test: Recovering a suspended thread does not advance it
#[tokio::test]
async fn test_resume_from_checkpoint_at_gate_is_noop() {
    let t = TestDb::new();
    let engine = GraphEngine::new(t.store());
    engine.start(GraphState::new("proj-wait", "wait")).await.unwrap();
    let count = t.store().count("proj-wait").unwrap();

    let outcome = engine.resume_from_checkpoint("proj-wait").await.unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Interrupted {
            gate: HitlGate::DesignApproval,
            ..
        }
    ));
    assert_eq!(t.store().count("proj-wait").unwrap(), count);
}

/// Test: In-progress task rows are marked resumed
/// Given task rows left in_progress by a crash
/// When the project is reconciled with its numeric id
/// Then exactly those rows become resumed and stale state tasks are reported
#[tokio::test]
async fn test_reconcile_marks_tasks_resumed() {
    let t = TestDb::new();
    let repo = StateRepository::new(t.db.clone());
    let (project_db_id, ids) = seed_tasks(&repo, "proj-r", &["Parser", "Emitter", "Docs"]);
    repo.update_task_status(ids[0], TaskStatus::InProgress).unwrap();
    repo.update_task_status(ids[2], TaskStatus::Completed).unwrap();

    let mut state = two_task_state("proj-r");
    state.tasks[0].status = TaskStatus::InProgress;
    state.active_task_id = Some("t1".to_string());
    t.store()
        .put(
            "proj-r",
            &state,
            CheckpointMetadata {
                step: 7,
                node: NodeId::Implement,
                next: Transition::Next(NodeId::Verify),
            },
        )
        .unwrap();

    let t = t.reopen();
    let report = RecoveryManager::new(t.db.clone())
        .reconcile("proj-r", Some(project_db_id))
        .unwrap();
    assert_eq!(report.resumed_tasks, 1);
    assert_eq!(report.stale_tasks.len(), 1);
    assert_eq!(report.stale_tasks[0].task_id, "t1");

    let tasks = TaskRepository::new(t.db.clone());
    let statuses: Vec<TaskStatus> = ids
        .iter()
        .map(|id| tasks.get_task(*id).unwrap().unwrap().status)
        .collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Resumed, TaskStatus::Pending, TaskStatus::Completed]
    );
}

/// Test: Threads sharing one file are isolated
/// Given two projects checkpointing into the same database
/// When one advances and the other is deleted
/// Then each sees only its own checkpoints
#[tokio::test]
async fn test_thread_isolation() {
    let t = TestDb::new();
    let engine = GraphEngine::new(t.store());
    engine.start(GraphState::new("proj-x", "x")).await.unwrap();
    engine.start(GraphState::new("proj-y", "y")).await.unwrap();
    let y_count = t.store().count("proj-y").unwrap();

    engine
        .resume("proj-x", HitlApprovalSignal::reject("rework"))
        .await
        .unwrap();
    assert!(t.store().count("proj-x").unwrap() > y_count);
    assert_eq!(t.store().count("proj-y").unwrap(), y_count);

    let x_latest = t.store().latest("proj-x").unwrap().unwrap();
    let y_latest = t.store().latest("proj-y").unwrap().unwrap();
    assert_eq!(x_latest.state().unwrap().project_id(), "proj-x");
    assert_eq!(y_latest.state().unwrap().project_id(), "proj-y");
    assert!(y_latest.state().unwrap().hitl_decisions.is_empty());

    t.store().delete_thread("proj-y").unwrap();
    let manager = RecoveryManager::new(t.db.clone());
    assert!(!manager.has_checkpoint("proj-y").unwrap());
    assert_eq!(
        manager.get_latest_checkpoint("proj-x").unwrap().unwrap(),
        x_latest
    );
}

/// Test: Task rows follow the in-memory task state
/// Given seeded task rows referenced by the run's tasks
/// When both gates are approved and the run finishes
/// Then every row ends completed, like its task record
#[tokio::test]
async fn test_task_rows_follow_state() {
    let t = TestDb::new();
    let repo = t.repo();
    let (project_db_id, ids) = seed_tasks(&repo, "proj-rows", &["Schema", "Repository"]);
    let engine = GraphEngine::new(t.store()).with_repository(repo, project_db_id);

    engine
        .start(two_task_state_with_rows("proj-rows", &ids))
        .await
        .unwrap();
    engine
        .resume("proj-rows", HitlApprovalSignal::approve())
        .await
        .unwrap();
    let outcome = engine
        .resume("proj-rows", HitlApprovalSignal::approve().by("lead"))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Finished {
            status: ProjectStatus::Completed,
            ..
        }
    ));

    let tasks = TaskRepository::new(t.db.clone());
    for id in &ids {
        assert_eq!(
            tasks.get_task(*id).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }
}

/// Blocks forever inside an open transaction once `verify` is reached.
struct HangInVerify {
    repo: StateRepository,
    task_db_id: i64,
}

impl NodeHandler for HangInVerify {
    fn run<'a>(&'a self, node: NodeId, _state: &'a GraphState) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if node == NodeId::Verify {
                self.repo.transaction(|| -> Result<()> {
                    self.repo.append_agent_log(&AgentLog::new(
                        self.task_db_id,
                        "developer",
                        "ACTION",
                        "half-written change",
                    ))?;
                    println!("{}", CHILD_READY);
                    std::io::stdout().flush()?;
                    loop {
                        std::thread::sleep(Duration::from_secs(60));
                    }
                })?;
            }
            Ok(())
        })
    }
}

/// Child side of [`test_killed_process_recovers`]; does nothing unless
/// launched by it.
#[tokio::test]
#[ignore]
async fn crash_child_runs_until_killed() {
    let Ok(path) = std::env::var(CHILD_DB) else {
        return;
    };
    let ids: Vec<i64> = std::env::var(CHILD_IDS)
        .unwrap()
        .split(',')
        .map(|id| id.parse().unwrap())
        .collect();
    let db = Arc::new(open_database(&PathBuf::from(path)).unwrap());
    let repo = StateRepository::new(db.clone());
    let engine = GraphEngine::new(flightdeck::SqliteCheckpointStore::new(db))
        .with_handler(Arc::new(HangInVerify {
            repo: repo.clone(),
            task_db_id: ids[1],
        }))
        .with_repository(repo, ids[0]);

    engine
        .start(two_task_state_with_rows("proj-kill", &ids[1..]))
        .await
        .unwrap();
    engine
        .resume("proj-kill", HitlApprovalSignal::approve())
        .await
        .unwrap();
    engine
        .resume("proj-kill", HitlApprovalSignal::approve())
        .await
        .unwrap();
}

/// Test: A killed process loses nothing it committed
/// Given a child process killed with SIGKILL inside verify's open transaction
/// When the database is reopened and the project reconciled
/// Then the uncommitted row is gone, the in-progress row is resumed and the
/// run finishes from its last checkpoint
#[cfg(unix)]
#[tokio::test]
async fn test_killed_process_recovers() {
    let t = TestDb::new();
    let repo = t.repo();
    let (project_db_id, ids) = seed_tasks(&repo, "proj-kill", &["Schema", "Repository"]);
    let child_ids = [project_db_id, ids[0], ids[1]]
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let mut child = Command::new(std::env::current_exe().unwrap())
        .args([
            "crash_recovery::crash_child_runs_until_killed",
            "--exact",
            "--ignored",
            "--nocapture",
        ])
        .env(CHILD_DB, &t.path)
        .env(CHILD_IDS, child_ids)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let stdout = child.stdout.take().unwrap();
    let ready = BufReader::new(stdout)
        .lines()
        .map_while(|line| line.ok())
        .any(|line| line.contains(CHILD_READY));
    assert!(ready, "child exited before reaching verify");
    child.kill().unwrap();
    child.wait().unwrap();

    let t = t.reopen();
    let latest = t.store().latest("proj-kill").unwrap().unwrap();
    assert_eq!(latest.metadata.node, NodeId::Implement);
    assert_eq!(latest.metadata.next, Transition::Next(NodeId::Verify));
    assert!(t.repo().get_task_logs(ids[0]).unwrap().is_empty());

    let tasks = TaskRepository::new(t.db.clone());
    assert_eq!(
        tasks.get_task(ids[0]).unwrap().unwrap().status,
        TaskStatus::InProgress
    );

    let report = RecoveryManager::new(t.db.clone())
        .reconcile("proj-kill", Some(project_db_id))
        .unwrap();
    assert_eq!(report.resumed_tasks, 1);
    assert_eq!(report.stale_tasks.len(), 1);
    assert_eq!(
        tasks.get_task(ids[0]).unwrap().unwrap().status,
        TaskStatus::Resumed
    );

    let engine = GraphEngine::new(t.store()).with_repository(t.repo(), project_db_id);
    let outcome = engine.resume_from_checkpoint("proj-kill").await.unwrap();
    assert!(matches!(
        outcome,
        RunOutcome::Finished {
            status: ProjectStatus::Completed,
            ..
        }
    ));
    for id in &ids {
        assert_eq!(
            tasks.get_task(*id).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }
}
