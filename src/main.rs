use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use flightdeck::audit::AuditTrail;
use flightdeck::config::Config;
use flightdeck::git::{GitIntegrityChecker, GitSnapshotManager};
use flightdeck::orchestration::{GitIntegration, GraphEngine, RunOutcome};
use flightdeck::persistence::{open_database, Database, Project, StateRepository, TaskRepository};
use flightdeck::{
    flog, Error, GraphState, HitlApprovalSignal, ProjectStatus, RecoveryManager, Result,
    SqliteCheckpointStore,
};

/// Flightdeck - durable, resumable multi-agent pipeline runner
#[derive(Parser, Debug)]
#[command(name = "flightdeck")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FLIGHTDECK_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.flightdeck/flightdeck.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a fresh run and drive it to the first approval gate
    Run {
        /// Project id (also the checkpoint thread id)
        project: String,

        /// Human-readable project name
        #[arg(long)]
        name: Option<String>,
    },

    /// Show the latest checkpoint of a project
    Status { project: String },

    /// List every checkpoint of a project
    Checkpoints { project: String },

    /// Reconcile a project after an unclean shutdown
    Recover {
        project: String,

        /// Numeric `projects` row whose in-progress tasks should be marked resumed
        #[arg(long)]
        db_project_id: Option<i64>,

        /// Continue the run from its latest checkpoint after reconciling
        #[arg(long)]
        resume: bool,
    },

    /// Approve the gate the project is waiting on
    Approve {
        project: String,

        #[arg(long)]
        by: Option<String>,
    },

    /// Reject the gate the project is waiting on
    Reject {
        project: String,

        #[arg(long)]
        feedback: String,
    },

    /// Print the audit trail of a project, or of one of its task rows
    Audit {
        project: String,

        /// Numeric `tasks` row to report on
        #[arg(long)]
        task: Option<i64>,

        /// List only the gate decisions mentioning this text
        #[arg(long)]
        search: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    flightdeck::log::init_with_debug(cli.debug);

    let config = Config::load()?;
    let db = Arc::new(open_database(&config.effective_database_path()?)?);
    flog!("flightdeck {:?}", cli.command);

    match cli.command {
        Command::Run { project, name } => {
            let name = name.unwrap_or_else(|| project.clone());
            let rt = tokio::runtime::Runtime::new()?;
            let outcome = rt.block_on(async {
                engine(&config, &db, &project)?
                    .start(GraphState::new(&project, &name))
                    .await
            })?;
            print_outcome(&project, &outcome);
        }
        Command::Status { project } => run_status(&db, &project)?,
        Command::Checkpoints { project } => run_checkpoints(&db, &project)?,
        Command::Recover {
            project,
            db_project_id,
            resume,
        } => run_recover(&config, &db, &project, db_project_id, resume)?,
        Command::Approve { project, by } => {
            let mut signal = HitlApprovalSignal::approve();
            if let Some(by) = by {
                signal = signal.by(&by);
            }
            run_resume(&config, &db, &project, signal)?;
        }
        Command::Reject { project, feedback } => {
            run_resume(&config, &db, &project, HitlApprovalSignal::reject(&feedback))?;
        }
        Command::Audit {
            project,
            task,
            search,
        } => run_audit(&db, &project, task, search.as_deref())?,
    }
    Ok(())
}

/// Engine for `project`, with decisions logged against its `projects` row
/// and git snapshots when a workspace is configured.
fn engine(config: &Config, db: &Arc<Database>, project: &str) -> Result<GraphEngine> {
    let repo = StateRepository::new(db.clone());
    let project_db_id = repo.upsert_project(&Project::new(project))?;
    let mut engine = GraphEngine::new(SqliteCheckpointStore::new(db.clone()))
        .with_limits(config.limits())
        .with_repository(repo, project_db_id);
    if let Some(workspace) = config.workspace_path() {
        engine = engine.with_git(git_integration(db, &workspace, config.verify_integrity()));
    }
    Ok(engine)
}

fn git_integration(
    db: &Arc<Database>,
    workspace: &Path,
    verify_integrity: bool,
) -> GitIntegration<GitSnapshotManager, GitIntegrityChecker> {
    let checker = verify_integrity.then(|| GitIntegrityChecker::new(workspace));
    GitIntegration::new(GitSnapshotManager::new(workspace), checker)
    .with_task_repository(TaskRepository::new(db.clone()))
}

fn run_resume(
    config: &Config,
    db: &Arc<Database>,
    project: &str,
    signal: HitlApprovalSignal,
) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async { engine(config, db, project)?.resume(project, signal).await })?;
    print_outcome(project, &outcome);
    Ok(())
}

fn print_outcome(project: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Interrupted {
            gate,
            checkpoint_id,
        } => {
            println!("Waiting for approval: {} (checkpoint {})", gate, checkpoint_id);
            println!();
            println!("Next steps:");
            println!("  Approve: flightdeck approve {}", project);
            println!("  Reject:  flightdeck reject {} --feedback <text>", project);
        }
        RunOutcome::Finished {
            status,
            checkpoint_id,
        } => {
            println!(
                "Run finished: {} (checkpoint {})",
                format_status(*status),
                checkpoint_id
            );
        }
        RunOutcome::Incomplete {
            next,
            checkpoint_id,
        } => {
            println!(
                "Run stopped before {} (checkpoint {}); use 'flightdeck recover {} --resume'",
                next, checkpoint_id, project
            );
        }
    }
}

/// Format project status with color codes for terminal.
fn format_status(status: ProjectStatus) -> String {
    match status {
        ProjectStatus::Completed => format!("\x1b[32m{}\x1b[0m", status), // Green
        ProjectStatus::Error => format!("\x1b[31m{}\x1b[0m", status),     // Red
        ProjectStatus::StrategyPivot => format!("\x1b[35m{}\x1b[0m", status), // Magenta
        ProjectStatus::SecurityPause => format!("\x1b[33m{}\x1b[0m", status), // Yellow
        _ => status.to_string(),
    }
}

fn run_status(db: &Arc<Database>, project: &str) -> Result<()> {
    let store = SqliteCheckpointStore::new(db.clone());
    let Some(checkpoint) = store.latest(project)? else {
        println!("No checkpoints for '{}'", project);
        return Ok(());
    };
    let state = checkpoint.state()?;

    println!("Project:     {} ({})", state.project_config.name, project);
    println!("Status:      {}", format_status(state.status));
    println!("Checkpoint:  {} at {}", checkpoint.checkpoint_id, checkpoint.created_at);
    println!(
        "Last step:   #{} {} {}",
        checkpoint.metadata.step, checkpoint.metadata.node, checkpoint.metadata.next
    );
    let done = state.tasks.iter().filter(|t| !t.status.is_open()).count();
    println!("Tasks:       {}/{} closed", done, state.tasks.len());
    if let Some(gate) = state.pending_approval_gate {
        println!("Waiting on:  {}", gate);
    }
    Ok(())
}

fn run_checkpoints(db: &Arc<Database>, project: &str) -> Result<()> {
    let checkpoints = SqliteCheckpointStore::new(db.clone()).list(project)?;
    if checkpoints.is_empty() {
        println!("No checkpoints for '{}'", project);
        return Ok(());
    }
    println!("{:>6}  {:>5}  {:<16}  {:<28}  CREATED", "ID", "STEP", "NODE", "NEXT");
    for cp in &checkpoints {
        println!(
            "{:>6}  {:>5}  {:<16}  {:<28}  {}",
            cp.checkpoint_id,
            cp.metadata.step,
            cp.metadata.node.to_string(),
            cp.metadata.next.to_string(),
            cp.created_at
        );
    }
    Ok(())
}

fn run_recover(
    config: &Config,
    db: &Arc<Database>,
    project: &str,
    db_project_id: Option<i64>,
    resume: bool,
) -> Result<()> {
    let report = RecoveryManager::new(db.clone()).reconcile(project, db_project_id)?;
    match &report.handle {
        Some(handle) => println!(
            "Recoverable from checkpoint {} of '{}'",
            handle.checkpoint_id, handle.thread_id
        ),
        None => {
            println!("Nothing to recover for '{}'", project);
            return Ok(());
        }
    }
    if !report.stale_tasks.is_empty() {
        println!("Tasks interrupted mid-flight:");
        for task in &report.stale_tasks {
            println!("  - {} {}", task.task_id, task.name);
        }
    }
    if db_project_id.is_some() {
        println!("Task rows marked resumed: {}", report.resumed_tasks);
    }

    if resume {
        let rt = tokio::runtime::Runtime::new()?;
        let outcome = rt.block_on(async {
            engine(config, db, project)?
                .resume_from_checkpoint(project)
                .await
        })?;
        print_outcome(project, &outcome);
    }
    Ok(())
}

fn run_audit(
    db: &Arc<Database>,
    project: &str,
    task: Option<i64>,
    search: Option<&str>,
) -> Result<()> {
    let repo = StateRepository::new(db.clone());
    let project_db_id = repo
        .get_project_by_name(project)?
        .and_then(|p| p.id)
        .ok_or_else(|| Error::ProjectNotFound {
            id: project.to_string(),
        })?;

    if let Some(query) = search {
        let decisions = repo.search_decisions(project_db_id, query)?;
        if decisions.is_empty() {
            println!("No decisions matching '{}'", query);
        }
        for d in &decisions {
            println!(
                "{}  {:<16}  {:<8}  {}",
                d.decided_at,
                d.gate,
                if d.approved { "approved" } else { "rejected" },
                d.feedback.as_deref().unwrap_or("")
            );
        }
        return Ok(());
    }

    let audit = AuditTrail::new(db.clone());
    let report = match task {
        Some(task_id) => audit.task_report(task_id)?,
        None => audit.project_report(project_db_id)?,
    };
    print!("{}", report);
    Ok(())
}
