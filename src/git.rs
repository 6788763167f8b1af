//! git2-backed snapshot and integrity collaborators for the task git node.

use std::path::{Path, PathBuf};

use git2::{ErrorCode, IndexAddOption, Oid, Repository, Signature, Status, StatusOptions};

use crate::orchestration::task_git::{
    IntegrityChecker, IntegrityCheckResult, IntegrityViolation, ObjectStoreCheckResult,
    SnapshotContext, SnapshotManager, ViolationKind, WorkspaceStatus,
};
use crate::util::blocking;
use crate::{flog_debug, flog_warn, Result};

/// Entries every managed workspace ignores.
const STANDARD_IGNORES: &[&str] = &[".flightdeck/", "target/", ".env", ".env.local"];

/// Commits the agent workspace after each task.
pub struct GitSnapshotManager {
    repo_path: PathBuf,
}

impl GitSnapshotManager {
    pub fn new(repo_path: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
        }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }
}

/// Append missing standard entries to `.gitignore`.
fn ensure_standard_ignores(repo_path: &Path) -> Result<()> {
    let path = repo_path.join(".gitignore");
    let existing = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let present: Vec<&str> = existing
        .lines()
        .map(|l| l.trim().trim_end_matches('/'))
        .collect();
    let missing: Vec<&str> = STANDARD_IGNORES
        .iter()
        .copied()
        .filter(|entry| !present.contains(&entry.trim_end_matches('/')))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str("\n# flightdeck\n");
    content.push_str(&missing.join("\n"));
    content.push('\n');
    std::fs::write(&path, content)?;
    Ok(())
}

fn commit_all(repo_path: &Path, message: &str) -> Result<Oid> {
    let repo = Repository::open(repo_path)?;
    let mut index = repo.index()?;
    index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
    index.update_all(["."].iter(), None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = repo
        .signature()
        .or_else(|_| Signature::now("flightdeck", "flightdeck@localhost"))?;

    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
            None
        }
        Err(e) => return Err(e.into()),
    };

    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    flog_debug!("commit {} in {}", id, repo_path.display());
    Ok(id)
}

fn workspace_status(repo_path: &Path) -> Result<WorkspaceStatus> {
    let repo = Repository::open(repo_path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo.statuses(Some(&mut opts))?;

    let mut status = WorkspaceStatus::default();
    for entry in statuses.iter() {
        let Some(path) = entry.path() else {
            continue;
        };
        let flags = entry.status();
        if flags.intersects(
            Status::INDEX_NEW
                | Status::INDEX_MODIFIED
                | Status::INDEX_DELETED
                | Status::INDEX_RENAMED
                | Status::INDEX_TYPECHANGE,
        ) {
            status.staged.push(path.to_string());
        }
        if flags.intersects(
            Status::WT_MODIFIED | Status::WT_DELETED | Status::WT_RENAMED | Status::WT_TYPECHANGE,
        ) {
            status.unstaged.push(path.to_string());
        }
        if flags.contains(Status::WT_NEW) {
            status.untracked.push(path.to_string());
        }
    }
    status.is_clean =
        status.staged.is_empty() && status.unstaged.is_empty() && status.untracked.is_empty();
    Ok(status)
}

impl SnapshotManager for GitSnapshotManager {
    async fn initialize(&self) -> Result<()> {
        let path = self.repo_path.clone();
        blocking(move || {
            if Repository::open(&path).is_err() {
                flog_debug!("initializing repository at {}", path.display());
                std::fs::create_dir_all(&path)?;
                Repository::init(&path)?;
            }
            ensure_standard_ignores(&path)
        })
        .await
    }

    async fn create_task_snapshot(
        &self,
        task_id: &str,
        context: &SnapshotContext,
    ) -> Result<Option<String>> {
        let path = self.repo_path.clone();
        let message = format!("task: complete task {}", task_id);
        flog_debug!("snapshot for task {} ({})", task_id, context.task_name);
        blocking(move || {
            if workspace_status(&path)?.is_clean {
                return Ok(None);
            }
            Ok(Some(commit_all(&path, &message)?.to_string()))
        })
        .await
    }

    async fn take_snapshot(&self, message: &str) -> Result<String> {
        let path = self.repo_path.clone();
        let message = message.to_string();
        blocking(move || Ok(commit_all(&path, &message)?.to_string())).await
    }

    async fn get_status(&self) -> Result<WorkspaceStatus> {
        let path = self.repo_path.clone();
        blocking(move || workspace_status(&path)).await
    }
}

/// Workspace and object-store checks. Failures to inspect the repository
/// are reported as violations, never as errors.
pub struct GitIntegrityChecker {
    repo_path: PathBuf,
}

impl GitIntegrityChecker {
    pub fn new(repo_path: &Path) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
        }
    }
}

fn workspace_integrity(repo_path: &Path) -> IntegrityCheckResult {
    let mut violations = Vec::new();

    let repo = match Repository::open(repo_path) {
        Ok(repo) => repo,
        Err(e) => {
            violations.push(IntegrityViolation::new(
                ViolationKind::UnreachableHead,
                format!("cannot open repository: {}", e.message()),
            ));
            return IntegrityCheckResult {
                passed: false,
                is_dirty: true,
                is_detached_head: false,
                head_reachable: false,
                violations,
            };
        }
    };

    let mut opts = StatusOptions::new();
    opts.include_untracked(true);
    let is_dirty = match repo.statuses(Some(&mut opts)) {
        Ok(statuses) if statuses.is_empty() => false,
        Ok(statuses) => {
            let files: Vec<String> = statuses
                .iter()
                .filter_map(|s| s.path().map(str::to_string))
                .collect();
            violations.push(IntegrityViolation::new(
                ViolationKind::DirtyWorkspace,
                format!("{} uncommitted change(s): {}", files.len(), files.join(", ")),
            ));
            true
        }
        Err(e) => {
            violations.push(IntegrityViolation::new(
                ViolationKind::DirtyWorkspace,
                format!("failed to read workspace status: {}", e.message()),
            ));
            true
        }
    };

    let head_reachable = repo.head().and_then(|h| h.peel_to_commit()).is_ok();
    if !head_reachable {
        violations.push(IntegrityViolation::new(
            ViolationKind::UnreachableHead,
            "HEAD does not resolve to a commit",
        ));
    }

    // A missing HEAD is already reported above.
    let is_detached_head = head_reachable && repo.head_detached().unwrap_or(false);
    if is_detached_head {
        violations.push(IntegrityViolation::new(
            ViolationKind::DetachedHead,
            "HEAD is detached; check out a branch before snapshotting",
        ));
    }

    IntegrityCheckResult {
        passed: violations.is_empty(),
        is_dirty,
        is_detached_head,
        head_reachable,
        violations,
    }
}

/// Read every object in the object database.
fn object_store_integrity(repo_path: &Path) -> ObjectStoreCheckResult {
    let mut violations = Vec::new();
    let scan = Repository::open(repo_path).and_then(|repo| {
        let odb = repo.odb()?;
        let mut ids = Vec::new();
        odb.foreach(|id| {
            ids.push(*id);
            true
        })?;
        for id in ids {
            if let Err(e) = odb.read(id) {
                violations.push(IntegrityViolation::new(
                    ViolationKind::CorruptObject,
                    format!("object {} unreadable: {}", id, e.message()),
                ));
            }
        }
        Ok(())
    });
    if let Err(e) = scan {
        flog_warn!("object store scan failed: {}", e);
        violations.push(IntegrityViolation::new(
            ViolationKind::CorruptObject,
            format!("object store scan failed: {}", e.message()),
        ));
    }
    ObjectStoreCheckResult {
        passed: violations.is_empty(),
        violations,
    }
}

impl IntegrityChecker for GitIntegrityChecker {
    async fn verify_workspace(&self) -> Result<IntegrityCheckResult> {
        let path = self.repo_path.clone();
        blocking(move || Ok(workspace_integrity(&path))).await
    }

    async fn check_object_store_integrity(&self) -> Result<ObjectStoreCheckResult> {
        let path = self.repo_path.clone();
        blocking(move || Ok(object_store_integrity(&path))).await
    }
}
