//! SQLite connection handle and the transaction discipline every write uses.
//!
//! `Database` owns one connection behind a mutex. The lock is held only for
//! the duration of a single statement batch, never across a caller's closure
//! or an `.await`, so repository calls made inside a transaction re-enter
//! freely and nest as savepoints.
//!
//! An outermost transaction claims the connection for its owner (the calling
//! thread, or the async unit of work started by
//! [`Database::transaction_async`]). Until it commits or rolls back, every
//! other owner blocks before touching the connection, so one caller's writes
//! never land inside another caller's transaction.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use rusqlite::Connection;
use uuid::Uuid;

use super::schema;
use crate::error::{Error, Result};
use crate::{flog_debug, flog_trace, flog_warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

tokio::task_local! {
    static ASYNC_OWNER: u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Thread(ThreadId),
    Task(u64),
}

fn current_owner() -> Owner {
    ASYNC_OWNER
        .try_with(|id| Owner::Task(*id))
        .unwrap_or_else(|_| Owner::Thread(thread::current().id()))
}

pub struct Database {
    conn: Mutex<Connection>,
    owner: Mutex<Option<Owner>>,
    released: Condvar,
    savepoint_seq: AtomicU64,
    owner_seq: AtomicU64,
    path: Option<PathBuf>,
}

/// The outermost transaction of one owner.
///
/// Dropped without [`Claim::finish`] (an error, a panic in the caller's
/// closure, or a cancelled future) it rolls back whatever is still open.
struct Claim<'a> {
    db: &'a Database,
    finished: bool,
}

impl Claim<'_> {
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Bypasses the owner check: a cancelled future may be dropped
            // outside its own task scope.
            let conn = self.db.conn.lock().unwrap_or_else(PoisonError::into_inner);
            if !conn.is_autocommit() {
                flog_debug!("transaction abandoned, rolling back");
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    flog_warn!("rollback of abandoned transaction failed: {}", e);
                }
            }
        }
        let mut owner = self.db.owner.lock().unwrap_or_else(PoisonError::into_inner);
        *owner = None;
        drop(owner);
        self.db.released.notify_all();
    }
}

impl Database {
    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            conn: Mutex::new(conn),
            owner: Mutex::new(None),
            released: Condvar::new(),
            savepoint_seq: AtomicU64::new(0),
            owner_seq: AtomicU64::new(0),
            path,
        }
    }

    /// Open (or create) the database file, apply pragmas and create the schema.
    pub fn open(path: &Path) -> Result<Self> {
        flog_debug!("Database::open path={}", path.display());
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        ensure_private_file(path)?;

        let db = Self::with_connection(Connection::open(path)?, Some(path.to_path_buf()));
        db.configure()?;
        schema::initialize(&db)?;
        Ok(db)
    }

    /// In-memory database with the full schema (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let db = Self::with_connection(Connection::open_in_memory()?, None);
        db.configure()?;
        schema::initialize(&db)?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn configure(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )
        })
    }

    /// Block until no owner other than `me` holds a transaction.
    fn turn(&self, me: Owner) -> Result<MutexGuard<'_, Option<Owner>>> {
        let owner = self.owner.lock().map_err(|_| Error::LockPoisoned)?;
        self.released
            .wait_while(owner, |owner| matches!(*owner, Some(o) if o != me))
            .map_err(|_| Error::LockPoisoned)
    }

    fn claim(&self, me: Owner) -> Result<Claim<'_>> {
        let mut owner = self.turn(me)?;
        *owner = Some(me);
        Ok(Claim {
            db: self,
            finished: false,
        })
    }

    fn owned_by(&self, me: Owner) -> Result<bool> {
        let owner = self.owner.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(*owner == Some(me))
    }

    /// Run `f` against the connection while holding the lock.
    ///
    /// Used for reads and for the individual statements of a write that is
    /// already wrapped in [`Database::transaction`]. Waits while another
    /// owner's transaction is open.
    pub(crate) fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let _turn = self.turn(current_owner())?;
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(f(&conn)?)
    }

    fn exec(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(sql))
    }

    /// Whether a transaction (or savepoint) is currently open.
    pub fn in_transaction(&self) -> Result<bool> {
        self.with_conn(|conn| Ok(!conn.is_autocommit()))
    }

    /// Run `f` atomically.
    ///
    /// At the outermost level this is `BEGIN IMMEDIATE` / `COMMIT`. Inside an
    /// open transaction of the same owner it becomes a uniquely named
    /// savepoint, so a failing inner call rolls back only its own writes.
    /// Errors from `f` are returned unchanged after the rollback.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let me = current_owner();
        if self.owned_by(me)? {
            let name = format!(
                "sp_{}",
                self.savepoint_seq.fetch_add(1, Ordering::SeqCst) + 1
            );
            return self.within_savepoint(&name, f);
        }

        let claim = self.claim(me)?;
        self.exec("BEGIN IMMEDIATE")?;
        flog_trace!("BEGIN IMMEDIATE");
        match f() {
            Ok(value) => {
                self.exec("COMMIT")?;
                claim.finish();
                Ok(value)
            }
            Err(e) => {
                flog_debug!("transaction rolled back: {}", e);
                Err(e)
            }
        }
    }

    /// Run an async unit of work inside a uniquely named savepoint.
    ///
    /// The savepoint is released on success, folding into any enclosing
    /// transaction, or rolled back and released on failure before the error
    /// is returned. When no transaction of the caller is open, the unit
    /// claims the connection until it finishes, across every `.await` and
    /// whichever worker thread polls it.
    pub async fn transaction_async<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.owned_by(current_owner())? {
            return self.savepoint_async(f).await;
        }

        let id = self.owner_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let claim = self.claim(Owner::Task(id))?;
        let result = ASYNC_OWNER.scope(id, self.savepoint_async(f)).await;
        if result.is_ok() {
            claim.finish();
        }
        result
    }

    async fn savepoint_async<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let name = format!("sp_async_{}", Uuid::new_v4().simple());
        self.exec(&format!("SAVEPOINT {}", name))?;
        flog_trace!("SAVEPOINT {}", name);

        match f().await {
            Ok(value) => {
                if let Err(e) = self.exec(&format!("RELEASE SAVEPOINT {}", name)) {
                    self.abandon_savepoint(&name);
                    return Err(e);
                }
                Ok(value)
            }
            Err(e) => {
                flog_debug!("async savepoint {} rolled back: {}", name, e);
                self.abandon_savepoint(&name);
                Err(e)
            }
        }
    }

    fn within_savepoint<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        self.exec(&format!("SAVEPOINT {}", name))?;
        flog_trace!("SAVEPOINT {}", name);
        match f() {
            Ok(value) => {
                if let Err(e) = self.exec(&format!("RELEASE SAVEPOINT {}", name)) {
                    self.abandon_savepoint(name);
                    return Err(e);
                }
                Ok(value)
            }
            Err(e) => {
                flog_debug!("savepoint {} rolled back: {}", name, e);
                self.abandon_savepoint(name);
                Err(e)
            }
        }
    }

    // A failed rollback is only logged; callers see the error that triggered it.
    fn abandon_savepoint(&self, name: &str) {
        let sql = format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};");
        if let Err(e) = self.exec(&sql) {
            flog_warn!("rollback '{}' failed: {}", sql, e);
        }
    }
}

/// Create the database file owner-only, or warn if an existing file is wider.
#[cfg(unix)]
fn ensure_private_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    if path.exists() {
        let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            flog_warn!(
                "database {} has permissions {:o}, expected 600",
                path.display(),
                mode
            );
        }
        return Ok(());
    }

    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn ensure_private_file(_path: &Path) -> Result<()> {
    Ok(())
}
