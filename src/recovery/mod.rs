//! Crash recovery for interrupted pipeline runs.
//!
//! Checkpoints and business rows share one SQLite file but not a key space:
//! checkpoints are keyed by the thread (project) id string, tasks by integer
//! ids under a `projects` row. Recovery bridges the two.

mod manager;

pub use manager::{RecoveryHandle, RecoveryManager, RecoveryReport};
