//! Integration test suite for flightdeck.
//!
//! These tests drive the pipeline through the public API against real
//! SQLite files and real git repositories in temporary directories.
//!
//! # Test Categories
//!
//! - `hitl_flow`: Approval gates, rejection loops and replayed signals
//! - `task_git`: Snapshot hashes, integrity pauses and atomic task commits
//! - `crash_recovery`: Reopening the store, resumed tasks, thread isolation
//! - `transactions`: Commit, rollback and nesting of repository writes
//! - `error_escalation`: Node failures, retries and the pivot threshold
//!
//! # CI Compatibility
//!
//! Node work is simulated with in-process handlers; nothing calls out to an
//! agent backend or the network.


mod crash_recovery;
mod error_escalation;
mod hitl_flow;
mod transactions;
