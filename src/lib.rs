//! doc-spawner library
//!
//! A self-spawning hierarchical task queue: workers claim tasks from a
//! SQLite store, run them through a capability that may enqueue children,
//! and a watcher enqueues one finalization task once everything is done.

pub mod capability;
pub mod cli;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod executor;
pub mod format;
pub mod logging;
pub mod types;
pub mod watcher;
pub mod worker;
