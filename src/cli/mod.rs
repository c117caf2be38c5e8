//! CLI command definitions for doc-spawner
//!
//! This module defines the CLI structure using clap's derive macros.
//! The main entry point is the `Cli` struct which contains subcommands.

pub mod query;
pub mod start;

use clap::{Parser, Subcommand};
use query::{ListArgs, ShowArgs, StatusArgs};
use start::StartArgs;

/// Self-spawning hierarchical task queue for documentation agents
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Seed root tasks and run workers until the queue drains
    Start(StartArgs),

    /// Show task counts, usage and orphaned tasks
    Status(StatusArgs),

    /// List tasks, oldest first
    List(ListArgs),

    /// Show one task
    Show(ShowArgs),

    /// Cancel a pending task, or every pending task when no id is given
    Cancel {
        /// Task to cancel
        task_id: Option<String>,
    },

    /// Delete every task in the store
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },
}
