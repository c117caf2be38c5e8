//! Read-side subcommands: status, list and show.

use crate::format::OutputFormat;
use crate::types::{TaskFilter, TaskStatus};
use clap::Args;

/// Arguments for the status subcommand
#[derive(Args, Debug)]
pub struct StatusArgs {
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Arguments for the list subcommand
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only tasks with this status
    #[arg(short, long)]
    pub status: Option<TaskStatus>,

    /// Only tasks at this depth
    #[arg(long)]
    pub depth: Option<u32>,

    /// Only children of this task
    #[arg(long, value_name = "ID")]
    pub parent: Option<String>,

    /// Maximum number of tasks to show
    #[arg(short = 'n', long)]
    pub limit: Option<u32>,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

impl ListArgs {
    pub fn filter(&self) -> TaskFilter {
        TaskFilter {
            status: self.status,
            depth: self.depth,
            parent_task_id: self.parent.clone(),
            limit: self.limit,
        }
    }
}

/// Arguments for the show subcommand
#[derive(Args, Debug)]
pub struct ShowArgs {
    pub task_id: String,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}
