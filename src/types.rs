//! Core types for the doc-spawner task queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a task.
///
/// Allowed transitions: `pending -> running -> {completed | failed}` and
/// `pending -> cancelled`. Nothing ever moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states have no exits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {}", other)),
        }
    }
}

/// How a running task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            Outcome::Completed => TaskStatus::Completed,
            Outcome::Failed => TaskStatus::Failed,
        }
    }
}

/// Token accounting reported by the capability. Reporting only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub output_path: String,
    pub context: Option<Value>,
    pub depth: u32,
    pub status: TaskStatus,
    pub parent_task_id: Option<String>,
    pub error: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl Task {
    pub fn usage(&self) -> Option<TokenUsage> {
        match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (i, o) => Some(TokenUsage::new(i.unwrap_or(0), o.unwrap_or(0))),
        }
    }
}

/// Input for enqueueing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub prompt: String,
    pub output_path: String,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub context: Option<Value>,
}

impl NewTask {
    /// A root task (depth 0, no parent).
    pub fn root(prompt: impl Into<String>, output_path: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            output_path: output_path.into(),
            depth: 0,
            parent_task_id: None,
            context: None,
        }
    }

    /// A child of `parent`, one level deeper.
    pub fn child_of(parent: &Task, request: SpawnRequest) -> Self {
        Self {
            prompt: request.prompt,
            output_path: request.output_path,
            depth: parent.depth + 1,
            parent_task_id: Some(parent.id.clone()),
            context: request.context,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// A task an operator seeds at start-up, as read from a seed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedTask {
    pub prompt: String,
    pub output_path: String,
    #[serde(default)]
    pub context: Option<Value>,
}

impl From<SeedTask> for NewTask {
    fn from(seed: SeedTask) -> Self {
        Self {
            prompt: seed.prompt,
            output_path: seed.output_path,
            depth: 0,
            parent_task_id: None,
            context: seed.context,
        }
    }
}

/// A request from a running capability to spawn a child task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRequest {
    pub prompt: String,
    pub output_path: String,
    #[serde(default)]
    pub context: Option<Value>,
}

impl SpawnRequest {
    pub fn new(prompt: impl Into<String>, output_path: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            output_path: output_path.into(),
            context: None,
        }
    }
}

/// Point-in-time task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Running => self.running,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    pub(crate) fn set(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending = count,
            TaskStatus::Running => self.running = count,
            TaskStatus::Completed => self.completed = count,
            TaskStatus::Failed => self.failed = count,
            TaskStatus::Cancelled => self.cancelled = count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    /// No task is pending or running.
    pub fn is_quiescent(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Filters for listing tasks. `None` means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub depth: Option<u32>,
    pub parent_task_id: Option<String>,
    pub limit: Option<u32>,
}

impl TaskFilter {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// Aggregate token usage over finished tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub tasks_reporting: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}
