//! Output formatting for the CLI: plain text tables and JSON.

use crate::controller::QueueStatus;
use crate::types::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Pretty-printed JSON for any serializable result.
pub fn to_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    serde_json::to_string_pretty(value)
}

fn format_time(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn short_id(id: &str) -> &str {
    // UUIDv7 ids share their leading timestamp bits, so use the tail
    let start = id.len().saturating_sub(8);
    id.get(start..).unwrap_or(id)
}

fn truncate(s: &str, max: usize) -> String {
    let line = s.lines().next().unwrap_or("");
    if line.chars().count() <= max {
        return line.to_string();
    }
    let cut: String = line.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", cut)
}

/// Summary block for `status`.
pub fn format_status_text(status: &QueueStatus) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "Run: {}\n",
        if status.running { "active" } else { "not running" }
    ));
    if status.running {
        out.push_str(&format!(
            "Watcher: {}  processed: {}\n",
            status.watcher, status.processed
        ));
    }

    out.push_str("\nTasks\n");
    for s in TaskStatus::ALL {
        out.push_str(&format!("  {:<10} {}\n", s.as_str(), status.counts.get(s)));
    }
    out.push_str(&format!("  {:<10} {}\n", "total", status.counts.total()));

    if !status.by_depth.is_empty() {
        out.push_str("\nBy depth\n");
        for (depth, count) in &status.by_depth {
            out.push_str(&format!("  {:<10} {}\n", depth, count));
        }
    }

    if status.usage.tasks_reporting > 0 {
        out.push_str(&format!(
            "\nTokens: {} in / {} out over {} tasks\n",
            status.usage.input_tokens, status.usage.output_tokens, status.usage.tasks_reporting
        ));
    }

    if !status.workers.is_empty() {
        out.push_str("\nWorkers\n");
        for w in &status.workers {
            out.push_str(&format!(
                "  {:<24} {:<5} processed={:<4} {}\n",
                w.id,
                if w.alive { "up" } else { "down" },
                w.processed,
                w.current_task.as_deref().map(short_id).unwrap_or("-"),
            ));
        }
    }

    if !status.orphans.is_empty() {
        out.push_str(&format!(
            "\nOrphaned (running past stale threshold): {}\n",
            status.orphans.len()
        ));
        for id in &status.orphans {
            out.push_str(&format!("  {}\n", id));
        }
    }

    out
}

/// One line per task.
pub fn format_tasks_text(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No tasks.\n".to_string();
    }

    let mut out = format!(
        "{:<8}  {:<9}  {:>5}  {:<19}  {:<24}  {}\n",
        "ID", "STATUS", "DEPTH", "CREATED", "OUTPUT", "PROMPT"
    );
    for task in tasks {
        out.push_str(&format!(
            "{:<8}  {:<9}  {:>5}  {:<19}  {:<24}  {}\n",
            short_id(&task.id),
            task.status.as_str(),
            task.depth,
            format_time(task.created_at),
            truncate(&task.output_path, 24),
            truncate(&task.prompt, 60),
        ));
    }
    out
}

/// Full detail for one task.
pub fn format_task_text(task: &Task) -> String {
    let mut out = String::new();

    out.push_str(&format!("id:          {}\n", task.id));
    out.push_str(&format!("status:      {}\n", task.status));
    out.push_str(&format!("depth:       {}\n", task.depth));
    out.push_str(&format!(
        "parent:      {}\n",
        task.parent_task_id.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!("output_path: {}\n", task.output_path));
    out.push_str(&format!("created_at:  {}\n", format_time(task.created_at)));
    if let Some(ms) = task.started_at {
        out.push_str(&format!("started_at:  {}\n", format_time(ms)));
    }
    if let Some(ms) = task.completed_at {
        out.push_str(&format!("finished_at: {}\n", format_time(ms)));
    }
    if let Some(usage) = task.usage() {
        out.push_str(&format!(
            "tokens:      {} in / {} out\n",
            usage.input_tokens, usage.output_tokens
        ));
    }
    if let Some(ref error) = task.error {
        out.push_str(&format!("error:       {}\n", error));
    }
    if let Some(ref context) = task.context {
        out.push_str(&format!("context:     {}\n", context));
    }

    out.push_str("\nprompt:\n");
    out.push_str(&task.prompt);
    out.push('\n');

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(prompt: &str) -> Task {
        Task {
            id: "0190f1c2-7a8b-7def-8123-456789abcdef".into(),
            prompt: prompt.into(),
            output_path: "docs/billing".into(),
            context: None,
            depth: 1,
            status: TaskStatus::Failed,
            parent_task_id: None,
            error: Some("agent crashed".into()),
            input_tokens: None,
            output_tokens: None,
            created_at: 0,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn task_table_shows_short_ids_and_first_prompt_line() {
        let out = format_tasks_text(&[task("Document billing\nwith lots of detail")]);
        assert!(out.contains("89abcdef"));
        assert!(out.contains("failed"));
        assert!(out.contains("Document billing"));
        assert!(!out.contains("lots of detail"));
    }

    #[test]
    fn task_detail_includes_error() {
        let out = format_task_text(&task("p"));
        assert!(out.contains("error:       agent crashed"));
        assert!(out.contains("parent:      -"));
    }

    #[test]
    fn long_text_is_truncated() {
        assert_eq!(truncate("abcdefghij", 6), "abc...");
        assert_eq!(truncate("short", 6), "short");
    }
}
