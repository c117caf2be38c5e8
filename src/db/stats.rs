//! Aggregation queries for status reporting and the completion watcher.

use super::tasks::{TASK_COLUMNS, parse_task_row};
use super::{Database, now_ms};
use crate::error::{QueueError, QueueResult};
use crate::types::{StatusCounts, Task, TaskStatus, UsageTotals};
use rusqlite::params;
use std::collections::BTreeMap;

impl Database {
    /// Count tasks per status in a single query, so the snapshot is consistent.
    pub fn counts_by_status(&self) -> QueueResult<StatusCounts> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = StatusCounts::default();
            for (status, count) in rows {
                let status = status
                    .parse::<TaskStatus>()
                    .map_err(QueueError::CorruptRow)?;
                counts.set(status, count.max(0) as u64);
            }

            Ok(counts)
        })
    }

    /// Number of tasks at each depth.
    pub fn counts_by_depth(&self) -> QueueResult<BTreeMap<u32, u64>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT depth, COUNT(*) FROM tasks GROUP BY depth ORDER BY depth")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .map(|(depth, count)| (depth, count.max(0) as u64))
                .collect())
        })
    }

    /// Sum of recorded token usage.
    pub fn usage_totals(&self) -> QueueResult<UsageTotals> {
        self.with_conn(|conn| {
            let (tasks, input, output): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0)
                 FROM tasks WHERE input_tokens IS NOT NULL OR output_tokens IS NOT NULL",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            Ok(UsageTotals {
                tasks_reporting: tasks.max(0) as u64,
                input_tokens: input.max(0) as u64,
                output_tokens: output.max(0) as u64,
            })
        })
    }

    /// Running tasks claimed more than `threshold_ms` ago, oldest first.
    pub fn stale_running_tasks(&self, threshold_ms: i64) -> QueueResult<Vec<Task>> {
        let cutoff = now_ms() - threshold_ms;

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?1
                 ORDER BY started_at ASC"
            ))?;
            let tasks = stmt
                .query_map(params![cutoff], parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewTask, Outcome, TokenUsage};

    #[test]
    fn counts_cover_every_status() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..4 {
            db.enqueue(&NewTask::root(format!("t{i}"), "docs"), 5).unwrap();
        }
        let done = db.claim_next().unwrap().unwrap();
        db.complete(&done.id, Outcome::Completed, None, None).unwrap();
        let failed = db.claim_next().unwrap().unwrap();
        db.complete(&failed.id, Outcome::Failed, None, Some("x")).unwrap();
        db.claim_next().unwrap().unwrap();
        let pending = db.list_tasks(&Default::default()).unwrap().pop().unwrap();
        db.cancel_pending(&pending.id).unwrap();

        let counts = db.counts_by_status().unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn usage_totals_only_count_reporting_tasks() {
        let db = Database::open_in_memory().unwrap();
        db.enqueue(&NewTask::root("a", "docs"), 5).unwrap();
        db.enqueue(&NewTask::root("b", "docs"), 5).unwrap();

        let a = db.claim_next().unwrap().unwrap();
        db.complete(&a.id, Outcome::Completed, Some(TokenUsage::new(100, 20)), None)
            .unwrap();
        let b = db.claim_next().unwrap().unwrap();
        db.complete(&b.id, Outcome::Completed, None, None).unwrap();

        let totals = db.usage_totals().unwrap();
        assert_eq!(totals.tasks_reporting, 1);
        assert_eq!(totals.input_tokens, 100);
        assert_eq!(totals.output_tokens, 20);
    }

    #[test]
    fn stale_running_tasks_respects_threshold() {
        let db = Database::open_in_memory().unwrap();
        db.enqueue(&NewTask::root("a", "docs"), 5).unwrap();
        let task = db.claim_next().unwrap().unwrap();

        assert!(db.stale_running_tasks(60_000).unwrap().is_empty());

        std::thread::sleep(std::time::Duration::from_millis(5));
        let stale = db.stale_running_tasks(0).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, task.id);
    }

    #[test]
    fn counts_by_depth_groups_levels() {
        let db = Database::open_in_memory().unwrap();
        let root = db.enqueue(&NewTask::root("root", "docs"), 5).unwrap();
        for _ in 0..2 {
            db.enqueue(
                &NewTask {
                    depth: 1,
                    parent_task_id: Some(root.clone()),
                    ..NewTask::root("child", "docs")
                },
                5,
            )
            .unwrap();
        }

        let by_depth = db.counts_by_depth().unwrap();
        assert_eq!(by_depth.get(&0), Some(&1));
        assert_eq!(by_depth.get(&1), Some(&2));
    }
}
