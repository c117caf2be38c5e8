//! Task enqueue, claim, completion and listing.

use super::{Database, now_ms};
use crate::error::{QueueError, QueueResult};
use crate::types::{NewTask, Outcome, Task, TaskFilter, TaskStatus, TokenUsage};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

pub(crate) const TASK_COLUMNS: &str = "id, prompt, output_path, context, depth, status, parent_task_id, \
     error, input_tokens, output_tokens, created_at, started_at, completed_at";

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into())
}

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| conversion_error(5, e))?;

    let context: Option<String> = row.get("context")?;
    let context = context
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion_error(3, e.to_string()))?;

    let input_tokens: Option<i64> = row.get("input_tokens")?;
    let output_tokens: Option<i64> = row.get("output_tokens")?;

    Ok(Task {
        id: row.get("id")?,
        prompt: row.get("prompt")?,
        output_path: row.get("output_path")?,
        context,
        depth: row.get("depth")?,
        status,
        parent_task_id: row.get("parent_task_id")?,
        error: row.get("error")?,
        input_tokens: input_tokens.map(|n| n.max(0) as u64),
        output_tokens: output_tokens.map(|n| n.max(0) as u64),
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

/// Internal helper to get a task using an existing connection (avoids deadlock).
fn get_task_internal(conn: &Connection, task_id: &str) -> QueueResult<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id],
            parse_task_row,
        )
        .optional()?;
    Ok(task)
}

/// Validate and insert one task. Caller owns the transaction.
fn insert_task(conn: &Connection, task: &NewTask, max_depth: u32) -> QueueResult<String> {
    if task.depth > max_depth {
        return Err(QueueError::DepthExceeded {
            depth: task.depth,
            max_depth,
        });
    }

    if let Some(parent_id) = task.parent_task_id.as_deref() {
        let parent = get_task_internal(conn, parent_id)?
            .ok_or_else(|| QueueError::TaskNotFound(parent_id.to_string()))?;
        if task.depth != parent.depth + 1 {
            return Err(QueueError::InconsistentDepth {
                depth: task.depth,
                parent_task_id: parent.id,
                parent_depth: parent.depth,
            });
        }
    }

    let task_id = Uuid::now_v7().to_string();
    let context = task
        .context
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO tasks (id, prompt, output_path, context, depth, status, parent_task_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
        params![
            &task_id,
            &task.prompt,
            &task.output_path,
            context,
            task.depth,
            &task.parent_task_id,
            now_ms(),
        ],
    )?;

    Ok(task_id)
}

/// Check that `task_id` may move to `next`, returning its current row.
fn check_transition(conn: &Connection, task_id: &str, next: TaskStatus) -> QueueResult<Task> {
    let task = get_task_internal(conn, task_id)?
        .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;

    if !task.status.can_transition_to(next) {
        return Err(QueueError::invalid_transition(task_id, task.status, next));
    }

    Ok(task)
}

impl Database {
    /// Insert a new pending task and return its generated id.
    ///
    /// Fails with `DepthExceeded` when `task.depth > max_depth`; nothing is
    /// written in that case.
    pub fn enqueue(&self, task: &NewTask, max_depth: u32) -> QueueResult<String> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let task_id = insert_task(&tx, task, max_depth)?;
            tx.commit()?;
            Ok(task_id)
        })
    }

    /// Insert several tasks atomically: either all are enqueued or none.
    pub fn enqueue_many(&self, tasks: &[NewTask], max_depth: u32) -> QueueResult<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let ids = tasks
                .iter()
                .map(|task| insert_task(&tx, task, max_depth))
                .collect::<QueueResult<Vec<_>>>()?;
            tx.commit()?;
            Ok(ids)
        })
    }

    /// Atomically claim the oldest pending task, moving it to `running`.
    ///
    /// Returns `None` when nothing is pending.
    pub fn claim_next(&self) -> QueueResult<Option<Task>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let candidate = tx
                .query_row(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending'
                         ORDER BY created_at ASC, seq ASC LIMIT 1"
                    ),
                    [],
                    parse_task_row,
                )
                .optional()?;

            let Some(task) = candidate else {
                return Ok(None);
            };

            let now = now_ms();
            let updated = tx.execute(
                "UPDATE tasks SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, &task.id],
            )?;

            if updated == 0 {
                // Lost the row between SELECT and UPDATE; the write lock makes this unreachable
                return Ok(None);
            }

            tx.commit()?;

            Ok(Some(Task {
                status: TaskStatus::Running,
                started_at: Some(now),
                ..task
            }))
        })
    }

    /// Record the outcome of a running task.
    ///
    /// Fails with `InvalidTransition` (state unchanged) if the task is not
    /// currently `running`.
    pub fn complete(
        &self,
        task_id: &str,
        outcome: Outcome,
        usage: Option<TokenUsage>,
        error: Option<&str>,
    ) -> QueueResult<Task> {
        let next = outcome.status();

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let task = check_transition(&tx, task_id, next)?;

            let now = now_ms();
            let input_tokens = usage.map(|u| u.input_tokens as i64);
            let output_tokens = usage.map(|u| u.output_tokens as i64);

            tx.execute(
                "UPDATE tasks SET status = ?1, completed_at = ?2, input_tokens = ?3,
                 output_tokens = ?4, error = ?5
                 WHERE id = ?6 AND status = 'running'",
                params![
                    next.as_str(),
                    now,
                    input_tokens,
                    output_tokens,
                    error,
                    task_id
                ],
            )?;

            tx.commit()?;

            Ok(Task {
                status: next,
                completed_at: Some(now),
                input_tokens: usage.map(|u| u.input_tokens),
                output_tokens: usage.map(|u| u.output_tokens),
                error: error.map(str::to_string),
                ..task
            })
        })
    }

    /// Cancel a task that has not been claimed yet. A cancelled task never
    /// ran, so `started_at` and `completed_at` stay null.
    pub fn cancel_pending(&self, task_id: &str) -> QueueResult<Task> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let task = check_transition(&tx, task_id, TaskStatus::Cancelled)?;

            tx.execute(
                "UPDATE tasks SET status = 'cancelled' WHERE id = ?1 AND status = 'pending'",
                params![task_id],
            )?;

            tx.commit()?;

            Ok(Task {
                status: TaskStatus::Cancelled,
                ..task
            })
        })
    }

    /// Cancel every pending task. Returns the number cancelled.
    pub fn cancel_all_pending(&self) -> QueueResult<u64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let cancelled =
                tx.execute("UPDATE tasks SET status = 'cancelled' WHERE status = 'pending'", [])?;
            tx.commit()?;
            Ok(cancelled as u64)
        })
    }

    /// Get a task by id.
    pub fn get_task(&self, task_id: &str) -> QueueResult<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// List tasks matching `filter`, oldest first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>> {
        self.with_conn(|conn| {
            let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1");
            let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(status) = filter.status {
                params_vec.push(Box::new(status.as_str()));
                sql.push_str(&format!(" AND status = ?{}", params_vec.len()));
            }

            if let Some(depth) = filter.depth {
                params_vec.push(Box::new(depth));
                sql.push_str(&format!(" AND depth = ?{}", params_vec.len()));
            }

            if let Some(parent) = filter.parent_task_id.as_deref() {
                params_vec.push(Box::new(parent.to_string()));
                sql.push_str(&format!(" AND parent_task_id = ?{}", params_vec.len()));
            }

            sql.push_str(" ORDER BY created_at ASC, seq ASC");

            if let Some(limit) = filter.limit {
                params_vec.push(Box::new(limit));
                sql.push_str(&format!(" LIMIT ?{}", params_vec.len()));
            }

            let params_refs: Vec<&dyn rusqlite::ToSql> =
                params_vec.iter().map(|b| b.as_ref()).collect();

            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params_refs.as_slice(), parse_task_row)?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(tasks)
        })
    }

    /// Direct children of a task.
    pub fn get_children(&self, parent_task_id: &str) -> QueueResult<Vec<Task>> {
        self.list_tasks(&TaskFilter {
            parent_task_id: Some(parent_task_id.to_string()),
            ..Default::default()
        })
    }

    /// Delete every task. Returns the number of rows removed.
    pub fn reset(&self) -> QueueResult<u64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let deleted = tx.execute("DELETE FROM tasks", [])?;
            tx.commit()?;
            Ok(deleted as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn enqueue_then_get_round_trips_payload() {
        let db = setup_db();
        let new = NewTask::root("write overview", "docs/overview")
            .with_context(json!({"repo": "billing", "files": ["a.rs"]}));

        let id = db.enqueue(&new, 5).unwrap();
        let task = db.get_task(&id).unwrap().unwrap();

        assert_eq!(task.prompt, "write overview");
        assert_eq!(task.output_path, "docs/overview");
        assert_eq!(task.context, Some(json!({"repo": "billing", "files": ["a.rs"]})));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.depth, 0);
        assert!(task.completed_at.is_none());
        assert!(task.started_at.is_none());
    }

    #[test]
    fn enqueue_rejects_unknown_parent() {
        let db = setup_db();
        let new = NewTask {
            parent_task_id: Some("missing".into()),
            depth: 1,
            ..NewTask::root("child", "docs")
        };

        let err = db.enqueue(&new, 5).unwrap_err();
        assert!(matches!(err, QueueError::TaskNotFound(ref id) if id == "missing"));
    }

    #[test]
    fn enqueue_rejects_depth_out_of_step_with_parent() {
        let db = setup_db();
        let parent = db.enqueue(&NewTask::root("root", "docs"), 5).unwrap();
        let new = NewTask {
            parent_task_id: Some(parent),
            depth: 3,
            ..NewTask::root("child", "docs")
        };

        let err = db.enqueue(&new, 5).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InconsistentDepth {
                depth: 3,
                parent_depth: 0,
                ..
            }
        ));
    }

    #[test]
    fn enqueue_many_is_all_or_nothing() {
        let db = setup_db();
        let batch = vec![
            NewTask::root("a", "docs"),
            NewTask {
                depth: 9,
                ..NewTask::root("too deep", "docs")
            },
        ];

        assert!(db.enqueue_many(&batch, 5).is_err());
        assert!(db.list_tasks(&TaskFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn complete_records_usage_and_error() {
        let db = setup_db();
        let id = db.enqueue(&NewTask::root("a", "docs"), 5).unwrap();
        db.claim_next().unwrap().unwrap();

        let done = db
            .complete(&id, Outcome::Failed, Some(TokenUsage::new(10, 4)), Some("boom"))
            .unwrap();
        assert_eq!(done.status, TaskStatus::Failed);

        let stored = db.get_task(&id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.usage(), Some(TokenUsage::new(10, 4)));
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn complete_pending_task_is_invalid_transition() {
        let db = setup_db();
        let id = db.enqueue(&NewTask::root("a", "docs"), 5).unwrap();

        let err = db.complete(&id, Outcome::Completed, None, None).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed,
                ..
            }
        ));
        assert_eq!(
            db.get_task(&id).unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }

    #[test]
    fn complete_unknown_task_is_not_found() {
        let db = setup_db();
        let err = db.complete("nope", Outcome::Completed, None, None).unwrap_err();
        assert!(matches!(err, QueueError::TaskNotFound(_)));
    }

    #[test]
    fn list_filters_by_parent() {
        let db = setup_db();
        let root = db.enqueue(&NewTask::root("root", "docs"), 5).unwrap();
        let child = NewTask {
            depth: 1,
            parent_task_id: Some(root.clone()),
            ..NewTask::root("child", "docs/a")
        };
        let child_id = db.enqueue(&child, 5).unwrap();
        db.enqueue(&NewTask::root("other root", "docs"), 5).unwrap();

        let children = db.get_children(&root).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child_id);
    }

    #[test]
    fn list_honors_limit() {
        let db = setup_db();
        for i in 0..4 {
            db.enqueue(&NewTask::root(format!("t{i}"), "docs"), 5).unwrap();
        }
        let filter = TaskFilter {
            limit: Some(2),
            ..Default::default()
        };
        let tasks = db.list_tasks(&filter).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].prompt, "t0");
        assert_eq!(tasks[1].prompt, "t1");
    }

    #[test]
    fn cancel_all_pending_leaves_running_alone() {
        let db = setup_db();
        let running = db.enqueue(&NewTask::root("a", "docs"), 5).unwrap();
        db.enqueue(&NewTask::root("b", "docs"), 5).unwrap();
        db.enqueue(&NewTask::root("c", "docs"), 5).unwrap();
        db.claim_next().unwrap();

        assert_eq!(db.cancel_all_pending().unwrap(), 2);
        assert_eq!(
            db.get_task(&running).unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[test]
    fn cancelled_tasks_have_no_timestamps() {
        let db = setup_db();
        let one = db.enqueue(&NewTask::root("a", "docs"), 5).unwrap();
        let other = db.enqueue(&NewTask::root("b", "docs"), 5).unwrap();

        let returned = db.cancel_pending(&one).unwrap();
        assert!(returned.completed_at.is_none());
        db.cancel_all_pending().unwrap();

        for id in [&one, &other] {
            let task = db.get_task(id).unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Cancelled);
            assert!(task.started_at.is_none());
            assert!(task.completed_at.is_none());
        }
    }
}
