//! Completion watcher: detects quiescence and enqueues one finalization task.
//!
//! Detection is a periodic aggregate query, so latency is bounded by the poll
//! interval. Whether the finalization task has fired is tracked here, never
//! derived from the store, so later quiescent polls cannot fire it again.
//! Each poll also sweeps for tasks stuck in `running` past the stale
//! threshold and reports them once. They are flagged, never auto-failed.

use crate::config::FinalizationConfig;
use crate::db::{Database, now_ms};
use crate::error::{QueueError, QueueResult};
use crate::types::{NewTask, StatusCounts, Task};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Watcher lifecycle. `Triggered` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Idle,
    Watching,
    Triggered,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatcherState::Idle => "idle",
            WatcherState::Watching => "watching",
            WatcherState::Triggered => "triggered",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub poll_interval: Duration,
    pub stale_threshold: Duration,
    pub finalization: FinalizationConfig,
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollReport {
    pub counts: StatusCounts,
    pub state: WatcherState,
    /// Set on the one poll that enqueued the finalization task.
    pub fired: Option<String>,
    /// Orphans first seen on this poll.
    pub new_orphans: Vec<String>,
    pub drained: bool,
}

pub struct CompletionWatcher {
    db: Database,
    settings: WatcherSettings,
    processed: Arc<AtomicU64>,
    state: Mutex<WatcherState>,
    finalization_task: Mutex<Option<String>>,
    reported_orphans: Mutex<HashSet<String>>,
    drained: watch::Sender<bool>,
}

impl CompletionWatcher {
    /// `processed` is the pool-wide count of executed tasks.
    pub fn new(db: Database, settings: WatcherSettings, processed: Arc<AtomicU64>) -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            db,
            settings,
            processed,
            state: Mutex::new(WatcherState::Idle),
            finalization_task: Mutex::new(None),
            reported_orphans: Mutex::new(HashSet::new()),
            drained,
        }
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WatcherState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Id of the finalization task, once fired.
    pub fn finalization_task(&self) -> Option<String> {
        self.finalization_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Becomes `true` once, when the store is quiescent after the watcher fired.
    pub fn subscribe_drained(&self) -> watch::Receiver<bool> {
        self.drained.subscribe()
    }

    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }

    /// Move from `Idle` to `Watching`. Has no effect in any other state.
    pub fn arm(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == WatcherState::Idle {
            *state = WatcherState::Watching;
        }
    }

    /// Arm the watcher and poll on an interval until `shutdown` fires.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        self.arm();
        let watcher = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(watcher.settings.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                if *shutdown.borrow() {
                    break;
                }

                if let Err(e) = watcher.poll_once() {
                    warn!(error_code = ?e.code(), "Completion watcher poll failed: {}", e);
                }
            }

            debug!("Completion watcher stopped");
        })
    }

    /// One observation: sweep orphans, then advance the state machine.
    pub fn poll_once(&self) -> QueueResult<PollReport> {
        let counts = self.db.counts_by_status()?;
        let new_orphans = self.sweep_orphans()?;
        let mut fired = None;

        match self.state() {
            WatcherState::Idle => {}
            WatcherState::Watching => {
                if counts.is_quiescent() && self.has_work_history(&counts) {
                    fired = self.fire()?;
                    self.set_state(WatcherState::Triggered);
                    if fired.is_none() {
                        self.mark_drained();
                    }
                }
            }
            WatcherState::Triggered => {
                if counts.is_quiescent() {
                    self.mark_drained();
                }
            }
        }

        Ok(PollReport {
            counts,
            state: self.state(),
            fired,
            new_orphans,
            drained: self.is_drained(),
        })
    }

    /// Guards against firing on a store nobody has seeded yet. Any terminal
    /// task counts, so resuming a store that holds only cancelled work drains.
    fn has_work_history(&self, counts: &StatusCounts) -> bool {
        self.processed.load(Ordering::SeqCst) > 0
            || counts.completed + counts.failed + counts.cancelled > 0
    }

    fn fire(&self) -> QueueResult<Option<String>> {
        let finalization = &self.settings.finalization;
        if !finalization.enabled {
            info!("Queue drained; finalization disabled");
            return Ok(None);
        }

        let mut task = NewTask::root(finalization.prompt.clone(), finalization.output_path.clone());
        task.context = finalization.context.clone();

        // Root depth always passes the limit check
        let task_id = self.db.enqueue(&task, 0)?;
        info!(task_id = %task_id, "Queue drained; enqueued finalization task");

        *self
            .finalization_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task_id.clone());
        Ok(Some(task_id))
    }

    fn mark_drained(&self) {
        self.drained.send_if_modified(|drained| {
            if *drained {
                return false;
            }
            *drained = true;
            info!("All work finished");
            true
        });
    }

    /// Running tasks past the stale threshold, as of now.
    pub fn orphaned_tasks(&self) -> QueueResult<Vec<Task>> {
        self.db
            .stale_running_tasks(self.settings.stale_threshold.as_millis() as i64)
    }

    fn sweep_orphans(&self) -> QueueResult<Vec<String>> {
        let stale = self.orphaned_tasks()?;
        let mut reported = self
            .reported_orphans
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let now = now_ms();
        let mut new_orphans = Vec::new();
        for task in stale {
            if !reported.insert(task.id.clone()) {
                continue;
            }
            let running_for_secs = (now - task.started_at.unwrap_or(now)) / 1000;
            let err = QueueError::OrphanedTask {
                task_id: task.id.clone(),
                running_for_secs,
            };
            warn!(task_id = %task.id, error_code = ?err.code(), "{}", err);
            new_orphans.push(task.id);
        }

        Ok(new_orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Outcome, TaskStatus};

    fn settings(enabled: bool) -> WatcherSettings {
        WatcherSettings {
            poll_interval: Duration::from_millis(10),
            stale_threshold: Duration::from_secs(3600),
            finalization: FinalizationConfig {
                enabled,
                ..FinalizationConfig::default()
            },
        }
    }

    fn run_one(db: &Database, processed: &AtomicU64) {
        let task = db.claim_next().unwrap().unwrap();
        db.complete(&task.id, Outcome::Completed, None, None).unwrap();
        processed.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn idle_watcher_never_fires() {
        let db = Database::open_in_memory().unwrap();
        let processed = Arc::new(AtomicU64::new(1));
        let watcher = CompletionWatcher::new(db.clone(), settings(true), processed);

        let report = watcher.poll_once().unwrap();
        assert_eq!(report.state, WatcherState::Idle);
        assert!(report.fired.is_none());
    }

    #[test]
    fn empty_store_does_not_fire() {
        let db = Database::open_in_memory().unwrap();
        let watcher =
            CompletionWatcher::new(db.clone(), settings(true), Arc::new(AtomicU64::new(0)));
        watcher.arm();

        let report = watcher.poll_once().unwrap();
        assert_eq!(report.state, WatcherState::Watching);
        assert_eq!(db.counts_by_status().unwrap().total(), 0);
    }

    #[test]
    fn fires_exactly_once_then_drains() {
        let db = Database::open_in_memory().unwrap();
        let processed = Arc::new(AtomicU64::new(0));
        let watcher = CompletionWatcher::new(db.clone(), settings(true), Arc::clone(&processed));
        watcher.arm();

        db.enqueue(&NewTask::root("work", "docs"), 5).unwrap();
        assert!(watcher.poll_once().unwrap().fired.is_none());

        run_one(&db, &processed);
        let report = watcher.poll_once().unwrap();
        let final_id = report.fired.expect("finalization should fire");
        assert_eq!(report.state, WatcherState::Triggered);
        assert!(!report.drained);

        let final_task = db.get_task(&final_id).unwrap().unwrap();
        assert_eq!(final_task.depth, 0);
        assert!(final_task.parent_task_id.is_none());

        run_one(&db, &processed);
        for _ in 0..3 {
            let report = watcher.poll_once().unwrap();
            assert!(report.fired.is_none());
            assert!(report.drained);
        }

        assert_eq!(db.counts_by_status().unwrap().total(), 2);
        assert_eq!(watcher.finalization_task(), Some(final_id));
    }

    #[test]
    fn disabled_finalization_drains_without_enqueueing() {
        let db = Database::open_in_memory().unwrap();
        let processed = Arc::new(AtomicU64::new(0));
        let watcher = CompletionWatcher::new(db.clone(), settings(false), Arc::clone(&processed));
        watcher.arm();

        db.enqueue(&NewTask::root("work", "docs"), 5).unwrap();
        run_one(&db, &processed);

        let report = watcher.poll_once().unwrap();
        assert_eq!(report.state, WatcherState::Triggered);
        assert!(report.drained);
        assert_eq!(db.counts_by_status().unwrap().total(), 1);
    }

    #[test]
    fn resumed_store_with_only_cancelled_work_fires() {
        let db = Database::open_in_memory().unwrap();
        let id = db.enqueue(&NewTask::root("dropped", "docs"), 5).unwrap();
        db.cancel_pending(&id).unwrap();

        let watcher =
            CompletionWatcher::new(db.clone(), settings(false), Arc::new(AtomicU64::new(0)));
        watcher.arm();

        let report = watcher.poll_once().unwrap();
        assert_eq!(report.state, WatcherState::Triggered);
        assert!(report.drained);
    }

    #[test]
    fn orphans_are_reported_once() {
        let db = Database::open_in_memory().unwrap();
        let watcher = CompletionWatcher::new(
            db.clone(),
            WatcherSettings {
                stale_threshold: Duration::ZERO,
                ..settings(true)
            },
            Arc::new(AtomicU64::new(0)),
        );
        watcher.arm();

        db.enqueue(&NewTask::root("stuck", "docs"), 5).unwrap();
        let task = db.claim_next().unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(watcher.poll_once().unwrap().new_orphans, vec![task.id.clone()]);
        assert!(watcher.poll_once().unwrap().new_orphans.is_empty());

        // Flagged, not failed
        let stored = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_shutdown() {
        let db = Database::open_in_memory().unwrap();
        let watcher = Arc::new(CompletionWatcher::new(
            db,
            settings(true),
            Arc::new(AtomicU64::new(0)),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = watcher.spawn(rx);
        assert_eq!(watcher.state(), WatcherState::Watching);

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }
}
