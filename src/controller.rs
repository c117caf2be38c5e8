//! Queue controller: the facade the CLI drives.
//!
//! Owns at most one active run (a worker pool plus its completion watcher)
//! and exposes the read-side and operator operations on the store.

use crate::capability::Capability;
use crate::config::Config;
use crate::db::Database;
use crate::error::{QueueError, QueueResult};
use crate::executor::{ExecutionLimits, TaskExecutor};
use crate::types::{NewTask, SeedTask, StatusCounts, Task, TaskFilter, UsageTotals};
use crate::watcher::{CompletionWatcher, WatcherSettings, WatcherState};
use crate::worker::{PoolSettings, WorkerPool, WorkerStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How `start` treats existing state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Skip seeding if the store already holds tasks.
    pub resume: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartReport {
    pub seeded: Vec<String>,
    pub resumed: bool,
}

/// Why [`QueueController::wait_drained`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    Drained,
    Stopped,
}

/// Point-in-time view of the queue and the active run.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub counts: StatusCounts,
    pub by_depth: BTreeMap<u32, u64>,
    pub usage: UsageTotals,
    pub running: bool,
    pub workers: Vec<WorkerStatus>,
    pub watcher: WatcherState,
    pub processed: u64,
    pub finalization_task: Option<String>,
    pub orphans: Vec<String>,
}

struct ActiveRun {
    pool: WorkerPool,
    watcher: Arc<CompletionWatcher>,
    watcher_handle: JoinHandle<()>,
}

pub struct QueueController {
    db: Database,
    config: Config,
    run: Mutex<Option<ActiveRun>>,
}

impl QueueController {
    pub fn new(db: Database, config: Config) -> Self {
        Self {
            db,
            config,
            run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.active().is_some()
    }

    /// Seed root tasks and start the worker pool and completion watcher.
    /// Must be called from within a tokio runtime.
    ///
    /// With `resume`, a store that already holds tasks is picked up as is
    /// and `seeds` are ignored. Seeds are enqueued all or nothing.
    pub fn start(
        &self,
        seeds: Vec<SeedTask>,
        options: StartOptions,
        capability: Arc<dyn Capability>,
    ) -> QueueResult<StartReport> {
        let mut run = self.active();
        if run.is_some() {
            return Err(QueueError::RunActive);
        }

        let existing = self.db.counts_by_status()?;
        let resumed = options.resume && existing.total() > 0;

        let seeded = if resumed {
            if !seeds.is_empty() {
                warn!(
                    seeds = seeds.len(),
                    "Store already holds tasks; ignoring seeds on resume"
                );
            }
            info!(
                pending = existing.pending,
                running = existing.running,
                "Resuming existing queue"
            );
            if existing.running > 0 {
                warn!(
                    running = existing.running,
                    "Tasks left running by a previous run will be reported as orphans once stale"
                );
            }
            Vec::new()
        } else {
            let tasks: Vec<NewTask> = seeds.into_iter().map(NewTask::from).collect();
            let ids = self.db.enqueue_many(&tasks, self.config.queue.max_depth)?;
            info!(seeded = ids.len(), "Seeded root tasks");
            ids
        };

        let executor = Arc::new(TaskExecutor::new(
            self.db.clone(),
            capability,
            ExecutionLimits::from_config(&self.config),
        ));
        let pool = WorkerPool::start(
            self.db.clone(),
            executor,
            PoolSettings::from_config(&self.config.queue),
        );

        let watcher = Arc::new(CompletionWatcher::new(
            self.db.clone(),
            WatcherSettings {
                poll_interval: self.config.queue.watcher_poll(),
                stale_threshold: self.config.queue.stale_threshold(),
                finalization: self.config.finalization.clone(),
            },
            pool.processed_counter(),
        ));
        let watcher_handle = watcher.spawn(pool.subscribe_stop());

        *run = Some(ActiveRun {
            pool,
            watcher,
            watcher_handle,
        });

        Ok(StartReport { seeded, resumed })
    }

    /// Wait until the watcher reports the queue drained or the pool stops
    /// (for example after a fatal store error).
    pub async fn wait_drained(&self) -> QueueResult<RunEnd> {
        let (mut drained, mut stopped) = {
            let run = self.active();
            let run = run.as_ref().ok_or(QueueError::NotRunning)?;
            (run.watcher.subscribe_drained(), run.pool.subscribe_stop())
        };

        let drained = async move { drained.wait_for(|d| *d).await.is_ok() };
        let stopped = async move {
            let _ = stopped.wait_for(|s| *s).await;
        };

        tokio::select! {
            ok = drained => Ok(if ok { RunEnd::Drained } else { RunEnd::Stopped }),
            _ = stopped => Ok(RunEnd::Stopped),
        }
    }

    /// Drain the active run: workers finish their current tasks and exit.
    /// Returns the fatal store error, if one ended the run.
    pub async fn stop(&self) -> QueueResult<()> {
        let run = self.active().take().ok_or(QueueError::NotRunning)?;

        let result = run.pool.stop().await;
        if let Err(e) = run.watcher_handle.await {
            error!("Completion watcher panicked: {}", e);
        }

        info!(watcher = %run.watcher.state(), "Run stopped");
        result
    }

    pub fn status(&self) -> QueueResult<QueueStatus> {
        let counts = self.db.counts_by_status()?;
        let by_depth = self.db.counts_by_depth()?;
        let usage = self.db.usage_totals()?;
        let orphans = self.orphaned_tasks()?.into_iter().map(|t| t.id).collect();

        let run = self.active();
        let (workers, watcher, processed, finalization_task) = match run.as_ref() {
            Some(run) => (
                run.pool.workers(),
                run.watcher.state(),
                run.pool.processed(),
                run.watcher.finalization_task(),
            ),
            None => (Vec::new(), WatcherState::Idle, 0, None),
        };

        Ok(QueueStatus {
            counts,
            by_depth,
            usage,
            running: run.is_some(),
            workers,
            watcher,
            processed,
            finalization_task,
            orphans,
        })
    }

    pub fn list_tasks(&self, filter: &TaskFilter) -> QueueResult<Vec<Task>> {
        self.db.list_tasks(filter)
    }

    pub fn get_task(&self, task_id: &str) -> QueueResult<Task> {
        self.db
            .get_task(task_id)?
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))
    }

    /// Cancel one pending task.
    pub fn cancel(&self, task_id: &str) -> QueueResult<Task> {
        let task = self.db.cancel_pending(task_id)?;
        info!(task_id = %task_id, "Cancelled task");
        Ok(task)
    }

    pub fn cancel_all_pending(&self) -> QueueResult<u64> {
        let cancelled = self.db.cancel_all_pending()?;
        info!(cancelled, "Cancelled pending tasks");
        Ok(cancelled)
    }

    /// Running tasks older than the stale threshold.
    pub fn orphaned_tasks(&self) -> QueueResult<Vec<Task>> {
        self.db
            .stale_running_tasks(self.config.queue.stale_threshold().as_millis() as i64)
    }

    /// Delete every task. Refused while a run is active.
    pub fn reset(&self) -> QueueResult<u64> {
        let run = self.active();
        if run.is_some() {
            return Err(QueueError::RunActive);
        }
        let deleted = self.db.reset()?;
        warn!(deleted, "Task store reset");
        Ok(deleted)
    }
}
