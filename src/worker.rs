//! Worker pool: N independent claim-execute loops against the shared store.
//!
//! Workers never talk to each other. The store's atomic claim is the only
//! coordination. A stop request lets each worker finish the task it holds
//! and then exit; in-flight work is never aborted from here.

use crate::config::QueueConfig;
use crate::db::Database;
use crate::error::{QueueError, QueueResult};
use crate::executor::TaskExecutor;
use petname::{Generator, Petnames};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Pool sizing and retry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub num_workers: usize,
    /// Sleep after an empty claim or a store error.
    pub claim_backoff: Duration,
    /// Consecutive store errors one worker tolerates before the run is aborted.
    pub max_store_errors: u32,
}

impl PoolSettings {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            num_workers: config.num_workers,
            claim_backoff: config.claim_backoff(),
            max_store_errors: config.max_store_errors,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// Liveness snapshot for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub id: String,
    pub alive: bool,
    pub current_task: Option<String>,
    pub processed: u64,
}

struct WorkerState {
    id: String,
    alive: AtomicBool,
    current_task: Mutex<Option<String>>,
    processed: AtomicU64,
}

impl WorkerState {
    fn new(id: String) -> Self {
        Self {
            id,
            alive: AtomicBool::new(false),
            current_task: Mutex::new(None),
            processed: AtomicU64::new(0),
        }
    }

    fn set_current(&self, task_id: Option<String>) {
        *self
            .current_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = task_id;
    }

    fn snapshot(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id.clone(),
            alive: self.alive.load(Ordering::SeqCst),
            current_task: self
                .current_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            processed: self.processed.load(Ordering::SeqCst),
        }
    }
}

/// Everything a worker loop shares with the pool.
#[derive(Clone)]
struct Shared {
    db: Database,
    executor: Arc<TaskExecutor>,
    settings: PoolSettings,
    processed: Arc<AtomicU64>,
    shutdown: Arc<watch::Sender<bool>>,
    fatal: Arc<Mutex<Option<QueueError>>>,
}

impl Shared {
    /// Record a store error. Returns true when the worker should give up,
    /// in which case the whole pool has been told to stop.
    fn store_error(&self, consecutive: &mut u32, err: QueueError) -> bool {
        *consecutive += 1;
        if *consecutive < self.settings.max_store_errors {
            warn!(
                error_code = ?err.code(),
                attempt = *consecutive,
                "Store error, retrying after backoff: {}",
                err
            );
            return false;
        }

        error!(
            error_code = ?err.code(),
            "Giving up after {} consecutive store errors: {}",
            consecutive,
            err
        );
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(err);
        }
        drop(fatal);
        self.shutdown.send_replace(true);
        true
    }
}

/// A running pool of worker loops.
pub struct WorkerPool {
    shared: Shared,
    workers: Vec<Arc<WorkerState>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `settings.num_workers` loops on the current tokio runtime.
    pub fn start(db: Database, executor: Arc<TaskExecutor>, settings: PoolSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        let shared = Shared {
            db,
            executor,
            settings,
            processed: Arc::new(AtomicU64::new(0)),
            shutdown: Arc::new(shutdown),
            fatal: Arc::new(Mutex::new(None)),
        };

        let mut workers = Vec::with_capacity(settings.num_workers);
        let mut handles = Vec::with_capacity(settings.num_workers);

        for index in 0..settings.num_workers {
            let state = Arc::new(WorkerState::new(worker_id(index)));
            let span = info_span!("worker", worker = %state.id);
            let rx = shared.shutdown.subscribe();
            handles.push(tokio::spawn(
                run_worker(shared.clone(), Arc::clone(&state), rx).instrument(span),
            ));
            workers.push(state);
        }

        info!(workers = settings.num_workers, "Worker pool started");

        Self {
            shared,
            workers,
            handles,
        }
    }

    /// Liveness of every worker.
    pub fn workers(&self) -> Vec<WorkerStatus> {
        self.workers.iter().map(|w| w.snapshot()).collect()
    }

    /// Tasks processed by the whole pool since it started.
    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::SeqCst)
    }

    /// Shared handle on the pool-wide processed count.
    pub fn processed_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.shared.processed)
    }

    /// Fires `true` once the pool has been asked to stop, either by
    /// [`WorkerPool::signal_stop`] or by a fatal store error.
    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    /// Ask all workers to stop after their current task.
    pub fn signal_stop(&self) {
        self.shared.shutdown.send_replace(true);
    }

    /// Stop and wait for every worker to drain. Returns the fatal store
    /// error if one ended the run.
    pub async fn stop(self) -> QueueResult<()> {
        self.signal_stop();

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {}", e);
            }
        }

        info!(processed = self.shared.processed.load(Ordering::SeqCst), "Worker pool stopped");

        match self
            .shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn worker_id(index: usize) -> String {
    let name = Petnames::medium()
        .generate_one(2, "-")
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", name, index + 1)
}

async fn run_worker(shared: Shared, state: Arc<WorkerState>, mut shutdown: watch::Receiver<bool>) {
    state.alive.store(true, Ordering::SeqCst);
    debug!("Worker started");

    let backoff = shared.settings.claim_backoff;
    let mut store_errors = 0u32;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match shared.db.claim_next() {
            Ok(Some(task)) => {
                store_errors = 0;
                state.set_current(Some(task.id.clone()));
                let result = shared.executor.execute(&task).await;
                state.set_current(None);
                state.processed.fetch_add(1, Ordering::SeqCst);
                shared.processed.fetch_add(1, Ordering::SeqCst);

                if let Err(e) = result
                    && shared.store_error(&mut store_errors, e)
                {
                    break;
                }
            }
            Ok(None) => {
                store_errors = 0;
                if !wait_backoff(&mut shutdown, backoff).await {
                    break;
                }
            }
            Err(e) => {
                if shared.store_error(&mut store_errors, e) {
                    break;
                }
                if !wait_backoff(&mut shutdown, backoff).await {
                    break;
                }
            }
        }
    }

    state.alive.store(false, Ordering::SeqCst);
    debug!(processed = state.processed.load(Ordering::SeqCst), "Worker exited");
}

/// Sleep for `backoff`, waking early on a stop request. Returns false if the
/// pool itself has gone away.
async fn wait_backoff(shutdown: &mut watch::Receiver<bool>, backoff: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(backoff) => true,
        changed = shutdown.changed() => changed.is_ok(),
    }
}
