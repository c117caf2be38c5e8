//! Runs one claimed task through the capability and records its outcome.

use crate::capability::{Capability, CapabilityOutput, CapabilityRequest, SpawnHandle};
use crate::config::Config;
use crate::db::Database;
use crate::error::{CapabilityFailure, QueueError, QueueResult};
use crate::types::{Outcome, SpawnRequest, Task, TokenUsage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, info, info_span, warn};

/// Limits applied to every capability run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub max_depth: u32,
    pub timeout: Duration,
    pub max_steps: u32,
    /// Pause between attempts to record an outcome after a store error.
    pub store_backoff: Duration,
    /// Attempts to record an outcome before the store error is returned.
    pub max_store_errors: u32,
}

impl ExecutionLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_depth: config.queue.max_depth,
            timeout: config.capability.timeout(),
            max_steps: config.capability.max_steps,
            store_backoff: config.queue.claim_backoff(),
            max_store_errors: config.queue.max_store_errors,
        }
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What happened to one task.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub task_id: String,
    pub outcome: Outcome,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
    /// Children enqueued while running and after the run finished.
    pub spawned: Vec<String>,
    /// False when the store refused the outcome (the task was no longer running).
    pub recorded: bool,
    pub duration: Duration,
}

/// Executes claimed tasks. Shared by every worker in a pool.
pub struct TaskExecutor {
    db: Database,
    capability: Arc<dyn Capability>,
    limits: ExecutionLimits,
}

impl TaskExecutor {
    pub fn new(db: Database, capability: Arc<dyn Capability>, limits: ExecutionLimits) -> Self {
        Self {
            db,
            capability,
            limits,
        }
    }

    /// Run `task` (which must already be `running`) to completion or failure.
    ///
    /// Capability failures and transition conflicts are recorded or logged
    /// and still produce a report. A store failure is returned only once
    /// recording the outcome has failed `max_store_errors` times in a row.
    pub async fn execute(&self, task: &Task) -> QueueResult<ExecutionReport> {
        let span = info_span!("task", task_id = %task.id, depth = task.depth);
        self.run(task).instrument(span).await
    }

    async fn run(&self, task: &Task) -> QueueResult<ExecutionReport> {
        let started = Instant::now();
        let spawner = SpawnHandle::new(self.db.clone(), task, self.limits.max_depth);
        let request = CapabilityRequest::for_task(task, self.limits.max_steps);

        debug!(output_path = %task.output_path, "Executing task");

        let result = match tokio::time::timeout(
            self.limits.timeout,
            self.capability.execute(&request, &spawner),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CapabilityFailure::Timeout(self.limits.timeout)),
        };

        let (outcome, usage, error) = match result.and_then(|output| self.check_steps(output)) {
            Ok(output) => match self.spawn_trailing(&spawner, output.spawn) {
                Ok(()) => (Outcome::Completed, Some(output.usage), None),
                Err(e) => {
                    warn!(error_code = ?e.code(), "Task failed while spawning children: {}", e);
                    let error = format!("spawning children failed: {e}");
                    (Outcome::Failed, Some(output.usage), Some(error))
                }
            },
            Err(failure) => {
                warn!("Task failed: {}", failure);
                (Outcome::Failed, None, Some(failure.to_string()))
            }
        };

        let recorded = self
            .record(&task.id, outcome, usage, error.as_deref())
            .await?;

        let duration = started.elapsed();
        let spawned = spawner.spawned();
        info!(
            outcome = ?outcome,
            spawned = spawned.len(),
            duration_ms = duration.as_millis() as u64,
            "Task finished"
        );

        Ok(ExecutionReport {
            task_id: task.id.clone(),
            outcome,
            usage,
            error,
            spawned,
            recorded,
            duration,
        })
    }

    /// Write the outcome, retrying store errors so the task does not stay
    /// `running` after its worker moves on. Returns false on a transition
    /// conflict.
    async fn record(
        &self,
        task_id: &str,
        outcome: Outcome,
        usage: Option<TokenUsage>,
        error: Option<&str>,
    ) -> QueueResult<bool> {
        let mut attempt = 0;
        loop {
            match self.db.complete(task_id, outcome, usage, error) {
                Ok(_) => return Ok(true),
                Err(e) if e.is_state_conflict() => {
                    warn!(error_code = ?e.code(), "Outcome not recorded: {}", e);
                    return Ok(false);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.limits.max_store_errors {
                        return Err(e);
                    }
                    warn!(
                        error_code = ?e.code(),
                        attempt,
                        "Recording outcome failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(self.limits.store_backoff).await;
                }
            }
        }
    }

    fn check_steps(&self, output: CapabilityOutput) -> Result<CapabilityOutput, CapabilityFailure> {
        if output.steps > self.limits.max_steps {
            return Err(CapabilityFailure::StepLimitExceeded {
                max_steps: self.limits.max_steps,
            });
        }
        Ok(output)
    }

    /// Enqueue spawn requests returned with the output. Depth rejections are
    /// suppressed; the parent still completes.
    fn spawn_trailing(
        &self,
        spawner: &SpawnHandle,
        requests: Vec<SpawnRequest>,
    ) -> QueueResult<()> {
        for request in requests {
            match spawner.spawn(request) {
                Ok(_) => {}
                Err(e @ QueueError::DepthExceeded { .. }) => {
                    warn!(error_code = ?e.code(), "Suppressed spawn request: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
