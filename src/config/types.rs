//! Configuration types and structures.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::merge::merge_tier;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub capability: CapabilityConfig,

    #[serde(default)]
    pub finalization: FinalizationConfig,
}

/// Where the task store lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".doc-spawner/tasks.db")
}

/// Worker pool and watcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent worker loops.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Deepest allowed task depth (roots are depth 0).
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Sleep between claim attempts when the queue is empty.
    #[serde(default = "default_claim_backoff_ms")]
    pub claim_backoff_ms: u64,

    /// Interval between completion watcher polls.
    #[serde(default = "default_watcher_poll_ms")]
    pub watcher_poll_ms: u64,

    /// A running task older than this is reported as orphaned.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_seconds: u64,

    /// Consecutive store errors a worker tolerates before the run is aborted.
    #[serde(default = "default_max_store_errors")]
    pub max_store_errors: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            max_depth: default_max_depth(),
            claim_backoff_ms: default_claim_backoff_ms(),
            watcher_poll_ms: default_watcher_poll_ms(),
            stale_threshold_seconds: default_stale_threshold(),
            max_store_errors: default_max_store_errors(),
        }
    }
}

impl QueueConfig {
    pub fn claim_backoff(&self) -> Duration {
        Duration::from_millis(self.claim_backoff_ms)
    }

    pub fn watcher_poll(&self) -> Duration {
        Duration::from_millis(self.watcher_poll_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_seconds)
    }
}

fn default_num_workers() -> usize {
    3
}

fn default_max_depth() -> u32 {
    5
}

fn default_claim_backoff_ms() -> u64 {
    3_000
}

fn default_watcher_poll_ms() -> u64 {
    10_000
}

fn default_stale_threshold() -> u64 {
    1_800 // 30 minutes
}

fn default_max_store_errors() -> u32 {
    3
}

/// The external agent command and the limits imposed on each run of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Program and arguments. Empty means no capability is configured.
    #[serde(default)]
    pub command: Vec<String>,

    /// Working directory for the command (default: current directory).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Wall-clock limit for one task.
    #[serde(default = "default_capability_timeout")]
    pub timeout_seconds: u64,

    /// Maximum internal steps one task may take.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            working_dir: None,
            timeout_seconds: default_capability_timeout(),
            max_steps: default_max_steps(),
        }
    }
}

impl CapabilityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_capability_timeout() -> u64 {
    1_800
}

fn default_max_steps() -> u32 {
    200
}

/// The one-time task enqueued when the queue first drains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_finalization_prompt")]
    pub prompt: String,

    #[serde(default = "default_finalization_output")]
    pub output_path: String,

    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prompt: default_finalization_prompt(),
            output_path: default_finalization_output(),
            context: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_finalization_prompt() -> String {
    "All documentation tasks have finished. Build the top-level index and cross-links \
     for everything written under the output directory."
        .to_string()
}

fn default_finalization_output() -> String {
    "docs".to_string()
}

impl Config {
    /// Load configuration from a single YAML file laid over the defaults.
    /// Unknown sections are an error.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let tier: serde_json::Value = serde_yaml::from_str(&content)?;
        let mut merged = serde_json::to_value(Config::default())?;
        merge_tier(&mut merged, tier)?;
        Ok(serde_json::from_value(merged)?)
    }

    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.queue.num_workers == 0 {
            return Err(anyhow!("queue.num_workers must be at least 1"));
        }
        if self.queue.claim_backoff_ms == 0 {
            return Err(anyhow!("queue.claim_backoff_ms must be greater than 0"));
        }
        if self.queue.watcher_poll_ms == 0 {
            return Err(anyhow!("queue.watcher_poll_ms must be greater than 0"));
        }
        if self.capability.timeout_seconds == 0 {
            return Err(anyhow!("capability.timeout_seconds must be greater than 0"));
        }
        Ok(())
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<()> {
        if let Some(parent) = self.store.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.queue.num_workers, 3);
        assert_eq!(config.queue.max_depth, 5);
        assert_eq!(config.queue.watcher_poll(), Duration::from_secs(10));
        assert!(config.capability.command.is_empty());
        assert!(config.finalization.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let config: Config = serde_yaml::from_str(
            r#"
queue:
  num_workers: 8
capability:
  command: ["agent", "--json"]
"#,
        )
        .unwrap();
        assert_eq!(config.queue.num_workers, 8);
        assert_eq!(config.queue.max_depth, 5);
        assert_eq!(config.capability.command, vec!["agent", "--json"]);
        assert_eq!(config.capability.max_steps, 200);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut config = Config::default();
        config.queue.num_workers = 0;
        assert!(config.validate().is_err());
    }
}
