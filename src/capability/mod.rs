//! The capability boundary: whatever actually performs a task's work.
//!
//! The queue never interprets `prompt` or `context`. A capability receives
//! them, does its work under `output_path`, and may spawn child tasks while it
//! runs through the [`SpawnHandle`] it is given.

pub mod command;

use crate::db::Database;
use crate::error::{CapabilityFailure, QueueResult};
use crate::types::{NewTask, SpawnRequest, Task, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

pub use command::CommandCapability;

/// What a capability is asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub task_id: String,
    pub prompt: String,
    pub output_path: String,
    pub context: Option<Value>,
    pub depth: u32,
    pub max_steps: u32,
}

impl CapabilityRequest {
    pub fn for_task(task: &Task, max_steps: u32) -> Self {
        Self {
            task_id: task.id.clone(),
            prompt: task.prompt.clone(),
            output_path: task.output_path.clone(),
            context: task.context.clone(),
            depth: task.depth,
            max_steps,
        }
    }
}

/// Successful result of one capability run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    #[serde(default)]
    pub usage: TokenUsage,
    /// Internal steps the capability took.
    #[serde(default)]
    pub steps: u32,
    /// Children to spawn once the run has finished.
    #[serde(default)]
    pub spawn: Vec<SpawnRequest>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Performs the work a task describes.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn execute(
        &self,
        request: &CapabilityRequest,
        spawner: &SpawnHandle,
    ) -> Result<CapabilityOutput, CapabilityFailure>;
}

/// Lets a running task enqueue children, one level below itself.
///
/// Spawning is fire-and-forget: children become claimable immediately and
/// the parent's outcome never depends on them.
#[derive(Clone)]
pub struct SpawnHandle {
    db: Database,
    parent_id: String,
    parent_depth: u32,
    max_depth: u32,
    spawned: Arc<Mutex<Vec<String>>>,
}

impl SpawnHandle {
    pub fn new(db: Database, parent: &Task, max_depth: u32) -> Self {
        Self {
            db,
            parent_id: parent.id.clone(),
            parent_depth: parent.depth,
            max_depth,
            spawned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Depth any child spawned here will have.
    pub fn child_depth(&self) -> u32 {
        self.parent_depth + 1
    }

    /// Whether a spawn would pass the depth limit.
    pub fn can_spawn(&self) -> bool {
        self.child_depth() <= self.max_depth
    }

    /// Enqueue a child task. Depth rejections come back as
    /// `QueueError::DepthExceeded` and leave the store untouched.
    pub fn spawn(&self, request: SpawnRequest) -> QueueResult<String> {
        let task = NewTask {
            prompt: request.prompt,
            output_path: request.output_path,
            depth: self.child_depth(),
            parent_task_id: Some(self.parent_id.clone()),
            context: request.context,
        };

        let task_id = self.db.enqueue(&task, self.max_depth)?;
        debug!(
            parent_task_id = %self.parent_id,
            task_id = %task_id,
            depth = task.depth,
            "Spawned child task"
        );

        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task_id.clone());

        Ok(task_id)
    }

    /// Ids of the children spawned through this handle so far.
    pub fn spawned(&self) -> Vec<String> {
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;

    fn claimed(db: &Database, depth: u32) -> Task {
        let mut parent_id = None;
        for d in 0..=depth {
            let id = db
                .enqueue(
                    &NewTask {
                        depth: d,
                        parent_task_id: parent_id.clone(),
                        ..NewTask::root(format!("level {d}"), "docs")
                    },
                    10,
                )
                .unwrap();
            parent_id = Some(id);
        }
        let id = parent_id.unwrap();
        db.get_task(&id).unwrap().unwrap()
    }

    #[test]
    fn spawn_stamps_parent_and_depth() {
        let db = Database::open_in_memory().unwrap();
        let parent = claimed(&db, 1);
        let handle = SpawnHandle::new(db.clone(), &parent, 5);

        let child_id = handle.spawn(SpawnRequest::new("child", "docs/c")).unwrap();
        let child = db.get_task(&child_id).unwrap().unwrap();

        assert_eq!(child.depth, 2);
        assert_eq!(child.parent_task_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(handle.spawned(), vec![child_id]);
    }

    #[test]
    fn spawn_past_max_depth_is_rejected() {
        let db = Database::open_in_memory().unwrap();
        let parent = claimed(&db, 2);
        let handle = SpawnHandle::new(db.clone(), &parent, 2);

        assert!(!handle.can_spawn());
        let err = handle.spawn(SpawnRequest::new("too deep", "docs")).unwrap_err();
        assert!(matches!(
            err,
            QueueError::DepthExceeded {
                depth: 3,
                max_depth: 2
            }
        ));
        assert!(handle.spawned().is_empty());
        assert!(db.get_children(&parent.id).unwrap().is_empty());
    }
}
