//! Capability backed by an external agent process.
//!
//! The request is written to the child's stdin as one JSON document. The
//! child reports back on stdout with one JSON object per line, tagged by
//! `type`:
//!
//! ```text
//! {"type":"spawn","prompt":"...","output_path":"docs/api","context":{...}}
//! {"type":"step","description":"read sources"}
//! {"type":"usage","input_tokens":1200,"output_tokens":300}
//! {"type":"log","message":"..."}
//! {"type":"result","summary":"wrote 4 pages"}
//! ```
//!
//! Spawn lines are forwarded to the queue as they arrive. Anything that does
//! not parse is treated as free-form agent chatter and logged at debug.

use super::{Capability, CapabilityOutput, CapabilityRequest, SpawnHandle};
use crate::config::CapabilityConfig;
use crate::error::CapabilityFailure;
use crate::types::{SpawnRequest, TokenUsage};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Lines of stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AgentEvent {
    Spawn(SpawnRequest),
    Step {
        #[serde(default)]
        description: Option<String>,
    },
    Usage(TokenUsage),
    Log {
        message: String,
    },
    Result {
        #[serde(default)]
        summary: Option<String>,
    },
}

/// Runs a configured argv once per task.
#[derive(Debug, Clone)]
pub struct CommandCapability {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandCapability {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            working_dir: None,
        }
    }

    pub fn from_config(config: &CapabilityConfig) -> Self {
        Self {
            command: config.command.clone(),
            working_dir: config.working_dir.clone(),
        }
    }

    fn build_command(&self, request: &CapabilityRequest) -> Result<Command, CapabilityFailure> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| CapabilityFailure::failed("no capability command configured"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("DOC_SPAWNER_TASK_ID", &request.task_id)
            .env("DOC_SPAWNER_OUTPUT_PATH", &request.output_path)
            .env("DOC_SPAWNER_DEPTH", request.depth.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        Ok(cmd)
    }
}

#[async_trait]
impl Capability for CommandCapability {
    async fn execute(
        &self,
        request: &CapabilityRequest,
        spawner: &SpawnHandle,
    ) -> Result<CapabilityOutput, CapabilityFailure> {
        let mut child = self.build_command(request)?.spawn()?;

        let payload = serde_json::to_vec(request)
            .map_err(|e| CapabilityFailure::Protocol(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            // A child that never reads its request may exit before we finish writing
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!(task_id = %request.task_id, "Agent closed stdin early");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let stderr_tail = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CapabilityFailure::Protocol("agent stdout unavailable".into()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut output = CapabilityOutput::default();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<AgentEvent>(line) {
                Ok(AgentEvent::Spawn(spawn)) => match spawner.spawn(spawn) {
                    Ok(child_id) => {
                        debug!(task_id = %request.task_id, child_id = %child_id, "Agent spawned child");
                    }
                    Err(e) => {
                        warn!(
                            task_id = %request.task_id,
                            error_code = ?e.code(),
                            "Spawn request rejected: {}",
                            e
                        );
                    }
                },
                Ok(AgentEvent::Step { description }) => {
                    output.steps += 1;
                    debug!(
                        task_id = %request.task_id,
                        step = output.steps,
                        description = description.as_deref().unwrap_or(""),
                        "Agent step"
                    );
                    if output.steps > request.max_steps {
                        let _ = child.start_kill();
                        return Err(CapabilityFailure::StepLimitExceeded {
                            max_steps: request.max_steps,
                        });
                    }
                }
                Ok(AgentEvent::Usage(usage)) => output.usage.add(usage),
                Ok(AgentEvent::Log { message }) => {
                    info!(task_id = %request.task_id, "{}", message);
                }
                Ok(AgentEvent::Result { summary }) => output.summary = summary,
                Err(_) => debug!(task_id = %request.task_id, "agent: {}", line),
            }
        }

        let status = child.wait().await?;
        let tail = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => VecDeque::new(),
        };

        if !status.success() {
            let tail = Vec::from(tail).join("\n");
            return Err(CapabilityFailure::failed(if tail.is_empty() {
                format!("agent exited with {status}")
            } else {
                format!("agent exited with {status}: {tail}")
            }));
        }

        Ok(output)
    }
}
