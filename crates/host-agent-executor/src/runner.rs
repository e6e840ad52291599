//! Bounded, cancellable host command execution.

use std::{
    process::Stdio,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use command_group::AsyncCommandGroup;
use host_agent_core::{EventHub, clock::now_millis};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::Semaphore,
    task::JoinHandle,
};
use uuid::Uuid;

use crate::command::{CommandBuildError, CommandBuilder, CommandParts};

/// Default command deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Time allowed for output pipes to drain once the process is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8 * 1024;

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum number of commands running at once.
    pub max_concurrent: usize,
    /// Per-stream output cap in bytes.
    pub max_output_bytes: usize,
    /// Run command lines through the platform shell.
    pub use_shell: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_output_bytes: 1024 * 1024,
            use_shell: false,
        }
    }
}

/// Lifecycle state of a command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Completed,
    TimedOut,
    Failed,
}

/// Execution error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Command timeout after {0} ms")]
    TimedOut(u64),
    #[error("Command failed: {0}")]
    Failed(String),
}

/// Result of running one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandExecution {
    pub id: Uuid,
    pub command: String,
    pub timeout_ms: u64,
    pub state: ExecutionState,
    pub stdout: String,
    pub stderr: String,
    /// Present only for `Completed`.
    pub exit_code: Option<i32>,
    /// Whether either stream exceeded the output cap.
    pub truncated: bool,
    pub error: Option<String>,
    /// Process id, once spawned.
    pub pid: Option<u32>,
    pub started_at: i64,
    pub duration_ms: u64,
}

impl CommandExecution {
    fn new(id: Uuid, command: &str, timeout: Duration) -> Self {
        Self {
            id,
            command: command.to_string(),
            timeout_ms: duration_millis(timeout),
            state: ExecutionState::Running,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            truncated: false,
            error: None,
            pid: None,
            started_at: now_millis(),
            duration_ms: 0,
        }
    }

    fn failed(mut self, error: String) -> Self {
        self.state = ExecutionState::Failed;
        self.error = Some(error);
        self
    }

    /// Exit code on completion, otherwise the failure.
    ///
    /// # Errors
    /// Returns the error that kept the command from completing.
    pub fn outcome(&self) -> Result<i32, ExecutionError> {
        match self.state {
            ExecutionState::Completed => Ok(self.exit_code.unwrap_or_default()),
            ExecutionState::TimedOut => Err(ExecutionError::TimedOut(self.timeout_ms)),
            ExecutionState::Failed if self.pid.is_some() => Err(ExecutionError::Failed(
                self.error.clone().unwrap_or_default(),
            )),
            ExecutionState::Failed | ExecutionState::Running => Err(ExecutionError::SpawnFailed(
                self.error.clone().unwrap_or_default(),
            )),
        }
    }
}

/// Handle to a command running on its own task.
pub struct ExecutionHandle {
    id: Uuid,
    command: String,
    timeout: Duration,
    handle: JoinHandle<CommandExecution>,
}

impl ExecutionHandle {
    /// Execution identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the execution to reach a terminal state.
    pub async fn wait(self) -> CommandExecution {
        match self.handle.await {
            Ok(execution) => execution,
            Err(e) => CommandExecution::new(self.id, &self.command, self.timeout)
                .failed(format!("execution task failed: {e}")),
        }
    }
}

/// Runs host commands under a deadline.
///
/// Every command runs in its own process group on a separate task; on
/// timeout the whole group is killed before the execution is reported.
#[derive(Clone)]
pub struct CommandExecutor {
    config: Arc<ExecutorConfig>,
    permits: Arc<Semaphore>,
    events: Option<Arc<EventHub>>,
}

impl CommandExecutor {
    /// Create an executor.
    #[must_use]
    pub fn new(config: ExecutorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config: Arc::new(config),
            permits,
            events: None,
        }
    }

    /// Publish lifecycle events to `hub`.
    #[must_use]
    pub fn with_events(mut self, hub: Arc<EventHub>) -> Self {
        self.events = Some(hub);
        self
    }

    /// Start a command line and return a handle to its result.
    #[must_use]
    pub fn spawn(&self, command_line: &str, timeout: Duration) -> ExecutionHandle {
        let parts = CommandBuilder::new(command_line)
            .use_shell(self.config.use_shell)
            .build();
        self.spawn_inner(command_line.to_string(), parts, timeout)
    }

    /// Start an already-split command.
    #[must_use]
    pub fn spawn_parts(&self, parts: CommandParts, timeout: Duration) -> ExecutionHandle {
        let display = std::iter::once(parts.program.as_str())
            .chain(parts.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        self.spawn_inner(display, Ok(parts), timeout)
    }

    /// Run a command line to a terminal state.
    pub async fn run(&self, command_line: &str, timeout: Duration) -> CommandExecution {
        self.spawn(command_line, timeout).wait().await
    }

    /// Run an already-split command to a terminal state.
    pub async fn run_parts(&self, parts: CommandParts, timeout: Duration) -> CommandExecution {
        self.spawn_parts(parts, timeout).wait().await
    }

    fn spawn_inner(
        &self,
        command: String,
        parts: Result<CommandParts, CommandBuildError>,
        timeout: Duration,
    ) -> ExecutionHandle {
        let id = Uuid::new_v4();
        let deadline = tokio::time::Instant::now() + timeout;
        let this = self.clone();
        let handle = tokio::spawn({
            let command = command.clone();
            async move { this.execute(id, command, parts, timeout, deadline).await }
        });
        ExecutionHandle {
            id,
            command,
            timeout,
            handle,
        }
    }

    /// Runs one command. `deadline` bounds the wait for a permit as well as
    /// the process itself.
    async fn execute(
        self,
        id: Uuid,
        command_line: String,
        parts: Result<CommandParts, CommandBuildError>,
        timeout: Duration,
        deadline: tokio::time::Instant,
    ) -> CommandExecution {
        let mut execution = CommandExecution::new(id, &command_line, timeout);
        let started = Instant::now();

        let permit = tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned());
        let _permit = match permit.await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return self.finish(execution.failed("executor is shut down".into()), started);
            }
            Err(_) => {
                tracing::debug!(execution_id = %id, "deadline passed while waiting for a permit");
                execution.state = ExecutionState::TimedOut;
                execution.error = Some(format!("Command timeout after {} ms", execution.timeout_ms));
                return self.finish(execution, started);
            }
        };

        let parts = match parts {
            Ok(parts) => parts,
            Err(e) => return self.finish(execution.failed(e.to_string()), started),
        };
        let (program, args) = match parts.into_resolved().await {
            Ok(resolved) => resolved,
            Err(e) => return self.finish(execution.failed(e.to_string()), started),
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.group_spawn() {
            Ok(child) => child,
            Err(e) => return self.finish(execution.failed(e.to_string()), started),
        };

        execution.pid = child.id();
        tracing::debug!(execution_id = %id, command = %command_line, pid = ?execution.pid, "command started");
        self.emit(
            "command.started",
            json!({ "id": id, "command": command_line, "timeoutMs": execution.timeout_ms }),
        );

        let limit = self.config.max_output_bytes;
        let stdout = OutputSink::default();
        let stderr = OutputSink::default();
        let mut pumps = Vec::with_capacity(2);
        if let Some(out) = child.inner().stdout.take() {
            pumps.push(tokio::spawn(pump(out, stdout.clone(), limit)));
        }
        if let Some(err) = child.inner().stderr.take() {
            pumps.push(tokio::spawn(pump(err, stderr.clone(), limit)));
        }

        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => match status.code() {
                Some(code) => {
                    execution.state = ExecutionState::Completed;
                    execution.exit_code = Some(code);
                }
                None => {
                    execution.state = ExecutionState::Failed;
                    execution.error = Some(format!("terminated by signal ({status})"));
                }
            },
            Ok(Err(e)) => {
                execution.state = ExecutionState::Failed;
                execution.error = Some(format!("wait failed: {e}"));
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(execution_id = %id, "failed to kill timed out command: {e}");
                }
                execution.state = ExecutionState::TimedOut;
                execution.error = Some(format!("Command timeout after {} ms", execution.timeout_ms));
            }
        }

        // Pipes close once the group is gone; a detached grandchild may keep
        // them open, so stop waiting after a grace period.
        let drain = futures::future::join_all(pumps.iter_mut());
        if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
            for p in &pumps {
                p.abort();
            }
        }

        execution.stdout = stdout.take_string();
        execution.stderr = stderr.take_string();
        execution.truncated = stdout.truncated() || stderr.truncated();
        self.finish(execution, started)
    }

    fn finish(&self, mut execution: CommandExecution, started: Instant) -> CommandExecution {
        execution.duration_ms = duration_millis(started.elapsed());
        match execution.state {
            ExecutionState::Completed => {
                tracing::info!(
                    execution_id = %execution.id,
                    exit_code = ?execution.exit_code,
                    duration_ms = execution.duration_ms,
                    "command completed"
                );
                self.emit(
                    "command.completed",
                    json!({
                        "id": execution.id,
                        "exitCode": execution.exit_code,
                        "durationMs": execution.duration_ms,
                    }),
                );
            }
            ExecutionState::TimedOut => {
                tracing::warn!(
                    execution_id = %execution.id,
                    command = %execution.command,
                    timeout_ms = execution.timeout_ms,
                    "command timed out and was killed"
                );
                self.emit(
                    "command.timed_out",
                    json!({ "id": execution.id, "timeoutMs": execution.timeout_ms }),
                );
            }
            ExecutionState::Failed | ExecutionState::Running => {
                tracing::warn!(
                    execution_id = %execution.id,
                    command = %execution.command,
                    error = ?execution.error,
                    "command failed"
                );
                self.emit(
                    "command.failed",
                    json!({ "id": execution.id, "error": execution.error }),
                );
            }
        }
        execution
    }

    fn emit(&self, event_type: &str, payload: serde_json::Value) {
        if let Some(hub) = &self.events {
            hub.emit(event_type, payload);
        }
    }
}

#[derive(Clone, Default)]
struct OutputSink {
    data: Arc<Mutex<Vec<u8>>>,
    truncated: Arc<AtomicBool>,
}

impl OutputSink {
    fn append(&self, chunk: &[u8], limit: usize) {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let room = limit.saturating_sub(data.len());
        if chunk.len() > room {
            self.truncated.store(true, Ordering::Relaxed);
        }
        data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn take_string(&self) -> String {
        let data = std::mem::take(&mut *self.data.lock().unwrap_or_else(PoisonError::into_inner));
        String::from_utf8_lossy(&data).into_owned()
    }

    fn truncated(&self) -> bool {
        self.truncated.load(Ordering::Relaxed)
    }
}

/// Copy a stream into `sink`, draining past the cap so the child never
/// blocks on a full pipe.
async fn pump<R: AsyncRead + Unpin>(mut reader: R, sink: OutputSink, limit: usize) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.append(&buf[..n], limit),
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
