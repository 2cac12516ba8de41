use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{FfbatchError, Result};
use super::commands::{MediaCommand, MediaCommandBuilder};

/// Diagnostics beyond this size are trimmed from the front
const MAX_DIAGNOSTIC_BYTES: usize = 1024 * 1024;
/// How long to wait for stderr to close once the child has exited or been killed
const READER_GRACE: Duration = Duration::from_secs(1);

/// Terminal state of one tool invocation
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    Success,
    /// Non-zero exit; `None` when the process was terminated by a signal
    ToolFailure { code: Option<i32> },
    /// The process could not be started at all
    SpawnFailure { reason: String },
    /// Killed after exceeding the configured timeout
    Timeout { after: Duration },
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    /// Everything the tool wrote to standard error
    pub diagnostics: String,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Turn every non-success status into the matching error
    pub fn into_result(self, program: &str) -> Result<ExecutionResult> {
        let program = program.to_string();
        match self.status {
            ExecutionStatus::Success => Ok(self),
            ExecutionStatus::ToolFailure { code } => Err(FfbatchError::ToolFailure {
                program,
                code,
                diagnostics: self.diagnostics,
            }),
            ExecutionStatus::SpawnFailure { reason } => Err(FfbatchError::Spawn { program, reason }),
            ExecutionStatus::Timeout { after } => Err(FfbatchError::Timeout {
                program,
                after,
                diagnostics: self.diagnostics,
            }),
        }
    }
}

/// Runs an external tool to completion.
///
/// Implementations never fail: every outcome, including a missing binary, is an
/// [`ExecutionStatus`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn run(&self, command: &MediaCommand, timeout: Option<Duration>) -> ExecutionResult;
}

/// Executor backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioProcessExecutor;

impl TokioProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Check that `binary_path` starts and answers `-version`
    pub async fn check_availability(&self, binary_path: &str) -> Result<()> {
        let command = MediaCommandBuilder::new(binary_path).version_check();
        self.run(&command, Some(Duration::from_secs(10)))
            .await
            .into_result(binary_path)?;
        info!("{} is available", binary_path);
        Ok(())
    }
}

#[async_trait]
impl ProcessExecutor for TokioProcessExecutor {
    async fn run(&self, command: &MediaCommand, timeout: Option<Duration>) -> ExecutionResult {
        let started = Instant::now();
        debug!("Executing {}", command);

        let spawned = Command::new(&command.binary_path)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start {}: {}", command.binary_path, e);
                return ExecutionResult {
                    status: ExecutionStatus::SpawnFailure { reason: e.to_string() },
                    diagnostics: String::new(),
                    duration: started.elapsed(),
                };
            }
        };

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let reader = child.stderr.take().map(|stderr| {
            let buffer = Arc::clone(&buffer);
            let label = command.description.clone();
            tokio::spawn(stream_diagnostics(stderr, buffer, label))
        });

        let waited = match timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };

        let status = match waited {
            Some(Ok(exit)) => {
                if let Some(reader) = reader {
                    // a background descendant may inherit the pipe and outlive the child
                    if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
                        debug!("{} exited but stderr is still open, not waiting further", command.binary_path);
                    }
                }
                if exit.success() {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::ToolFailure { code: exit.code() }
                }
            }
            Some(Err(e)) => {
                warn!("Failed to wait for {}: {}", command.binary_path, e);
                let _ = child.kill().await;
                append_diagnostics(&buffer, format!("\nfailed to wait for process: {}\n", e).as_bytes());
                ExecutionStatus::ToolFailure { code: None }
            }
            None => {
                let limit = timeout.unwrap_or_default();
                warn!(
                    "{} timed out after {:.1}s, killing process",
                    command.binary_path,
                    limit.as_secs_f64()
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {}: {}", command.binary_path, e);
                }
                if let Some(reader) = reader {
                    // a grandchild may still hold the pipe open
                    let _ = tokio::time::timeout(READER_GRACE, reader).await;
                }
                ExecutionStatus::Timeout { after: limit }
            }
        };

        let diagnostics = snapshot(&buffer);
        let duration = started.elapsed();
        debug!(
            "{} finished in {:.2}s with {:?}",
            command.binary_path,
            duration.as_secs_f64(),
            status
        );

        ExecutionResult {
            status,
            diagnostics,
            duration,
        }
    }
}

/// Copy the tool's stderr into `buffer` as it arrives, logging complete lines.
///
/// ffmpeg separates progress updates with `\r`, so both separators end a line.
async fn stream_diagnostics<R>(mut stderr: R, buffer: Arc<Mutex<Vec<u8>>>, label: String)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    let mut pending_line = Vec::new();

    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                append_diagnostics(&buffer, &chunk[..n]);
                for &byte in &chunk[..n] {
                    if byte == b'\n' || byte == b'\r' {
                        if !pending_line.is_empty() {
                            debug!("[{}] {}", label, String::from_utf8_lossy(&pending_line));
                            pending_line.clear();
                        }
                    } else {
                        pending_line.push(byte);
                    }
                }
            }
            Err(e) => {
                warn!("[{}] failed to read diagnostics: {}", label, e);
                break;
            }
        }
    }

    if !pending_line.is_empty() {
        debug!("[{}] {}", label, String::from_utf8_lossy(&pending_line));
    }
}

fn append_diagnostics(buffer: &Mutex<Vec<u8>>, bytes: &[u8]) {
    let mut buffer = match buffer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    buffer.extend_from_slice(bytes);
    if buffer.len() > MAX_DIAGNOSTIC_BYTES {
        let excess = buffer.len() - MAX_DIAGNOSTIC_BYTES;
        buffer.drain(..excess);
    }
}

fn snapshot(buffer: &Mutex<Vec<u8>>) -> String {
    let buffer = match buffer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    String::from_utf8_lossy(&buffer).into_owned()
}
