//! # Process Executor
//!
//! Spawns the external tool as a child process, streams stdout and stderr
//! line by line, reaps the exit code, and exposes termination with a grace
//! period. The executor never retries: spawn failures are reported, runtime
//! failures surface as a non-zero exit code, and a killed child yields the
//! negated signal number as its sentinel code.
//!
//! Lines from the two streams may interleave; within one stream order is
//! preserved. A trailing partial line before EOF is emitted as a final
//! line.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use borgitory_shared::errors::{BorgitoryError, BorgitoryResult};
use borgitory_shared::types::OutputStream;

/// Sentinel exit code when the child was killed and no code is available
pub const KILLED_EXIT_CODE: i32 = -9;

/// A spawned child process
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    child: Child,
}

/// Outcome of monitoring a child to completion
#[derive(Debug, Clone)]
pub struct ExitResult {
    pub code: i32,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    /// Set when monitoring ended abnormally (timeout, cancellation, wait
    /// failure); the child has been killed in that case
    pub error: Option<String>,
}

impl ExitResult {
    pub fn success(&self) -> bool {
        self.code == 0 && self.error.is_none()
    }
}

/// Limits applied while monitoring a child
#[derive(Debug, Clone, Default)]
pub struct MonitorOptions {
    /// Hard deadline for the whole run; on expiry the child is terminated
    /// and the result carries error `"timeout"`. The grace below is the
    /// cleanup budget past the deadline.
    pub timeout: Option<Duration>,
    /// Grace between soft termination and kill
    pub grace: Duration,
}

/// Child-process spawner and supervisor
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Spawn `argv` with `env` layered over the inherited environment.
    /// Fails with [`BorgitoryError::Spawn`] when the binary is missing or
    /// execution is denied.
    pub fn spawn(
        &self,
        argv: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> BorgitoryResult<ProcessHandle> {
        let program = argv
            .first()
            .ok_or_else(|| BorgitoryError::Validation("empty argv".to_string()))?;
        let mut command = Command::new(program);
        command
            .args(&argv[1..])
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| BorgitoryError::spawn(program.clone(), e))?;
        let pid = child.id();
        debug!(program = %program, pid = ?pid, "spawned child process");
        Ok(ProcessHandle { pid, child })
    }

    /// Read both streams to EOF, delivering each complete line to
    /// `line_callback` before accounting it, then reap the exit code.
    ///
    /// The cancellation token is observed between line reads; on cancel the
    /// child is terminated with `options.grace` and the result carries
    /// error `"cancelled"`.
    pub async fn monitor<F>(
        &self,
        mut handle: ProcessHandle,
        mut line_callback: F,
        cancel: &CancellationToken,
        options: MonitorOptions,
    ) -> ExitResult
    where
        F: FnMut(OutputStream, &str),
    {
        let stdout = handle.child.stdout.take();
        let stderr = handle.child.stderr.take();

        let (tx, mut rx) = mpsc::channel::<(OutputStream, String)>(64);
        let mut readers = tokio::task::JoinSet::new();
        if let Some(stdout) = stdout {
            readers.spawn(pump_lines(stdout, OutputStream::Stdout, tx.clone()));
        }
        if let Some(stderr) = stderr {
            readers.spawn(pump_lines(stderr, OutputStream::Stderr, tx));
        }

        let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut stdout_bytes = 0u64;
        let mut stderr_bytes = 0u64;
        let mut abnormal: Option<&'static str> = None;

        loop {
            let line = match deadline {
                Some(deadline) => tokio::select! {
                    line = rx.recv() => line,
                    _ = cancel.cancelled() => {
                        abnormal = Some("cancelled");
                        break;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        abnormal = Some("timeout");
                        break;
                    }
                },
                None => tokio::select! {
                    line = rx.recv() => line,
                    _ = cancel.cancelled() => {
                        abnormal = Some("cancelled");
                        break;
                    }
                },
            };

            match line {
                Some((stream, text)) => {
                    line_callback(stream, &text);
                    match stream {
                        OutputStream::Stdout => stdout_bytes += text.len() as u64 + 1,
                        _ => stderr_bytes += text.len() as u64 + 1,
                    }
                }
                // Both pumps finished: the child closed its pipes
                None => break,
            }
        }

        readers.abort_all();

        if let Some(reason) = abnormal {
            let exited = Self::terminate_child(&mut handle.child, options.grace).await;
            let code = handle
                .child
                .wait()
                .await
                .ok()
                .and_then(exit_code)
                .unwrap_or(KILLED_EXIT_CODE);
            warn!(pid = ?handle.pid, reason, exited_in_grace = exited, "child terminated abnormally");
            return ExitResult {
                code,
                stdout_bytes,
                stderr_bytes,
                error: Some(reason.to_string()),
            };
        }

        match handle.child.wait().await {
            Ok(status) => ExitResult {
                code: exit_code(status).unwrap_or(KILLED_EXIT_CODE),
                stdout_bytes,
                stderr_bytes,
                error: None,
            },
            Err(e) => {
                let _ = handle.child.start_kill();
                ExitResult {
                    code: KILLED_EXIT_CODE,
                    stdout_bytes,
                    stderr_bytes,
                    error: Some(format!("wait failed: {e}")),
                }
            }
        }
    }

    /// Soft-terminate the child, wait up to `grace`, then kill. Returns
    /// whether the process had exited before the kill.
    pub async fn terminate(&self, handle: &mut ProcessHandle, grace: Duration) -> bool {
        Self::terminate_child(&mut handle.child, grace).await
    }

    async fn terminate_child(child: &mut Child, grace: Duration) -> bool {
        if let Some(pid) = child.id() {
            soft_terminate(pid);
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return true;
            }
        }
        let _ = child.start_kill();
        let _ = child.wait().await;
        false
    }
}

async fn pump_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send((stream, line)).await.is_err() {
            break;
        }
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| -s))
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

/// POSIX signal shim; SIGTERM without pulling in a bindings crate
#[cfg(unix)]
fn soft_terminate(pid: u32) {
    extern "C" {
        fn kill(pid: i32, sig: i32) -> i32;
    }
    // SAFETY: kill(2) with SIGTERM on a pid we spawned; the call has no
    // memory-safety requirements beyond a valid signal number.
    unsafe {
        kill(pid as i32, 15);
    }
}

#[cfg(not(unix))]
fn soft_terminate(_pid: u32) {}
