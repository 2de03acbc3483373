//! External process supervision.
//!
//! Wraps a single `tokio::process::Child` through the states
//! `fresh → running → (finished | aborted)`. A fresh
//! instance is single-use — `start` consumes it, `wait` consumes
//! the running instance. Grounded on the production-launcher shape in
//! `broker::launcher::ProcessLauncher` (spawn via `tokio::process`, take
//! stdout/stderr, forward lines on dedicated tasks rather than threads).
//!
//! `wait()` owns the `Child` outright rather than sharing it behind a
//! lock: `Child::wait()` holds its receiver for as long as the process
//! runs, so a mutex guarding the same `Child` would keep `abort()`
//! blocked out until the process exits on its own — exactly the
//! deadlock abort exists to avoid. Instead `AbortHandle` only carries
//! the child's pid and signals it directly via `nix::sys::signal::kill`,
//! so it never contends with whoever is blocked in `wait()`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Everything needed to start one child.
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    /// Prepended to argv[0] when non-empty.
    pub process_wrapper: Option<String>,
    /// Distinguishes the "raw" monitoring logger target from the
    /// human-facing one.
    pub log_label: String,
}

/// A spawned child with its stdout/stderr forwarders still attached.
pub struct RunningProcess {
    child: Child,
    pid: Option<Pid>,
    stdout_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<()>,
    aborted: Arc<AtomicBool>,
}

/// A cheaply cloneable handle that can terminate the process this was
/// taken from, independent of whoever is blocked in `wait()`. Carries
/// only the pid, never the `Child` itself, so signaling it never
/// contends with the task that owns `wait()`.
#[derive(Clone)]
pub struct AbortHandle {
    pid: Option<Pid>,
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Best-effort terminate; a second call (from this handle or a
    /// clone) is a no-op. A subsequent `wait()` on the owning
    /// `RunningProcess` remains valid.
    pub async fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(pid) = self.pid else {
            return;
        };
        if let Err(err) = signal::kill(pid, Signal::SIGKILL) {
            warn!(error = %err, "failed to signal child for abort");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Starts the process described by `spec`. Propagates a launch error
/// fatally rather than retrying — the caller (task run engine) converts
/// it into a `TaskRunError::Launch`.
pub async fn start(spec: ProcessSpec) -> std::io::Result<RunningProcess> {
    let mut argv = spec.argv;
    if let Some(wrapper) = spec.process_wrapper.filter(|w| !w.is_empty()) {
        if let Some(first) = argv.first_mut() {
            *first = format!("{wrapper} {first}");
        }
    }

    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"))?;

    let mut child = Command::new(program)
        .args(args)
        .envs(spec.env.iter())
        .current_dir(&spec.working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");
    let label = spec.log_label.clone();
    let pid = child.id().map(|id| Pid::from_raw(id as i32));

    let stdout_task = tokio::spawn(forward_lines(stdout, label.clone(), Level::Info));
    let stderr_task = tokio::spawn(forward_lines(stderr, label, Level::Warning));

    Ok(RunningProcess {
        child,
        pid,
        stdout_task,
        stderr_task,
        aborted: Arc::new(AtomicBool::new(false)),
    })
}

#[derive(Clone, Copy)]
enum Level {
    Info,
    Warning,
}

/// Reads lines from `stream` and forwards each to both a user-facing
/// logger (INFO for stdout, WARNING for stderr) and a separate "raw"
/// non-ancestor target meant for automatic monitoring.
async fn forward_lines<R>(stream: R, label: String, level: Level)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match level {
                    Level::Info => info!(target: "task_runner::wrapper", wrapper = %label, "{line}"),
                    Level::Warning => warn!(target: "task_runner::wrapper", wrapper = %label, "{line}"),
                }
                tracing::info!(target: "task_runner::wrapper::raw", wrapper = %label, "{line}");
            }
            Ok(None) => break,
            Err(err) => {
                warn!(target: "task_runner::wrapper", wrapper = %label, error = %err, "error reading child output");
                break;
            }
        }
    }
}

impl RunningProcess {
    /// A cloneable handle that can terminate this child from any task.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            pid: self.pid,
            aborted: self.aborted.clone(),
        }
    }

    /// Blocks until the child exits, then joins both reader tasks
    /// before returning the exit code. Owns the `Child` outright, so
    /// an `AbortHandle::abort()` racing this call signals the pid
    /// directly instead of waiting on the same lock.
    pub async fn wait(mut self) -> std::io::Result<i32> {
        let status = self.child.wait().await?;
        let _ = self.stdout_task.await;
        let _ = self.stderr_task.await;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_propagates_spawn_failure() {
        let spec = ProcessSpec {
            argv: vec!["/nonexistent/definitely-not-a-binary".to_string()],
            working_dir: std::env::temp_dir(),
            env: HashMap::new(),
            process_wrapper: None,
            log_label: "test".into(),
        };
        assert!(start(spec).await.is_err());
    }

    #[tokio::test]
    async fn runs_a_trivial_command_and_collects_exit_code() {
        let spec = ProcessSpec {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "exit 7".to_string()],
            working_dir: std::env::temp_dir(),
            env: HashMap::new(),
            process_wrapper: None,
            log_label: "test".into(),
        };
        let running = start(spec).await.unwrap();
        let code = running.wait().await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let spec = ProcessSpec {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            working_dir: std::env::temp_dir(),
            env: HashMap::new(),
            process_wrapper: None,
            log_label: "test".into(),
        };
        let running = start(spec).await.unwrap();
        let handle = running.abort_handle();
        handle.abort().await;
        handle.abort().await;
        let _ = running.wait().await;
    }

    #[tokio::test]
    async fn abort_handle_reaches_process_while_another_task_awaits_it() {
        let spec = ProcessSpec {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            working_dir: std::env::temp_dir(),
            env: HashMap::new(),
            process_wrapper: None,
            log_label: "test".into(),
        };
        let running = start(spec).await.unwrap();
        let handle = running.abort_handle();
        let waiter = tokio::spawn(running.wait());
        handle.abort().await;
        let code = waiter.await.unwrap().unwrap();
        assert_ne!(code, 0);
    }
}
