//! Long-running subprocess handle.
//!
//! [`Subprocess`] wraps a spawned child whose stdout is consumed line by
//! line (the segmenter protocol ffmpeg speaks on `-segment_list pipe:1`).
//! The handle exposes the line stream, the eventual exit code, and a
//! graceful kill: SIGTERM first, SIGKILL if the process is still alive
//! after a grace period. A deadline passed at spawn time bounds runaway
//! processes.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Notify};

use crate::error::{Error, Result};

/// How long a killed process gets to exit on SIGTERM before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A spawned child process with line-oriented stdout.
pub struct Subprocess {
    program: String,
    pid: u32,
    lines: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    exit: watch::Receiver<Option<i32>>,
    hard_kill: Arc<Notify>,
    kill_requested: AtomicBool,
}

impl Subprocess {
    /// Spawn `command` with piped stdout and a hard execution deadline.
    ///
    /// stderr is left untouched (inherited unless the caller configured it),
    /// stdin is closed. The returned handle owns nothing blocking; a
    /// background task drives the child to completion.
    pub fn spawn(mut command: Command, deadline: Duration) -> Result<Arc<Self>> {
        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .to_string();

        command.stdout(Stdio::piped()).stdin(Stdio::null());

        let mut child = command
            .spawn()
            .map_err(|e| Error::tool(&program, format!("failed to spawn: {e}")))?;

        let pid = child.id().ok_or_else(|| {
            Error::tool(&program, "process exited before a pid could be observed")
        })?;

        let stdout = child.stdout.take();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let hard_kill = Arc::new(Notify::new());

        let proc = Arc::new(Self {
            program: program.clone(),
            pid,
            lines: Mutex::new(Some(line_rx)),
            exit: exit_rx,
            hard_kill: hard_kill.clone(),
            kill_requested: AtomicBool::new(false),
        });

        tokio::spawn(monitor(
            child, stdout, line_tx, exit_tx, hard_kill, deadline, program, pid,
        ));

        Ok(proc)
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Program name, for diagnostics.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Take the stdout line stream. Yields `None` once per handle.
    pub fn take_lines(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.lines.lock().take()
    }

    /// Whether [`Subprocess::kill`] has been requested on this handle.
    pub fn kill_requested(&self) -> bool {
        self.kill_requested.load(Ordering::Relaxed)
    }

    /// Whether the process has exited.
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the process to exit and return its exit code.
    ///
    /// Signal-terminated processes report 255, the same code ffmpeg uses
    /// when told to quit.
    pub async fn exit_code(&self) -> i32 {
        let mut rx = self.exit.clone();
        let result = match rx.wait_for(|v| v.is_some()).await {
            Ok(guard) => guard.unwrap_or(255),
            Err(_) => 255,
        };
        result
    }

    /// Kill the process: SIGTERM, then SIGKILL after a grace period if it
    /// has not exited. Completes once the signal sequence is done; callers
    /// that need the exit itself should also await [`Subprocess::exit_code`].
    pub async fn kill(&self) {
        if self.has_exited() {
            return;
        }
        self.kill_requested.store(true, Ordering::Relaxed);

        #[cfg(unix)]
        // SAFETY: plain kill(2) on a pid we spawned; worst case ESRCH.
        unsafe {
            libc::kill(self.pid as libc::pid_t, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        self.hard_kill.notify_one();

        let mut rx = self.exit.clone();
        let exited = tokio::time::timeout(KILL_GRACE, async move {
            let _ = rx.wait_for(|v| v.is_some()).await;
        })
        .await;

        if exited.is_err() {
            tracing::warn!(
                program = %self.program,
                pid = self.pid,
                "process ignored SIGTERM; escalating to SIGKILL"
            );
            self.hard_kill.notify_one();
        }
    }
}

impl std::fmt::Debug for Subprocess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subprocess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor(
    mut child: Child,
    stdout: Option<tokio::process::ChildStdout>,
    line_tx: mpsc::UnboundedSender<String>,
    exit_tx: watch::Sender<Option<i32>>,
    hard_kill: Arc<Notify>,
    deadline: Duration,
    program: String,
    pid: u32,
) {
    let timer = tokio::time::sleep(deadline);
    tokio::pin!(timer);
    let mut timed_out = false;

    if let Some(out) = stdout {
        let mut lines = BufReader::new(out).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let _ = line_tx.send(line);
                    }
                    _ => break,
                },
                _ = hard_kill.notified() => {
                    let _ = child.start_kill();
                }
                _ = &mut timer, if !timed_out => {
                    timed_out = true;
                    tracing::warn!(
                        %program,
                        pid,
                        deadline_secs = deadline.as_secs(),
                        "process exceeded its deadline; killing"
                    );
                    let _ = child.start_kill();
                }
            }
        }
    }
    drop(line_tx);

    let code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(255),
        Err(e) => {
            tracing::error!(%program, pid, "failed to reap process: {e}");
            255
        }
    };
    let _ = exit_tx.send(Some(code));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn stdout_lines_then_exit_code() {
        let proc = Subprocess::spawn(sh("echo one; echo two; exit 3"), Duration::from_secs(10))
            .expect("spawn");
        let mut lines = proc.take_lines().expect("lines");

        assert_eq!(lines.recv().await.as_deref(), Some("one"));
        assert_eq!(lines.recv().await.as_deref(), Some("two"));
        assert_eq!(lines.recv().await, None);
        assert_eq!(proc.exit_code().await, 3);
        assert!(proc.has_exited());
    }

    #[tokio::test]
    async fn lines_can_only_be_taken_once() {
        let proc = Subprocess::spawn(sh("true"), Duration::from_secs(10)).expect("spawn");
        assert!(proc.take_lines().is_some());
        assert!(proc.take_lines().is_none());
        proc.exit_code().await;
    }

    #[tokio::test]
    async fn kill_terminates_a_sleeping_process() {
        let proc = Subprocess::spawn(sh("sleep 60"), Duration::from_secs(120)).expect("spawn");
        proc.kill().await;
        let code = proc.exit_code().await;
        assert_eq!(code, 255);
        assert!(proc.kill_requested());
    }

    #[tokio::test]
    async fn deadline_kills_a_runaway_process() {
        let proc =
            Subprocess::spawn(sh("sleep 60"), Duration::from_millis(100)).expect("spawn");
        let code = proc.exit_code().await;
        assert_eq!(code, 255);
        assert!(!proc.kill_requested());
    }

    #[tokio::test]
    async fn kill_after_exit_is_a_no_op() {
        let proc = Subprocess::spawn(sh("true"), Duration::from_secs(10)).expect("spawn");
        proc.exit_code().await;
        proc.kill().await;
        assert!(!proc.kill_requested());
    }
}
