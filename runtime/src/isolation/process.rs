//! Handle to a spawned container process.

use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use a3s_ctr_core::error::{CtrError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::task::JoinHandle;

use super::protocol::GO_BYTE;
use crate::state::is_process_alive;

/// Poll interval while waiting for a signalled process to go away.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A started container process.
///
/// For namespace isolation the process is parked before it runs user code
/// until [`ContainerProcess::release`] is called. Dropping the handle
/// without releasing closes the sync pipe and the init stage exits.
pub struct ContainerProcess {
    child: Child,
    pid: i32,
    go: Option<OwnedFd>,
}

impl ContainerProcess {
    pub(crate) fn new(child: Child, go: Option<OwnedFd>) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| CtrError::NamespaceError("spawned process has no PID".to_string()))?;
        Ok(Self {
            child,
            pid: pid as i32,
            go,
        })
    }

    /// Host PID of the process.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Let the process continue into user code. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        let Some(fd) = self.go.take() else {
            return Ok(());
        };
        let mut pipe = File::from(fd);
        pipe.write_all(&[GO_BYTE]).map_err(|e| {
            CtrError::NamespaceError(format!("failed to release process {}: {}", self.pid, e))
        })?;
        tracing::debug!(pid = self.pid, "Released container process");
        Ok(())
    }

    /// Wait for exit and return the exit code.
    pub async fn wait(&mut self) -> Result<i32> {
        let status = self
            .child
            .wait()
            .await
            .map_err(CtrError::io(format!("failed to wait for process {}", self.pid)))?;
        Ok(exit_code(status))
    }

    /// Wait in the foreground. SIGINT/SIGTERM received by this process are
    /// forwarded as SIGTERM; if the child is still alive after `grace` it
    /// gets SIGKILL.
    pub async fn wait_foreground(&mut self, grace: Duration) -> Result<i32> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())
            .map_err(CtrError::io("failed to install SIGINT handler"))?;
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(CtrError::io("failed to install SIGTERM handler"))?;

        let received = tokio::select! {
            status = self.child.wait() => {
                return status.map(exit_code).map_err(CtrError::io(format!(
                    "failed to wait for process {}",
                    self.pid
                )));
            }
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };

        tracing::info!(pid = self.pid, signal = received, "Forwarding SIGTERM to container");
        send_signal(self.pid, Signal::SIGTERM);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.map(exit_code).map_err(CtrError::io(format!(
                "failed to wait for process {}",
                self.pid
            ))),
            Err(_) => {
                tracing::warn!(
                    pid = self.pid,
                    grace_secs = grace.as_secs(),
                    "Container did not exit within grace period, sending SIGKILL"
                );
                send_signal(self.pid, Signal::SIGKILL);
                self.wait().await
            }
        }
    }

    /// Wait in the background and hand the outcome to `on_exit`.
    pub fn detach<F>(mut self, on_exit: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<i32>) + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = self.wait().await;
            on_exit(outcome);
        })
    }

    /// SIGKILL the process.
    pub fn kill(&mut self) -> Result<()> {
        self.child
            .start_kill()
            .map_err(CtrError::io(format!("failed to kill process {}", self.pid)))
    }
}

/// Exit code, or 128 + signal number for signalled exits.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

/// How [`terminate`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    AlreadyExited,
    Graceful,
    Killed,
}

/// SIGTERM `pid`, wait up to `grace` for it to exit, then SIGKILL.
///
/// Works on any PID, not only children of this process.
pub async fn terminate(pid: i32, grace: Duration) -> Termination {
    if !is_process_alive(pid) {
        return Termination::AlreadyExited;
    }

    tracing::debug!(pid, "Sending SIGTERM");
    send_signal(pid, Signal::SIGTERM);

    let start = Instant::now();
    while start.elapsed() < grace {
        if !is_process_alive(pid) {
            tracing::debug!(pid, "Process exited gracefully");
            return Termination::Graceful;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
    if !is_process_alive(pid) {
        return Termination::Graceful;
    }

    tracing::warn!(pid, "Process did not exit gracefully, sending SIGKILL");
    send_signal(pid, Signal::SIGKILL);
    Termination::Killed
}

fn send_signal(pid: i32, signal: Signal) {
    if let Err(e) = kill(Pid::from_raw(pid), signal) {
        tracing::debug!(pid, ?signal, error = %e, "Signal delivery failed");
    }
}
