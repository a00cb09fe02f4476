//! Degraded isolation: run the command as a plain child process.
//!
//! No namespaces, mounts or chroot. The command runs on the host with the
//! container environment and, when the path exists, the container root's
//! working directory as its cwd.

use std::path::PathBuf;
use std::process::Stdio;

use a3s_ctr_core::error::{CtrError, Result};
use async_trait::async_trait;
use tokio::process::Command;

use super::logs::{log_paths, open_log, pump};
use super::process::ContainerProcess;
use super::{IsolationConfig, Isolator};

#[derive(Debug, Clone, Default)]
pub struct DirectIsolator;

impl DirectIsolator {
    pub fn new() -> Self {
        Self
    }

    fn working_dir(config: &IsolationConfig) -> Option<PathBuf> {
        let inside = config.rootfs.join(config.work_dir.trim_start_matches('/'));
        if inside.is_dir() {
            Some(inside)
        } else if config.rootfs.is_dir() {
            Some(config.rootfs.clone())
        } else {
            None
        }
    }
}

/// Pipe whose write end feeds a timestamped log file from a background
/// thread. Returns the write end for the child.
fn logging_pipe(path: PathBuf) -> Result<Stdio> {
    let file = open_log(&path)?;
    let (read, write) = nix::unistd::pipe()
        .map_err(|e| CtrError::Other(format!("failed to create log pipe: {}", e)))?;
    std::thread::spawn(move || {
        if let Err(e) = pump(std::fs::File::from(read), file) {
            tracing::warn!(path = %path.display(), error = %e, "Log pump failed");
        }
    });
    Ok(Stdio::from(write))
}

#[async_trait]
impl Isolator for DirectIsolator {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn spawn(&self, config: &IsolationConfig) -> Result<ContainerProcess> {
        config.validate()?;

        let mut cmd = Command::new(&config.argv[0]);
        cmd.args(&config.argv[1..]).env_clear().envs(&config.env);
        if let Some(dir) = Self::working_dir(config) {
            cmd.current_dir(dir);
        }

        match (&config.log_dir, config.detached) {
            (Some(dir), false) => {
                let (stdout, stderr) = log_paths(dir);
                cmd.stdin(Stdio::inherit())
                    .stdout(logging_pipe(stdout)?)
                    .stderr(logging_pipe(stderr)?);
            }
            // The log pump threads would die with this process, so a
            // detached child writes its files directly, without timestamps.
            (Some(dir), true) => {
                let (stdout, stderr) = log_paths(dir);
                cmd.stdin(Stdio::null())
                    .stdout(open_log(&stdout)?)
                    .stderr(open_log(&stderr)?);
            }
            (None, true) => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
            }
            (None, false) => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
        }

        if config.detached {
            // SAFETY: setsid is async-signal-safe.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn().map_err(|e| {
            CtrError::Other(format!(
                "failed to start '{}' for container {}: {}",
                config.argv[0], config.id, e
            ))
        })?;
        // Drop our copies of the log pipe write ends.
        drop(cmd);

        let process = ContainerProcess::new(child, None)?;
        tracing::info!(
            container = %config.id,
            pid = process.pid(),
            "Container process spawned without isolation"
        );
        Ok(process)
    }
}
