//! Namespace isolation through re-execution of the current binary.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use a3s_ctr_core::error::{CtrError, Result};
use async_trait::async_trait;
use tokio::process::Command;

use super::process::{exit_code, ContainerProcess};
use super::protocol::{InitSpec, GO_BYTE, INIT_MARKER};
use super::{IsolationConfig, Isolator};

/// Spawns `<init_binary> init`, which unshares namespaces, waits to be
/// released, and then sets up the root and execs the target.
#[derive(Debug, Clone)]
pub struct NamespaceIsolator {
    init_binary: PathBuf,
}

impl NamespaceIsolator {
    pub fn new(init_binary: impl Into<PathBuf>) -> Self {
        Self {
            init_binary: init_binary.into(),
        }
    }

    /// Use the running executable as the init binary.
    pub fn from_current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(CtrError::io("failed to locate the current executable"))?;
        Ok(Self::new(exe))
    }

    pub fn init_binary(&self) -> &Path {
        &self.init_binary
    }
}

/// `pipe2(O_CLOEXEC)`: `(read, write)`.
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    #[cfg(target_os = "linux")]
    {
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|e| CtrError::NamespaceError(format!("failed to create pipe: {}", e)))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(CtrError::unsupported("namespaces", "only supported on Linux"))
    }
}

/// Block until the child reports its namespaces are ready. `false` on EOF.
fn read_ready(ready: OwnedFd) -> std::io::Result<bool> {
    let mut pipe = File::from(ready);
    let mut byte = [0u8; 1];
    loop {
        match pipe.read(&mut byte) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(byte[0] == GO_BYTE),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl Isolator for NamespaceIsolator {
    fn name(&self) -> &'static str {
        "namespace"
    }

    async fn spawn(&self, config: &IsolationConfig) -> Result<ContainerProcess> {
        config.validate()?;

        // sync: parent writes, child reads. ready: child writes, parent reads.
        let (sync_read, sync_write) = cloexec_pipe()?;
        let (ready_read, ready_write) = cloexec_pipe()?;

        let init = InitSpec {
            rootfs: config.rootfs.clone(),
            hostname: config.hostname.clone(),
            work_dir: config.work_dir.clone(),
            sync_fd: sync_read.as_raw_fd(),
            ready_fd: ready_write.as_raw_fd(),
            env: config.env.clone(),
            argv: config.argv.clone(),
            namespaces: config.namespaces,
            binds: config.binds.clone(),
            log_dir: config.log_dir.clone(),
            no_new_privs: config.user_ns.as_ref().map(|u| u.no_new_privs).unwrap_or(false),
        };

        let mut cmd = Command::new(&self.init_binary);
        cmd.arg(INIT_MARKER)
            .envs(init.to_env()?)
            .stdin(if config.detached {
                Stdio::null()
            } else {
                Stdio::inherit()
            })
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let child_fds = [sync_read.as_raw_fd(), ready_write.as_raw_fd()];
        let detached = config.detached;
        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                for fd in child_fds {
                    if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if detached && libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            CtrError::NamespaceError(format!(
                "failed to spawn init stage {}: {}",
                self.init_binary.display(),
                e
            ))
        })?;
        drop(sync_read);
        drop(ready_write);

        let ready = tokio::task::spawn_blocking(move || read_ready(ready_read))
            .await
            .map_err(|e| CtrError::Other(format!("ready wait task failed: {}", e)))?;

        match ready {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                let status = child.wait().await.ok().map(exit_code);
                return Err(CtrError::NamespaceError(format!(
                    "init stage for container {} failed before namespaces were ready (exit status {})",
                    config.id,
                    status.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
                )));
            }
        }

        let mut process = ContainerProcess::new(child, Some(sync_write))?;

        if let Some(user_ns) = &config.user_ns {
            if let Err(e) = user_ns.write_maps(process.pid()) {
                tracing::error!(
                    container = %config.id,
                    pid = process.pid(),
                    error = %e,
                    "User namespace mapping failed, killing child"
                );
                let _ = process.kill();
                let _ = process.wait().await;
                return Err(e);
            }
        }

        tracing::info!(
            container = %config.id,
            pid = process.pid(),
            namespaces = %config.namespaces.to_env_value(),
            "Container process spawned"
        );
        Ok(process)
    }
}
