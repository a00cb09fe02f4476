//! Mounts performed by the init stage inside a private mount namespace.
//!
//! Individual mount failures are logged and skipped; the container still
//! starts with whatever could be mounted.

use std::path::{Path, PathBuf};

use a3s_ctr_core::error::{CtrError, Result};
use serde::{Deserialize, Serialize};

/// One filesystem mounted under the container root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardMount {
    pub fstype: &'static str,
    /// Path relative to the container root.
    pub target: &'static str,
    pub data: Option<&'static str>,
    pub read_only: bool,
}

/// proc, sysfs, tmp and dev at their conventional paths.
pub const STANDARD_MOUNTS: &[StandardMount] = &[
    StandardMount {
        fstype: "proc",
        target: "proc",
        data: None,
        read_only: false,
    },
    StandardMount {
        fstype: "sysfs",
        target: "sys",
        data: None,
        read_only: true,
    },
    StandardMount {
        fstype: "tmpfs",
        target: "tmp",
        data: Some("mode=1777"),
        read_only: false,
    },
    StandardMount {
        fstype: "tmpfs",
        target: "dev",
        data: Some("mode=755"),
        read_only: false,
    },
];

/// Host device nodes bound into the container's `/dev`.
pub const DEVICE_NODES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

/// `/dev` convenience links.
pub const DEVICE_LINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

/// A bind mount from the host into the container root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    /// Absolute path inside the container.
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    /// Host-side path of the mount target under `root`.
    pub fn target_in(&self, root: &Path) -> PathBuf {
        root.join(self.target.trim_start_matches('/'))
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use nix::mount::{mount, MsFlags};

    /// Stop mount events propagating back to the host.
    pub fn make_mounts_private() -> Result<()> {
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )
        .map_err(|e| CtrError::NamespaceError(format!("failed to make / private: {}", e)))
    }

    /// Mount the standard filesystems under `root`. Returns the targets
    /// that failed.
    pub fn setup_mounts(root: &Path) -> Vec<String> {
        let mut failed = Vec::new();
        for m in STANDARD_MOUNTS {
            let target = root.join(m.target);
            if let Err(e) = std::fs::create_dir_all(&target) {
                tracing::warn!(target = %target.display(), error = %e, "Failed to create mount point");
                failed.push(m.target.to_string());
                continue;
            }
            let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
            if m.fstype == "tmpfs" {
                flags = MsFlags::MS_NOSUID;
            }
            if m.read_only {
                flags |= MsFlags::MS_RDONLY;
            }
            match mount(Some(m.fstype), &target, Some(m.fstype), flags, m.data) {
                Ok(()) => tracing::debug!(fstype = m.fstype, target = %target.display(), "Mounted"),
                Err(e) => {
                    tracing::warn!(
                        fstype = m.fstype,
                        target = %target.display(),
                        error = %e,
                        "Mount failed, continuing"
                    );
                    failed.push(m.target.to_string());
                }
            }
        }

        if !failed.iter().any(|t| t == "dev") {
            populate_dev(&root.join("dev"));
        }
        failed
    }

    fn populate_dev(dev: &Path) {
        for node in DEVICE_NODES {
            let host = Path::new("/dev").join(node);
            let target = dev.join(node);
            if !host.exists() {
                continue;
            }
            let result = std::fs::File::create(&target)
                .map_err(|e| e.to_string())
                .and_then(|_| {
                    mount(
                        Some(&host),
                        &target,
                        None::<&str>,
                        MsFlags::MS_BIND,
                        None::<&str>,
                    )
                    .map_err(|e| e.to_string())
                });
            if let Err(e) = result {
                tracing::warn!(device = %host.display(), error = %e, "Failed to bind device node");
            }
        }
        for (name, target) in DEVICE_LINKS {
            if let Err(e) = std::os::unix::fs::symlink(target, dev.join(name)) {
                tracing::debug!(link = name, error = %e, "Failed to create /dev link");
            }
        }
        let _ = std::fs::create_dir_all(dev.join("pts"));
        let _ = std::fs::create_dir_all(dev.join("shm"));
    }

    /// Bind `mount.source` into the root, read-only if requested.
    pub fn bind_mount(root: &Path, bind: &BindMount) -> Result<()> {
        let target = bind.target_in(root);
        let created = if bind.source.is_dir() {
            std::fs::create_dir_all(&target)
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(CtrError::io(format!("failed to create {}", parent.display())))?;
            }
            std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&target)
                .map(|_| ())
        };
        created.map_err(CtrError::io(format!(
            "failed to create mount point {}",
            target.display()
        )))?;

        mount(
            Some(&bind.source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| {
            CtrError::NamespaceError(format!(
                "failed to bind {} to {}: {}",
                bind.source.display(),
                bind.target,
                e
            ))
        })?;

        if bind.read_only {
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(|e| {
                CtrError::NamespaceError(format!("failed to remount {} read-only: {}", bind.target, e))
            })?;
        }
        Ok(())
    }

    /// Change root to `root` and move to its `/`.
    pub fn enter_chroot(root: &Path) -> Result<()> {
        nix::unistd::chroot(root).map_err(|e| {
            CtrError::NamespaceError(format!("chroot to {} failed: {}", root.display(), e))
        })?;
        nix::unistd::chdir("/")
            .map_err(|e| CtrError::NamespaceError(format!("chdir to / failed: {}", e)))
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn make_mounts_private() -> Result<()> {
        Err(CtrError::unsupported("mount namespaces", "only supported on Linux"))
    }

    pub fn setup_mounts(_root: &Path) -> Vec<String> {
        tracing::warn!("Mount setup skipped: not supported on this platform");
        STANDARD_MOUNTS.iter().map(|m| m.target.to_string()).collect()
    }

    pub fn bind_mount(_root: &Path, _bind: &BindMount) -> Result<()> {
        Err(CtrError::unsupported("bind mounts", "only supported on Linux"))
    }

    pub fn enter_chroot(root: &Path) -> Result<()> {
        nix::unistd::chroot(root).map_err(|e| {
            CtrError::NamespaceError(format!("chroot to {} failed: {}", root.display(), e))
        })?;
        nix::unistd::chdir("/")
            .map_err(|e| CtrError::NamespaceError(format!("chdir to / failed: {}", e)))
    }
}

pub use imp::{bind_mount, enter_chroot, make_mounts_private, setup_mounts};
