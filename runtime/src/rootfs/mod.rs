//! Container root filesystem assembly.
//!
//! Each container gets a private copy of its image root at
//! `<data_dir>/containers/<id>/rootfs`. When the image root cannot be
//! copied the container still starts on a synthetic basic root.

mod basic;
mod copy;
pub mod mounts;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use a3s_ctr_core::config::RuntimeConfig;
use a3s_ctr_core::error::{CtrError, Result};

pub use basic::{BasicRootfs, BASIC_DIRS, HOST_BINARIES};
pub use copy::{copy_tree, CopyStats};
pub use mounts::{bind_mount, enter_chroot, make_mounts_private, setup_mounts, BindMount};

/// Where a container root came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootfsSource {
    Image,
    Basic,
}

/// Builds and tears down one container's private tree.
#[derive(Debug, Clone)]
pub struct RootfsAssembler {
    container_dir: PathBuf,
    root: PathBuf,
    host_binaries: Option<Vec<PathBuf>>,
}

impl RootfsAssembler {
    pub fn new(container_dir: impl Into<PathBuf>) -> Self {
        let container_dir = container_dir.into();
        Self {
            root: container_dir.join("rootfs"),
            container_dir,
            host_binaries: None,
        }
    }

    pub fn for_container(config: &RuntimeConfig, id: &str) -> Self {
        Self::new(config.container_dir(id))
    }

    /// Host binaries used by the basic fallback.
    pub fn with_host_binaries(mut self, binaries: Vec<PathBuf>) -> Self {
        self.host_binaries = Some(binaries);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_dir(&self) -> &Path {
        &self.container_dir
    }

    /// Materialise the root from `image_root`, or a basic root when there
    /// is no image or the copy fails.
    pub fn create(&self, image_root: Option<&Path>, hostname: Option<&str>) -> Result<RootfsSource> {
        if self.root.exists() {
            remove_tree(&self.root)?;
        }

        let source = match image_root {
            Some(src) => match copy_tree(src, &self.root) {
                Ok(stats) => {
                    tracing::info!(
                        image_root = %src.display(),
                        rootfs = %self.root.display(),
                        files = stats.files,
                        dirs = stats.dirs,
                        symlinks = stats.symlinks,
                        "Copied image root"
                    );
                    RootfsSource::Image
                }
                Err(e) => {
                    tracing::warn!(
                        image_root = %src.display(),
                        error = %e,
                        "Image root copy failed, falling back to basic rootfs"
                    );
                    if self.root.exists() {
                        remove_tree(&self.root)?;
                    }
                    self.build_basic()?;
                    RootfsSource::Basic
                }
            },
            None => {
                self.build_basic()?;
                RootfsSource::Basic
            }
        };

        if let Some(hostname) = hostname {
            let path = self.root.join("etc/hostname");
            if let Err(e) = fs::create_dir_all(self.root.join("etc"))
                .and_then(|_| fs::write(&path, format!("{}\n", hostname)))
            {
                tracing::warn!(path = %path.display(), error = %e, "Failed to write hostname file");
            }
        }
        Ok(source)
    }

    fn build_basic(&self) -> Result<()> {
        let mut builder = BasicRootfs::new(&self.root);
        if let Some(binaries) = &self.host_binaries {
            builder = builder.with_binaries(binaries.clone());
        }
        builder.build().map(|_| ())
    }

    /// Delete the container's private tree. Missing trees are fine.
    pub fn cleanup(&self) -> Result<()> {
        if fs::symlink_metadata(&self.container_dir).is_err() {
            return Ok(());
        }
        remove_tree(&self.container_dir)?;
        tracing::debug!(dir = %self.container_dir.display(), "Removed container directory");
        Ok(())
    }
}

/// `remove_dir_all`, retrying once after making directories writable.
fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            make_dirs_writable(path);
            fs::remove_dir_all(path)
                .map_err(CtrError::io(format!("failed to remove {}", path.display())))
        }
        Err(e) => Err(CtrError::Io {
            context: format!("failed to remove {}", path.display()),
            source: e,
        }),
    }
}

fn make_dirs_writable(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return;
    };
    if !meta.is_dir() {
        return;
    }
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o755));
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            make_dirs_writable(&entry.path());
        }
    }
}
