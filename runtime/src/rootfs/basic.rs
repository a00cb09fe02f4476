//! Minimal synthetic root used when no image root can be copied.
//!
//! Creates:
//! - A conventional directory skeleton
//! - passwd/group/hosts/resolv.conf/nsswitch.conf
//! - Best-effort copies of a few host shell binaries

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use a3s_ctr_core::error::{CtrError, Result};

/// Directories every synthetic root gets.
pub const BASIC_DIRS: &[&str] = &[
    "bin", "dev", "etc", "home", "lib", "lib64", "proc", "root", "run", "sbin", "sys", "tmp",
    "usr/bin", "usr/lib", "usr/sbin", "var/log", "var/tmp",
];

/// Host binaries copied when present.
pub const HOST_BINARIES: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/busybox",
    "/bin/ls",
    "/bin/cat",
    "/bin/echo",
    "/usr/bin/env",
];

/// Builder for the synthetic root.
pub struct BasicRootfs {
    root: PathBuf,
    hostname: Option<String>,
    binaries: Vec<PathBuf>,
}

impl BasicRootfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            hostname: None,
            binaries: HOST_BINARIES.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Override the host binaries to copy.
    pub fn with_binaries(mut self, binaries: Vec<PathBuf>) -> Self {
        self.binaries = binaries;
        self
    }

    /// Build the root. Returns how many host binaries were copied.
    pub fn build(&self) -> Result<usize> {
        tracing::info!(rootfs = %self.root.display(), "Building basic rootfs");

        for dir in BASIC_DIRS {
            let path = self.root.join(dir);
            fs::create_dir_all(&path)
                .map_err(CtrError::io(format!("failed to create {}", path.display())))?;
        }
        fs::set_permissions(self.root.join("tmp"), fs::Permissions::from_mode(0o1777))
            .map_err(CtrError::io("failed to set /tmp permissions"))?;

        self.write_file(
            "etc/passwd",
            "root:x:0:0:root:/root:/bin/sh\nnobody:x:65534:65534:nobody:/:/bin/false\n",
        )?;
        self.write_file("etc/group", "root:x:0:\nnogroup:x:65534:\n")?;
        self.write_file("etc/hosts", "127.0.0.1\tlocalhost\n::1\t\tlocalhost\n")?;
        self.write_file("etc/resolv.conf", "nameserver 8.8.8.8\nnameserver 8.8.4.4\n")?;
        self.write_file("etc/nsswitch.conf", "passwd: files\ngroup: files\nhosts: files dns\n")?;
        if let Some(hostname) = &self.hostname {
            self.write_file("etc/hostname", &format!("{}\n", hostname))?;
        }

        let copied = self
            .binaries
            .iter()
            .filter(|b| self.copy_host_binary(b))
            .count();
        tracing::debug!(copied, "Copied host binaries into basic rootfs");
        Ok(copied)
    }

    fn copy_host_binary(&self, source: &Path) -> bool {
        if !source.is_file() {
            return false;
        }
        let relative = source.strip_prefix("/").unwrap_or(source);
        let dest = self.root.join(relative);
        if let Some(parent) = dest.parent() {
            if fs::create_dir_all(parent).is_err() {
                return false;
            }
        }
        // fs::copy follows symlinks such as /bin/sh -> dash.
        match fs::copy(source, &dest) {
            Ok(_) => {
                let _ = fs::set_permissions(&dest, fs::Permissions::from_mode(0o755));
                true
            }
            Err(e) => {
                tracing::debug!(src = %source.display(), error = %e, "Skipping host binary");
                false
            }
        }
    }

    fn write_file(&self, relative: &str, content: &str) -> Result<()> {
        let path = self.root.join(relative);
        fs::write(&path, content)
            .map_err(CtrError::io(format!("failed to write {}", path.display())))
    }
}
