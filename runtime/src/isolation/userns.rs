//! User namespace ID mappings.

use std::path::Path;
use std::str::FromStr;

use a3s_ctr_core::error::{CtrError, Result};
use serde::{Deserialize, Serialize};

/// One `uid_map`/`gid_map` line: `container host size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl IdMapping {
    pub fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }
}

impl FromStr for IdMapping {
    type Err = CtrError;

    /// Parse `container:host:size`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let [container, host, size] = parts.as_slice() else {
            return Err(CtrError::Validation(format!(
                "invalid ID mapping '{}': expected container:host:size",
                s
            )));
        };
        let num = |v: &&str, what: &str| {
            v.parse::<u32>().map_err(|_| {
                CtrError::Validation(format!("invalid {} '{}' in ID mapping '{}'", what, v, s))
            })
        };
        let mapping = IdMapping::new(
            num(container, "container ID")?,
            num(host, "host ID")?,
            num(size, "size")?,
        );
        if mapping.size == 0 {
            return Err(CtrError::Validation(format!(
                "ID mapping '{}' has zero size",
                s
            )));
        }
        Ok(mapping)
    }
}

/// UID and GID maps written for a container's user namespace.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserNamespaceConfig {
    pub uid_mappings: Vec<IdMapping>,
    pub gid_mappings: Vec<IdMapping>,
    /// Set `no_new_privs` before exec.
    #[serde(default)]
    pub no_new_privs: bool,
}

impl UserNamespaceConfig {
    /// The current user and group mapped to themselves.
    pub fn rootless() -> Self {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        Self {
            uid_mappings: vec![IdMapping::new(uid, uid, 1)],
            gid_mappings: vec![IdMapping::new(gid, gid, 1)],
            no_new_privs: true,
        }
    }

    /// Container root mapped to the current user, followed by the user's
    /// subordinate ranges from `/etc/subuid` and `/etc/subgid` starting at
    /// container ID 1.
    pub fn from_subordinate_ids(user: &str) -> Result<Self> {
        Self::from_subordinate_files(user, Path::new("/etc/subuid"), Path::new("/etc/subgid"))
    }

    pub fn from_subordinate_files(user: &str, subuid: &Path, subgid: &Path) -> Result<Self> {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();

        let read = |path: &Path| -> Result<Vec<IdMapping>> {
            let content = std::fs::read_to_string(path)
                .map_err(CtrError::io(format!("failed to read {}", path.display())))?;
            Ok(parse_subid_file(&content, user))
        };

        let mut config = Self {
            uid_mappings: vec![IdMapping::new(0, uid, 1)],
            gid_mappings: vec![IdMapping::new(0, gid, 1)],
            no_new_privs: true,
        };
        config.uid_mappings.extend(read(subuid)?.into_iter().take(1));
        config.gid_mappings.extend(read(subgid)?.into_iter().take(1));
        Ok(config)
    }

    /// Write the maps for `pid`: `uid_map`, `setgroups=deny`, `gid_map`.
    pub fn write_maps(&self, pid: i32) -> Result<()> {
        self.write_maps_under(Path::new("/proc"), pid)
    }

    pub(crate) fn write_maps_under(&self, proc_root: &Path, pid: i32) -> Result<()> {
        let dir = proc_root.join(pid.to_string());
        let write = |name: &str, content: String| -> Result<()> {
            let path = dir.join(name);
            std::fs::write(&path, content).map_err(|e| {
                CtrError::NamespaceError(format!("failed to write {}: {}", path.display(), e))
            })
        };

        if !self.uid_mappings.is_empty() {
            write("uid_map", render_map(&self.uid_mappings))?;
        }
        if !self.gid_mappings.is_empty() {
            write("setgroups", "deny".to_string())?;
            write("gid_map", render_map(&self.gid_mappings))?;
        }
        tracing::debug!(
            pid,
            uid_mappings = ?self.uid_mappings,
            gid_mappings = ?self.gid_mappings,
            "Wrote user namespace ID maps"
        );
        Ok(())
    }
}

/// Render mappings in `/proc/<pid>/uid_map` format.
pub fn render_map(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(|m| format!("{} {} {}\n", m.container_id, m.host_id, m.size))
        .collect()
}

/// `user:start:count` lines for `user`, mapped from container ID 1.
pub fn parse_subid_file(content: &str, user: &str) -> Vec<IdMapping> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let mut parts = line.split(':');
            let (name, start, count) = (parts.next()?, parts.next()?, parts.next()?);
            if name != user || parts.next().is_some() {
                return None;
            }
            Some(IdMapping::new(1, start.parse().ok()?, count.parse().ok()?))
        })
        .collect()
}

/// Check the host can create user namespaces.
pub fn validate_user_namespace_support() -> Result<()> {
    validate_user_namespace_support_at(Path::new("/proc"))
}

pub(crate) fn validate_user_namespace_support_at(proc_root: &Path) -> Result<()> {
    if !proc_root.join("self/ns/user").exists() {
        return Err(CtrError::unsupported(
            "user namespaces",
            "/proc/self/ns/user is missing",
        ));
    }
    let max = proc_root.join("sys/user/max_user_namespaces");
    if let Ok(content) = std::fs::read_to_string(&max) {
        if content.trim() == "0" {
            return Err(CtrError::unsupported(
                "user namespaces",
                "disabled (max_user_namespaces=0)",
            ));
        }
    }
    Ok(())
}
