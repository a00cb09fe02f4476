//! Namespace selection.

use std::collections::BTreeMap;
use std::path::Path;

use a3s_ctr_core::error::{CtrError, Result};
use a3s_ctr_core::network::NetworkMode;
use serde::{Deserialize, Serialize};

#[cfg(target_os = "linux")]
use nix::sched::CloneFlags;

/// Namespaces a container process is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Separate filesystem view
    pub mount: bool,
    /// Separate process tree
    pub pid: bool,
    /// Separate hostname
    pub uts: bool,
    /// Separate network stack
    pub net: bool,
    /// Separate user and group IDs
    pub user: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            mount: true,
            pid: true,
            uts: true,
            net: false,
            user: false,
        }
    }
}

impl NamespaceConfig {
    /// PID, UTS and mount always; network when the mode needs it; user
    /// only when ID mappings are configured.
    pub fn for_container(network: &NetworkMode, user_mappings: bool) -> Self {
        Self {
            net: network.needs_network_namespace(),
            user: user_mappings,
            ..Self::default()
        }
    }

    /// No namespaces at all.
    pub fn none() -> Self {
        Self {
            mount: false,
            pid: false,
            uts: false,
            net: false,
            user: false,
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        [
            (self.user, "user"),
            (self.mount, "mount"),
            (self.pid, "pid"),
            (self.uts, "uts"),
            (self.net, "net"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }

    /// Comma-separated form used in the init environment.
    pub fn to_env_value(&self) -> String {
        self.names().join(",")
    }

    pub fn from_env_value(value: &str) -> Result<Self> {
        let mut config = Self::none();
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name {
                "mount" => config.mount = true,
                "pid" => config.pid = true,
                "uts" => config.uts = true,
                "net" => config.net = true,
                "user" => config.user = true,
                other => {
                    return Err(CtrError::Validation(format!(
                        "unknown namespace '{}'",
                        other
                    )))
                }
            }
        }
        Ok(config)
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }

    /// Flags for `unshare(2)`.
    #[cfg(target_os = "linux")]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }
}

/// Namespace link targets of the current process, e.g.
/// `pid -> pid:[4026531836]`.
pub fn namespace_info() -> BTreeMap<String, String> {
    namespace_info_at(Path::new("/proc/self/ns"))
}

pub(crate) fn namespace_info_at(ns_dir: &Path) -> BTreeMap<String, String> {
    ["pid", "uts", "ipc", "net", "mnt", "user", "cgroup"]
        .iter()
        .filter_map(|ns| {
            std::fs::read_link(ns_dir.join(ns))
                .ok()
                .map(|target| (ns.to_string(), target.to_string_lossy().to_string()))
        })
        .collect()
}
