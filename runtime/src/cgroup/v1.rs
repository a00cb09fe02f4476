//! Cgroup v1 controller.
//!
//! Layout: `<root>/<subsystem>/<namespace>/<container_id>/` for each of
//! `memory`, `cpu` and `pids`. Every control file takes a single decimal
//! value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use a3s_ctr_core::error::{CtrError, Result};

use super::{LimitsController, SUBSYSTEMS};

/// Stats key to (subsystem, counter file).
const COUNTERS: [(&str, &str, &str); 3] = [
    ("memory_usage", "memory", "memory.usage_in_bytes"),
    ("cpu_usage", "cpu", "cpuacct.usage"),
    ("pids_current", "pids", "pids.current"),
];

/// One container's groups in a v1 hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupV1 {
    root: PathBuf,
    namespace: String,
    container_id: String,
}

impl CgroupV1 {
    pub fn new(root: &Path, namespace: &str, container_id: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            namespace: namespace.to_string(),
            container_id: container_id.to_string(),
        }
    }

    /// Group directory for one subsystem.
    pub fn subsystem_path(&self, subsystem: &str) -> PathBuf {
        self.root
            .join(subsystem)
            .join(&self.namespace)
            .join(&self.container_id)
    }

    fn write_control(&self, subsystem: &str, file: &str, value: u64) -> Result<()> {
        let path = self.subsystem_path(subsystem).join(file);
        std::fs::write(&path, value.to_string()).map_err(|e| {
            CtrError::CgroupError(format!("failed to write {}: {}", path.display(), e))
        })?;
        tracing::debug!(
            container = %self.container_id,
            file = %path.display(),
            value,
            "Wrote cgroup control file"
        );
        Ok(())
    }
}

impl LimitsController for CgroupV1 {
    fn create(&self) -> Result<()> {
        for subsystem in SUBSYSTEMS {
            let path = self.subsystem_path(subsystem);
            std::fs::create_dir_all(&path).map_err(|e| {
                CtrError::CgroupError(format!(
                    "failed to create cgroup directory {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
        tracing::debug!(container = %self.container_id, "Created cgroups");
        Ok(())
    }

    fn set_memory_limit(&self, limit_bytes: u64) -> Result<()> {
        self.write_control("memory", "memory.limit_in_bytes", limit_bytes)
    }

    fn set_cpu_limit(&self, shares: u64) -> Result<()> {
        self.write_control("cpu", "cpu.shares", shares)
    }

    fn set_pid_limit(&self, max: u64) -> Result<()> {
        self.write_control("pids", "pids.max", max)
    }

    fn add_process(&self, pid: i32) -> Result<()> {
        if pid <= 0 {
            return Err(CtrError::Validation(format!("invalid pid {}", pid)));
        }
        for subsystem in SUBSYSTEMS {
            let tasks = self.subsystem_path(subsystem).join("tasks");
            std::fs::write(&tasks, pid.to_string()).map_err(|e| {
                CtrError::CgroupError(format!(
                    "failed to add process {} to {} cgroup: {}",
                    pid, subsystem, e
                ))
            })?;
        }
        tracing::debug!(container = %self.container_id, pid, "Added process to cgroups");
        Ok(())
    }

    fn stats(&self) -> Result<HashMap<String, String>> {
        let mut stats = HashMap::new();
        for (key, subsystem, file) in COUNTERS {
            let path = self.subsystem_path(subsystem).join(file);
            match std::fs::read_to_string(&path) {
                Ok(value) => {
                    stats.insert(key.to_string(), value.trim().to_string());
                }
                Err(e) => {
                    tracing::debug!(file = %path.display(), error = %e, "Counter unavailable");
                }
            }
        }
        Ok(stats)
    }

    fn cleanup(&self) -> Result<()> {
        for subsystem in SUBSYSTEMS {
            let path = self.subsystem_path(subsystem);
            if !path.exists() {
                continue;
            }
            // Real cgroupfs only allows rmdir on the group itself.
            let result = std::fs::remove_dir(&path).or_else(|_| std::fs::remove_dir_all(&path));
            if let Err(e) = result {
                tracing::warn!(
                    container = %self.container_id,
                    path = %path.display(),
                    error = %e,
                    "Failed to remove cgroup"
                );
            }
        }
        Ok(())
    }
}
