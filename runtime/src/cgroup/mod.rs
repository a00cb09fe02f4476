//! Per-container resource limits.
//!
//! `CgroupV1` drives the per-subsystem v1 hierarchy (`memory`, `cpu`,
//! `pids`) as plain files. Hosts without that hierarchy get
//! `UnsupportedLimits`, which fails every operation with an explicit
//! unsupported error so callers can decide to run without limits.

mod v1;

pub use v1::CgroupV1;

use std::collections::HashMap;
use std::path::Path;

use a3s_ctr_core::config::CgroupConfig;
use a3s_ctr_core::error::{CtrError, Result};

/// Subsystems a container group spans.
pub const SUBSYSTEMS: [&str; 3] = ["memory", "cpu", "pids"];

/// Resource-limit capability for one container.
pub trait LimitsController: Send + Sync {
    /// Create one directory per subsystem.
    fn create(&self) -> Result<()>;

    fn set_memory_limit(&self, limit_bytes: u64) -> Result<()>;

    /// CPU weight in `cpu.shares` units (1024 per CPU).
    fn set_cpu_limit(&self, shares: u64) -> Result<()>;

    fn set_pid_limit(&self, max: u64) -> Result<()>;

    /// Put `pid` into every subsystem. Must happen before the process runs
    /// user code.
    fn add_process(&self, pid: i32) -> Result<()>;

    /// Usage counters; missing counters are left out of the map.
    fn stats(&self) -> Result<HashMap<String, String>>;

    /// Remove the subsystem directories. Individual failures are logged.
    fn cleanup(&self) -> Result<()>;
}

/// Controller for hosts without a usable v1 hierarchy.
#[derive(Debug, Clone)]
pub struct UnsupportedLimits {
    reason: String,
}

impl UnsupportedLimits {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    fn error(&self) -> CtrError {
        CtrError::unsupported("cgroups", self.reason.clone())
    }
}

impl LimitsController for UnsupportedLimits {
    fn create(&self) -> Result<()> {
        Err(self.error())
    }

    fn set_memory_limit(&self, _limit_bytes: u64) -> Result<()> {
        Err(self.error())
    }

    fn set_cpu_limit(&self, _shares: u64) -> Result<()> {
        Err(self.error())
    }

    fn set_pid_limit(&self, _max: u64) -> Result<()> {
        Err(self.error())
    }

    fn add_process(&self, _pid: i32) -> Result<()> {
        Err(self.error())
    }

    fn stats(&self) -> Result<HashMap<String, String>> {
        Err(self.error())
    }

    fn cleanup(&self) -> Result<()> {
        Err(self.error())
    }
}

/// Whether `root` carries the v1 subsystems this controller needs.
pub fn detect_cgroup_v1(root: &Path) -> bool {
    SUBSYSTEMS.iter().all(|s| root.join(s).is_dir())
}

/// Pick the limits controller for `container_id` by probing the host.
pub fn select_limits_controller(
    config: &CgroupConfig,
    container_id: &str,
) -> Box<dyn LimitsController> {
    if cfg!(target_os = "linux") && detect_cgroup_v1(&config.root) {
        Box::new(CgroupV1::new(&config.root, &config.namespace, container_id))
    } else {
        tracing::debug!(
            root = %config.root.display(),
            "No cgroup v1 hierarchy, resource limits disabled"
        );
        Box::new(UnsupportedLimits::new(format!(
            "no cgroup v1 memory/cpu/pids hierarchy under {}",
            config.root.display()
        )))
    }
}
