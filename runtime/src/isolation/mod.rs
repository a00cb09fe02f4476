//! Process isolation.
//!
//! A container process is started through an [`Isolator`]. On Linux with
//! the needed privileges this is [`NamespaceIsolator`], which re-executes
//! the current binary as `<exe> init` so that namespaces, mounts and the
//! chroot are in place before the target program runs. Elsewhere
//! [`DirectIsolator`] runs the command as a plain child process with the
//! same lifecycle contract.

mod direct;
pub mod init;
pub mod logs;
mod namespaces;
mod process;
pub mod protocol;
mod spawn;
pub mod userns;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use a3s_ctr_core::error::{CtrError, Result};
use async_trait::async_trait;

pub use direct::DirectIsolator;
pub use namespaces::{namespace_info, NamespaceConfig};
pub use process::{exit_code, terminate, ContainerProcess, Termination};
pub use spawn::NamespaceIsolator;
pub use userns::{IdMapping, UserNamespaceConfig};

use crate::rootfs::BindMount;

/// Everything needed to start one container process.
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    pub id: String,
    pub rootfs: PathBuf,
    pub hostname: Option<String>,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub work_dir: String,
    pub namespaces: NamespaceConfig,
    pub user_ns: Option<UserNamespaceConfig>,
    /// Directory for `stdout.log`/`stderr.log`; `None` inherits the
    /// caller's streams.
    pub log_dir: Option<PathBuf>,
    pub binds: Vec<BindMount>,
    /// Start in a new session so the process outlives the caller.
    pub detached: bool,
}

impl IsolationConfig {
    pub fn new(id: &str, rootfs: impl Into<PathBuf>, argv: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            rootfs: rootfs.into(),
            hostname: None,
            argv,
            env: BTreeMap::new(),
            work_dir: "/".to_string(),
            namespaces: NamespaceConfig::default(),
            user_ns: None,
            log_dir: None,
            binds: Vec::new(),
            detached: false,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.argv.is_empty() || self.argv[0].is_empty() {
            return Err(CtrError::Validation(format!(
                "container {} has no command to run",
                self.id
            )));
        }
        Ok(())
    }
}

/// Starts container processes.
#[async_trait]
pub trait Isolator: Send + Sync {
    /// Short name for logs and `inspect` output.
    fn name(&self) -> &'static str;

    /// Start the process. It does not run user code until
    /// [`ContainerProcess::release`] is called.
    async fn spawn(&self, config: &IsolationConfig) -> Result<ContainerProcess>;
}

/// Check whether namespace isolation can be used here.
pub fn namespace_support(user_ns: bool) -> Result<()> {
    namespace_support_at(Path::new("/proc"), user_ns)
}

pub(crate) fn namespace_support_at(proc_root: &Path, user_ns: bool) -> Result<()> {
    if !cfg!(target_os = "linux") {
        return Err(CtrError::unsupported(
            "namespaces",
            "only supported on Linux",
        ));
    }
    if !proc_root.join("self/ns/pid").exists() {
        return Err(CtrError::unsupported(
            "namespaces",
            format!("{} is missing", proc_root.join("self/ns/pid").display()),
        ));
    }
    if user_ns {
        return userns::validate_user_namespace_support_at(proc_root);
    }
    if !nix::unistd::geteuid().is_root() {
        return Err(CtrError::unsupported(
            "namespaces",
            "root privileges or user namespace mappings are required",
        ));
    }
    Ok(())
}

/// Pick the isolator for this host: namespaces when supported, direct
/// execution otherwise.
pub fn select_isolator(user_ns: bool) -> Box<dyn Isolator> {
    match namespace_support(user_ns).and_then(|_| NamespaceIsolator::from_current_exe()) {
        Ok(isolator) => {
            tracing::debug!(init = %isolator.init_binary().display(), "Using namespace isolation");
            Box::new(isolator)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Namespace isolation unavailable, using direct execution");
            Box::new(DirectIsolator::new())
        }
    }
}
