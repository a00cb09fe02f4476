//! Parent-to-init handoff.
//!
//! The parent re-executes its own binary as `<exe> init` and passes the
//! container setup through environment variables. Two pipes synchronise
//! the stages: the child writes one byte on the ready pipe once its
//! namespaces exist, and waits for one byte on the sync pipe before it
//! mounts, chroots and execs.

use std::collections::{BTreeMap, HashMap};
use std::os::fd::RawFd;
use std::path::PathBuf;

use a3s_ctr_core::error::{CtrError, Result};

use super::namespaces::NamespaceConfig;
use crate::rootfs::BindMount;

/// Argument that routes the binary into the init stage.
pub const INIT_MARKER: &str = "init";

pub const ENV_ROOTFS: &str = "A3S_CTR_ROOTFS";
pub const ENV_HOSTNAME: &str = "A3S_CTR_HOSTNAME";
pub const ENV_WORKDIR: &str = "A3S_CTR_WORKDIR";
pub const ENV_SYNC_FD: &str = "A3S_CTR_SYNC_FD";
pub const ENV_READY_FD: &str = "A3S_CTR_READY_FD";
pub const ENV_ENV: &str = "A3S_CTR_ENV";
pub const ENV_ARGV: &str = "A3S_CTR_ARGV";
pub const ENV_NAMESPACES: &str = "A3S_CTR_NAMESPACES";
pub const ENV_BINDS: &str = "A3S_CTR_BINDS";
pub const ENV_LOG_DIR: &str = "A3S_CTR_LOG_DIR";
pub const ENV_NO_NEW_PRIVS: &str = "A3S_CTR_NO_NEW_PRIVS";

/// Byte written on either pipe to signal progress.
pub const GO_BYTE: u8 = b'1';

/// Everything the init stage needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSpec {
    pub rootfs: PathBuf,
    pub hostname: Option<String>,
    pub work_dir: String,
    pub sync_fd: RawFd,
    pub ready_fd: RawFd,
    /// Environment of the target program; the init environment itself is
    /// not inherited.
    pub env: BTreeMap<String, String>,
    pub argv: Vec<String>,
    pub namespaces: NamespaceConfig,
    pub binds: Vec<BindMount>,
    pub log_dir: Option<PathBuf>,
    pub no_new_privs: bool,
}

impl InitSpec {
    pub fn to_env(&self) -> Result<Vec<(String, String)>> {
        let mut vars = vec![
            (ENV_ROOTFS, self.rootfs.to_string_lossy().to_string()),
            (ENV_WORKDIR, self.work_dir.clone()),
            (ENV_SYNC_FD, self.sync_fd.to_string()),
            (ENV_READY_FD, self.ready_fd.to_string()),
            (ENV_ENV, serde_json::to_string(&self.env)?),
            (ENV_ARGV, serde_json::to_string(&self.argv)?),
            (ENV_NAMESPACES, self.namespaces.to_env_value()),
            (ENV_BINDS, serde_json::to_string(&self.binds)?),
            (ENV_NO_NEW_PRIVS, if self.no_new_privs { "1" } else { "0" }.to_string()),
        ];
        if let Some(hostname) = &self.hostname {
            vars.push((ENV_HOSTNAME, hostname.clone()));
        }
        if let Some(log_dir) = &self.log_dir {
            vars.push((ENV_LOG_DIR, log_dir.to_string_lossy().to_string()));
        }
        Ok(vars.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    /// Read the init instructions from the current process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_env_map(&std::env::vars().collect())
    }

    pub fn from_env_map(vars: &HashMap<String, String>) -> Result<Self> {
        let required = |key: &str| {
            vars.get(key).cloned().ok_or_else(|| {
                CtrError::ConfigError(format!("init stage: {} is not set", key))
            })
        };
        let fd = |key: &str| -> Result<RawFd> {
            let raw = required(key)?;
            raw.parse().map_err(|_| {
                CtrError::ConfigError(format!("init stage: invalid {} '{}'", key, raw))
            })
        };

        let argv: Vec<String> = serde_json::from_str(&required(ENV_ARGV)?)?;
        if argv.is_empty() {
            return Err(CtrError::Validation("no command to execute".to_string()));
        }

        Ok(Self {
            rootfs: PathBuf::from(required(ENV_ROOTFS)?),
            hostname: vars.get(ENV_HOSTNAME).filter(|h| !h.is_empty()).cloned(),
            work_dir: vars
                .get(ENV_WORKDIR)
                .filter(|w| !w.is_empty())
                .cloned()
                .unwrap_or_else(|| "/".to_string()),
            sync_fd: fd(ENV_SYNC_FD)?,
            ready_fd: fd(ENV_READY_FD)?,
            env: match vars.get(ENV_ENV) {
                Some(raw) => serde_json::from_str(raw)?,
                None => BTreeMap::new(),
            },
            argv,
            namespaces: NamespaceConfig::from_env_value(
                vars.get(ENV_NAMESPACES).map(String::as_str).unwrap_or(""),
            )?,
            binds: match vars.get(ENV_BINDS) {
                Some(raw) => serde_json::from_str(raw)?,
                None => Vec::new(),
            },
            log_dir: vars.get(ENV_LOG_DIR).filter(|d| !d.is_empty()).map(PathBuf::from),
            no_new_privs: vars.get(ENV_NO_NEW_PRIVS).map(|v| v == "1").unwrap_or(false),
        })
    }
}
