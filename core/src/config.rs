//! Runtime configuration.
//!
//! Everything has a default; a YAML file (`$A3S_CTR_CONFIG` or
//! `<home>/config.yaml`) may override any subset of fields.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CtrError, Result};

/// Environment variable overriding the runtime home directory.
pub const HOME_ENV: &str = "A3S_CTR_HOME";

/// Environment variable pointing at a YAML config file.
pub const CONFIG_ENV: &str = "A3S_CTR_CONFIG";

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root of all runtime state (default `~/.a3s/ctr`).
    pub home: PathBuf,

    /// Per-container state files (`<id>.json`).
    pub state_dir: PathBuf,

    /// Container roots live at `<data_dir>/containers/<id>/rootfs`.
    pub data_dir: PathBuf,

    /// Image index and extracted image roots.
    pub image_dir: PathBuf,

    /// Named volume data.
    pub volume_dir: PathBuf,

    /// Container stdout/stderr logs.
    pub log_dir: PathBuf,

    /// Registry access
    pub registry: RegistryConfig,

    /// Cgroup layout and defaults
    pub cgroup: CgroupConfig,

    /// Default network settings
    pub network: NetworkDefaults,

    /// Seconds between SIGTERM and SIGKILL when stopping a container.
    pub stop_timeout_secs: u64,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::with_home(default_home())
    }
}

impl RuntimeConfig {
    /// Build a configuration rooted at `home` with derived directories.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            state_dir: home.join("containers").join("state"),
            data_dir: home.clone(),
            image_dir: home.join("images"),
            volume_dir: home.join("volumes"),
            log_dir: home.join("logs"),
            home,
            registry: RegistryConfig::default(),
            cgroup: CgroupConfig::default(),
            network: NetworkDefaults::default(),
            stop_timeout_secs: 10,
            log_level: LogLevel::Warn,
        }
    }

    /// Load a YAML configuration file.
    ///
    /// Directory fields that are absent or empty are derived from `home`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(CtrError::io(format!("failed to read config {}", path.display())))?;
        let mut config: RuntimeConfig = serde_yaml::from_str(&data)
            .map_err(|e| CtrError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.fill_derived_dirs();
        Ok(config)
    }

    /// Resolve the configuration from the environment.
    ///
    /// `$A3S_CTR_CONFIG` wins, then `<home>/config.yaml`, then defaults.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }

        let defaults = Self::default();
        let candidate = defaults.home.join("config.yaml");
        if candidate.exists() {
            return Self::load(&candidate);
        }
        Ok(defaults)
    }

    /// Directory holding one container's private tree.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.data_dir.join("containers").join(id)
    }

    /// Directory holding one container's log files.
    pub fn container_log_dir(&self, id: &str) -> PathBuf {
        self.log_dir.join(id)
    }

    fn fill_derived_dirs(&mut self) {
        let derived = Self::with_home(self.home.clone());
        let defaults = Self::default();

        // Fields still at their home-independent default follow `home`.
        for (field, derived_value, default_value) in [
            (&mut self.state_dir, derived.state_dir, defaults.state_dir),
            (&mut self.data_dir, derived.data_dir, defaults.data_dir),
            (&mut self.image_dir, derived.image_dir, defaults.image_dir),
            (&mut self.volume_dir, derived.volume_dir, defaults.volume_dir),
            (&mut self.log_dir, derived.log_dir, defaults.log_dir),
        ] {
            if field.as_os_str().is_empty() || *field == default_value {
                *field = derived_value;
            }
        }
    }
}

fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    dirs::home_dir()
        .map(|h| h.join(".a3s"))
        .unwrap_or_else(|| PathBuf::from(".a3s"))
        .join("ctr")
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Base URL used for Docker Hub references.
    pub url: String,

    /// Token endpoint for Docker Hub.
    pub auth_url: String,

    /// `service` parameter sent to the token endpoint.
    pub service: String,

    /// HTTP client timeout.
    pub timeout_secs: u64,

    /// Preferred platform when resolving manifest lists.
    pub platform: Platform,

    /// Registry hosts reached over plain HTTP.
    pub insecure_registries: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "https://registry-1.docker.io".to_string(),
            auth_url: "https://auth.docker.io/token".to_string(),
            service: "registry.docker.io".to_string(),
            timeout_secs: 30,
            platform: Platform::default(),
            insecure_registries: Vec::new(),
        }
    }
}

/// Target platform for image resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Cgroup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// Mount point of the per-subsystem hierarchies.
    pub root: PathBuf,

    /// Parent group under each subsystem.
    pub namespace: String,

    /// Process-count cap applied to every container.
    pub default_pid_limit: u64,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/sys/fs/cgroup"),
            namespace: "a3s-ctr".to_string(),
            default_pid_limit: 1024,
        }
    }
}

/// Network defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDefaults {
    /// Subnet used by the default bridge network.
    pub subnet: String,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            subnet: "172.17.0.0/16".to_string(),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl LogLevel {
    /// Directive string for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_home_derives_dirs() {
        let config = RuntimeConfig::with_home("/var/lib/a3s-ctr");
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/a3s-ctr/containers/state"));
        assert_eq!(config.image_dir, PathBuf::from("/var/lib/a3s-ctr/images"));
        assert_eq!(config.volume_dir, PathBuf::from("/var/lib/a3s-ctr/volumes"));
        assert_eq!(config.log_dir, PathBuf::from("/var/lib/a3s-ctr/logs"));
        assert_eq!(
            config.container_dir("abc"),
            PathBuf::from("/var/lib/a3s-ctr/containers/abc")
        );
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::with_home("/tmp/x");
        assert_eq!(config.registry.url, "https://registry-1.docker.io");
        assert_eq!(config.registry.timeout_secs, 30);
        assert_eq!(config.registry.platform.to_string(), "linux/amd64");
        assert_eq!(config.cgroup.root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(config.cgroup.default_pid_limit, 1024);
        assert_eq!(config.network.subnet, "172.17.0.0/16");
        assert_eq!(config.stop_timeout_secs, 10);
        assert_eq!(config.log_level, LogLevel::Warn);
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let home = dir.path().join("home");
        std::fs::write(
            &path,
            format!(
                "home: {}\nstop_timeout_secs: 3\ncgroup:\n  namespace: test-ns\nlog_level: debug\n",
                home.display()
            ),
        )
        .unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.stop_timeout_secs, 3);
        assert_eq!(config.cgroup.namespace, "test-ns");
        assert_eq!(config.cgroup.default_pid_limit, 1024);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.image_dir, home.join("images"));
        assert_eq!(config.state_dir, home.join("containers").join("state"));
    }

    #[test]
    fn test_load_explicit_dir_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "home: /srv/ctr\nimage_dir: /mnt/images\n").unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.image_dir, PathBuf::from("/mnt/images"));
        assert_eq!(config.log_dir, PathBuf::from("/srv/ctr/logs"));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "stop_timeout_secs: [not a number").unwrap();

        let err = RuntimeConfig::load(&path).unwrap_err();
        assert!(matches!(err, CtrError::ConfigError(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RuntimeConfig::load(Path::new("/nonexistent/a3s-ctr.yaml")).unwrap_err();
        assert!(matches!(err, CtrError::Io { .. }));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Debug), tracing::Level::DEBUG);
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
        assert_eq!(LogLevel::Info.as_filter(), "info");
    }
}
