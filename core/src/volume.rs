//! Volume types for named volumes and container bind specs.
//!
//! Named volumes are directories managed by the runtime; bindings map a
//! named volume or host path onto a path inside the container root.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{CtrError, Result};

/// Configuration for a named volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume name (unique identifier).
    pub name: String,

    /// Volume driver (currently only "local" is supported).
    #[serde(default = "default_driver")]
    pub driver: String,

    /// Host path where volume data is stored.
    pub mount_point: String,

    /// User-defined labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,

    /// Driver options.
    #[serde(default)]
    pub options: HashMap<String, String>,

    /// Container IDs currently using this volume.
    #[serde(default)]
    pub in_use_by: Vec<String>,

    /// Creation timestamp (RFC 3339).
    pub created_at: String,
}

fn default_driver() -> String {
    "local".to_string()
}

impl VolumeConfig {
    /// Create a new named volume.
    pub fn new(name: &str, mount_point: &str) -> Self {
        Self {
            name: name.to_string(),
            driver: default_driver(),
            mount_point: mount_point.to_string(),
            labels: HashMap::new(),
            options: HashMap::new(),
            in_use_by: Vec::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Mark a container as using this volume.
    pub fn attach(&mut self, container_id: &str) {
        if !self.in_use_by.iter().any(|id| id == container_id) {
            self.in_use_by.push(container_id.to_string());
        }
    }

    /// Remove a container from this volume's users.
    pub fn detach(&mut self, container_id: &str) {
        self.in_use_by.retain(|id| id != container_id);
    }

    /// Check if any containers are using this volume.
    pub fn is_in_use(&self) -> bool {
        !self.in_use_by.is_empty()
    }
}

/// Reject names that are empty or would escape the volume directory.
pub fn validate_volume_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CtrError::Validation("volume name cannot be empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(CtrError::Validation(format!(
            "volume name '{}' cannot contain path separators",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(CtrError::Validation(format!("invalid volume name '{}'", name)));
    }
    Ok(())
}

/// A `source:target[:ro]` binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBinding {
    /// Host path (absolute) or named volume.
    pub source: String,
    /// Absolute path inside the container.
    pub target: String,
    pub read_only: bool,
}

impl VolumeBinding {
    /// Whether the source names a managed volume rather than a host path.
    pub fn is_named(&self) -> bool {
        !self.source.starts_with('/') && !self.source.starts_with('.')
    }
}

impl FromStr for VolumeBinding {
    type Err = CtrError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => {
                return Err(CtrError::Validation(format!(
                    "invalid volume binding '{}' (expected source:target[:ro])",
                    s
                )))
            }
        };

        if source.is_empty() {
            return Err(CtrError::Validation(format!("empty volume source in '{}'", s)));
        }
        if !target.starts_with('/') {
            return Err(CtrError::Validation(format!(
                "volume target '{}' must be an absolute path",
                target
            )));
        }

        Ok(VolumeBinding {
            source: source.to_string(),
            target: target.to_string(),
            read_only,
        })
    }
}
