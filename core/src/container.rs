//! Container state record and status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{CtrError, Result};
use crate::network::{NetworkEndpoint, NetworkMode, PortMapping};

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Exited,
}

impl ContainerStatus {
    fn rank(&self) -> u8 {
        match self {
            ContainerStatus::Created => 0,
            ContainerStatus::Running => 1,
            ContainerStatus::Stopped | ContainerStatus::Exited => 2,
        }
    }

    /// Transitions never move backwards: created, then running, then
    /// stopped or exited. Same-rank moves are allowed.
    pub fn can_transition_to(&self, next: ContainerStatus) -> bool {
        next.rank() >= self.rank()
    }

    /// Whether the container has finished running.
    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Exited => "exited",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = CtrError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(ContainerStatus::Created),
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "exited" => Ok(ContainerStatus::Exited),
            other => Err(CtrError::Validation(format!(
                "unknown container status '{}'",
                other
            ))),
        }
    }
}

/// Persistent state of a container, one JSON file per record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub image: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub status: ContainerStatus,
    /// Host PID of the container's init process (0 when not running).
    #[serde(default)]
    pub pid: i32,
    #[serde(default)]
    pub exit_code: i32,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished: Option<DateTime<Utc>>,
    /// Container-private directory; the root filesystem is `<root_path>/rootfs`.
    pub root_path: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Host path or volume name -> container path.
    #[serde(default)]
    pub volumes: HashMap<String, String>,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub network: Option<NetworkEndpoint>,
    /// Memory limit as given by the user (e.g. "128m").
    #[serde(default)]
    pub memory: String,
    /// CPU limit as given by the user (e.g. "1.5").
    #[serde(default)]
    pub cpus: String,
}

impl ContainerState {
    /// A fresh record in `created` status.
    pub fn new(id: &str, name: &str, image: &str, command: &str, root_path: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            image: image.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            status: ContainerStatus::Created,
            pid: 0,
            exit_code: 0,
            created: Utc::now(),
            started: None,
            finished: None,
            root_path: root_path.to_string(),
            hostname: String::new(),
            work_dir: String::new(),
            env: HashMap::new(),
            volumes: HashMap::new(),
            network_mode: NetworkMode::default(),
            port_mappings: Vec::new(),
            network: None,
            memory: String::new(),
            cpus: String::new(),
        }
    }

    /// First 12 characters of the ID.
    pub fn short_id(&self) -> &str {
        crate::id::short_id(&self.id)
    }

    /// Apply a status change with its timestamp side effects.
    ///
    /// `running` sets `started` only if unset; `stopped`/`exited` always
    /// refresh `finished`.
    pub fn transition(&mut self, status: ContainerStatus) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(CtrError::Validation(format!(
                "container {} cannot move from {} to {}",
                self.short_id(),
                self.status,
                status
            )));
        }

        self.status = status;
        match status {
            ContainerStatus::Running => {
                if self.started.is_none() {
                    self.started = Some(Utc::now());
                }
            }
            ContainerStatus::Stopped | ContainerStatus::Exited => {
                self.finished = Some(Utc::now());
            }
            ContainerStatus::Created => {}
        }
        Ok(())
    }
}
