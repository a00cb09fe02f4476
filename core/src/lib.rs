//! A3S Ctr Core - Foundational Types
//!
//! Errors, configuration, container/network/volume records and the
//! identifier conventions shared by the runtime and its front-ends.

pub mod config;
pub mod container;
pub mod error;
pub mod id;
pub mod network;
pub mod resources;
pub mod volume;

// Re-export commonly used types
pub use config::{CgroupConfig, LogLevel, Platform, RegistryConfig, RuntimeConfig};
pub use container::{ContainerState, ContainerStatus};
pub use error::{CtrError, Result};
pub use network::{NetworkEndpoint, NetworkMode, PortMapping, Subnet};
pub use volume::{VolumeBinding, VolumeConfig};

/// A3S Ctr version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
