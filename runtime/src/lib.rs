//! A3S container runtime.
//!
//! Pulls and imports images, assembles per-container root filesystems,
//! starts processes in isolated namespaces with cgroup limits and bridge
//! addresses, and keeps one persistent state record per container.

#![allow(clippy::result_large_err)]

pub mod cgroup;
pub mod container;
pub mod image;
pub mod ipam;
pub mod isolation;
pub mod rootfs;
pub mod state;
pub mod volume;

pub use cgroup::{select_limits_controller, CgroupV1, LimitsController, UnsupportedLimits};
pub use container::{
    resolve_process, ContainerManager, ContainerStats, RunOutcome, RunSpec,
    START_FAILED_EXIT_CODE,
};
pub use image::{Image, ImageConfig, ImageDistributor, ImageReference, ImageStore};
pub use ipam::{select_allocator, AddressAllocator, Ipam};
pub use isolation::init::run_init;
pub use isolation::logs::{LogLine, LogStream};
pub use isolation::protocol::INIT_MARKER;
pub use isolation::{
    select_isolator, DirectIsolator, IdMapping, IsolationConfig, Isolator, NamespaceIsolator,
    UserNamespaceConfig,
};
pub use rootfs::{RootfsAssembler, RootfsSource};
pub use state::StateStore;
pub use volume::VolumeStore;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
