//! Container lifecycle.
//!
//! `ContainerManager` ties the components together: image, state record,
//! root filesystem, limits, address, isolated process. The state record is
//! written at every step so other invocations see a consistent picture.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use a3s_ctr_core::config::{CgroupConfig, RuntimeConfig};
use a3s_ctr_core::container::{ContainerState, ContainerStatus};
use a3s_ctr_core::error::{CtrError, Result};
use a3s_ctr_core::id::{generate_container_id, generate_name};
use a3s_ctr_core::network::{NetworkEndpoint, NetworkMode, PortMapping, Subnet};
use a3s_ctr_core::resources::{cpus_to_shares, parse_memory_string};
use a3s_ctr_core::volume::VolumeBinding;
use parking_lot::Mutex;

use crate::cgroup::{select_limits_controller, LimitsController};
use crate::image::{Image, ImageConfig, ImageDistributor};
use crate::ipam::{select_allocator, AddressAllocator};
use crate::isolation::logs::{read_logs, LogLine};
use crate::isolation::{
    select_isolator, terminate, IsolationConfig, Isolator, NamespaceConfig, Termination,
    UserNamespaceConfig,
};
use crate::rootfs::{BindMount, RootfsAssembler};
use crate::state::StateStore;
use crate::volume::VolumeStore;

/// Exit code recorded when a container could not be started.
pub const START_FAILED_EXIT_CODE: i32 = 125;

/// Attempts at finding an unused generated name.
const NAME_ATTEMPTS: usize = 16;

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub image: String,
    pub name: Option<String>,
    pub hostname: Option<String>,
    /// Overrides the image entrypoint and cmd when non-empty.
    pub command: Vec<String>,
    /// Layered over the image environment.
    pub env: HashMap<String, String>,
    pub volumes: Vec<VolumeBinding>,
    pub ports: Vec<PortMapping>,
    pub network: NetworkMode,
    /// e.g. `128m`; empty for no limit.
    pub memory: String,
    /// e.g. `1.5`; empty for no limit.
    pub cpus: String,
    pub work_dir: Option<String>,
    pub detached: bool,
    pub user_ns: Option<UserNamespaceConfig>,
}

/// Result of [`ContainerManager::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Foreground run finished.
    Exited { id: String, exit_code: i32 },
    /// Detached run started.
    Detached { id: String, pid: i32 },
}

impl RunOutcome {
    pub fn id(&self) -> &str {
        match self {
            RunOutcome::Exited { id, .. } | RunOutcome::Detached { id, .. } => id,
        }
    }
}

/// Usage snapshot for `stats`.
#[derive(Debug, Clone)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub pid: i32,
    /// Memory limit as given at run, empty when unlimited.
    pub memory_limit: String,
    /// Raw counters keyed `memory_usage`, `cpu_usage`, `pids_current`.
    pub usage: HashMap<String, String>,
    /// `false` when the host has no usable cgroup hierarchy.
    pub limits_supported: bool,
}

/// Command, environment and working directory after applying image
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProcess {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub work_dir: String,
}

/// Merge caller settings over the image config.
pub fn resolve_process(spec: &RunSpec, image: &ImageConfig) -> Result<ResolvedProcess> {
    let argv = if spec.command.is_empty() {
        image.default_argv()
    } else {
        spec.command.clone()
    };
    if argv.is_empty() || argv[0].is_empty() {
        return Err(CtrError::Validation(format!(
            "no command specified and image {} has no default command",
            spec.image
        )));
    }

    let mut env: BTreeMap<String, String> = image.env_map().into_iter().collect();
    env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let work_dir = spec
        .work_dir
        .clone()
        .filter(|w| !w.is_empty())
        .or_else(|| Some(image.working_dir.clone()).filter(|w| !w.is_empty()))
        .unwrap_or_else(|| "/".to_string());

    Ok(ResolvedProcess {
        argv,
        env,
        work_dir,
    })
}

/// Resources held by a container outside its state file. Cheap to clone
/// so a detached waiter can own a copy.
#[derive(Clone)]
struct Resources {
    cgroup: CgroupConfig,
    subnet: String,
    state: StateStore,
    volumes: VolumeStore,
    ipam: Arc<dyn AddressAllocator>,
    /// Held while an address moves between the allocator and a state
    /// record, so a release never races a fresh claim of the same address.
    address_lock: Arc<Mutex<()>>,
}

impl Resources {
    fn limits(&self, id: &str) -> Box<dyn LimitsController> {
        select_limits_controller(&self.cgroup, id)
    }

    fn subnet(&self) -> Result<Subnet> {
        Subnet::parse(&self.subnet)
    }

    /// Release cgroup, address and volume claims. Failures are logged.
    fn release(&self, state: &ContainerState) {
        match self.limits(&state.id).cleanup() {
            Ok(()) => {}
            Err(e) if e.is_unsupported() => {}
            Err(e) => tracing::warn!(container = %state.short_id(), error = %e, "Cgroup cleanup failed"),
        }

        if let Some(endpoint) = &state.network {
            self.release_address(state, endpoint);
        }

        for (source, target) in &state.volumes {
            let binding = VolumeBinding {
                source: source.clone(),
                target: target.clone(),
                read_only: false,
            };
            if !binding.is_named() {
                continue;
            }
            if let Err(e) = self.volumes.detach(source, &state.id) {
                tracing::warn!(container = %state.short_id(), volume = %source, error = %e, "Volume detach failed");
            }
        }
    }

    /// Return the address to the allocator unless another live container
    /// records it. Stop and the exit callback may both release the same
    /// container; the second release must not free a reassigned address.
    fn release_address(&self, state: &ContainerState, endpoint: &NetworkEndpoint) {
        let _guard = self.address_lock.lock();
        match self.address_claimed_elsewhere(&state.id, endpoint) {
            Ok(false) => {}
            Ok(true) => {
                tracing::debug!(container = %state.short_id(), ip = %endpoint.ip_address, "Address already reassigned");
                return;
            }
            Err(e) => {
                tracing::warn!(container = %state.short_id(), error = %e, "Could not check address claims");
                return;
            }
        }
        let released = Subnet::parse(&endpoint.subnet)
            .and_then(|subnet| self.ipam.release(&subnet, endpoint.ip_address));
        if let Err(e) = released {
            tracing::debug!(container = %state.short_id(), error = %e, "Address release failed");
        }
    }

    fn address_claimed_elsewhere(&self, id: &str, endpoint: &NetworkEndpoint) -> Result<bool> {
        Ok(self.state.list()?.iter().any(|other| {
            other.id != id
                && !other.status.is_terminal()
                && other.network.as_ref().is_some_and(|n| {
                    n.ip_address == endpoint.ip_address && n.subnet == endpoint.subnet
                })
        }))
    }

    /// Allocate an address and record it on `state` in one step.
    fn claim_address(&self, state: &mut ContainerState, subnet: &Subnet) -> Result<()> {
        let _guard = self.address_lock.lock();
        let ip = self.ipam.allocate(subnet)?;
        state.network = Some(NetworkEndpoint::new(subnet, ip));
        if let Err(e) = self.state.save(state) {
            let _ = self.ipam.release(subnet, ip);
            state.network = None;
            return Err(e);
        }
        Ok(())
    }

    /// Record a process exit and release resources. A container already
    /// marked `stopped` keeps that status.
    fn finish(&self, id: &str, exit_code: i32) -> Result<ContainerState> {
        let current = self.state.load(id)?;
        let status = if current.status == ContainerStatus::Stopped {
            ContainerStatus::Stopped
        } else {
            ContainerStatus::Exited
        };
        let state = self.state.record_exit(id, exit_code, status)?;
        self.release(&state);
        tracing::info!(container = %state.short_id(), exit_code, status = %status, "Container finished");
        Ok(state)
    }
}

/// Drives container lifecycles.
pub struct ContainerManager {
    config: RuntimeConfig,
    images: ImageDistributor,
    resources: Resources,
    isolator: Option<Arc<dyn Isolator>>,
}

impl ContainerManager {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let allocator: Arc<dyn AddressAllocator> = Arc::from(select_allocator());
        Self::with_allocator(config, allocator)
    }

    /// Use a specific address allocator. Addresses recorded on running
    /// containers are reserved in it.
    pub fn with_allocator(config: RuntimeConfig, ipam: Arc<dyn AddressAllocator>) -> Result<Self> {
        let manager = Self {
            images: ImageDistributor::new(&config)?,
            resources: Resources {
                cgroup: config.cgroup.clone(),
                subnet: config.network.subnet.clone(),
                state: StateStore::new(&config.state_dir),
                volumes: VolumeStore::in_dir(&config.volume_dir),
                ipam,
                address_lock: Arc::new(Mutex::new(())),
            },
            config,
            isolator: None,
        };
        manager.reserve_existing_addresses();
        Ok(manager)
    }

    /// Always use `isolator` instead of probing the host.
    pub fn with_isolator(mut self, isolator: Arc<dyn Isolator>) -> Self {
        self.isolator = Some(isolator);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn images(&self) -> &ImageDistributor {
        &self.images
    }

    pub fn state(&self) -> &StateStore {
        &self.resources.state
    }

    pub fn volumes(&self) -> &VolumeStore {
        &self.resources.volumes
    }

    fn reserve_existing_addresses(&self) {
        let Ok(states) = self.resources.state.list() else {
            return;
        };
        for state in states.iter().filter(|s| s.status == ContainerStatus::Running) {
            let Some(endpoint) = &state.network else {
                continue;
            };
            let ip = endpoint.ip_address;
            let reserved = Subnet::parse(&endpoint.subnet)
                .and_then(|subnet| self.resources.ipam.reserve(&subnet, ip));
            if let Err(e) = reserved {
                tracing::debug!(container = %state.short_id(), ip = %ip, error = %e, "Could not reserve address");
            }
        }
    }

    /// Local image for `reference`, pulling it when missing.
    pub async fn ensure_image(&self, reference: &str) -> Result<Image> {
        match self.images.get(reference) {
            Ok(image) if image.rootfs_path.is_dir() => Ok(image),
            Ok(_) => self.images.pull(reference, true).await,
            Err(e) if e.is_not_found() => self.images.pull(reference, false).await,
            Err(e) => Err(e),
        }
    }

    fn unique_name(&self, requested: Option<&str>) -> Result<String> {
        if let Some(name) = requested.filter(|n| !n.is_empty()) {
            if self.resources.state.find_by_name(name)?.is_some() {
                return Err(CtrError::Conflict(format!(
                    "container name '{}' is already in use",
                    name
                )));
            }
            return Ok(name.to_string());
        }
        for _ in 0..NAME_ATTEMPTS {
            let name = generate_name();
            if self.resources.state.find_by_name(&name)?.is_none() {
                return Ok(name);
            }
        }
        Err(CtrError::Conflict(
            "could not generate an unused container name".to_string(),
        ))
    }

    /// Check host paths exist and named volumes are valid, without
    /// creating anything.
    fn check_volumes(&self, bindings: &[VolumeBinding]) -> Result<()> {
        for binding in bindings {
            if binding.is_named() {
                a3s_ctr_core::volume::validate_volume_name(&binding.source)?;
            } else if !PathBuf::from(&binding.source).exists() {
                return Err(CtrError::Validation(format!(
                    "bind source '{}' does not exist",
                    binding.source
                )));
            }
        }
        Ok(())
    }

    /// Run a container. See [`RunOutcome`].
    pub async fn run(&self, spec: RunSpec) -> Result<RunOutcome> {
        // Everything that can be rejected is checked before the record exists.
        let memory_bytes = parse_memory_string(&spec.memory)?;
        let cpu_shares = cpus_to_shares(&spec.cpus)?;
        self.check_volumes(&spec.volumes)?;
        let name = self.unique_name(spec.name.as_deref())?;

        let image = self.ensure_image(&spec.image).await?;
        let process = resolve_process(&spec, &image.config)?;

        let id = generate_container_id();
        let container_dir = self.config.container_dir(&id);
        let mut state = ContainerState::new(
            &id,
            &name,
            &spec.image,
            &process.argv[0],
            &container_dir.to_string_lossy(),
        );
        state.args = process.argv[1..].to_vec();
        state.hostname = spec
            .hostname
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| state.short_id().to_string());
        state.work_dir = process.work_dir.clone();
        state.env = process.env.clone().into_iter().collect();
        state.volumes = spec
            .volumes
            .iter()
            .map(|b| (b.source.clone(), b.target.clone()))
            .collect();
        state.network_mode = spec.network;
        state.port_mappings = spec.ports.clone();
        state.memory = spec.memory.clone();
        state.cpus = spec.cpus.clone();
        self.resources.state.create(&state)?;
        tracing::info!(container = %state.short_id(), name = %name, image = %spec.image, "Created container");

        match self
            .start(&mut state, &spec, &image, process, memory_bytes, cpu_shares)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(container = %state.short_id(), error = %e, "Container start failed");
                if let Err(record_err) = self.resources.finish(&id, START_FAILED_EXIT_CODE) {
                    tracing::warn!(container = %id, error = %record_err, "Failed to record start failure");
                }
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        state: &mut ContainerState,
        spec: &RunSpec,
        image: &Image,
        process: ResolvedProcess,
        memory_bytes: u64,
        cpu_shares: Option<u64>,
    ) -> Result<RunOutcome> {
        let id = state.id.clone();

        let assembler = RootfsAssembler::for_container(&self.config, &id);
        assembler.create(Some(image.rootfs_path.as_path()), Some(state.hostname.as_str()))?;

        let limits = self.resources.limits(&id);
        let limits_active = self.apply_limits(limits.as_ref(), &id, memory_bytes, cpu_shares)?;

        if spec.network.allocates_address() {
            let subnet = self.resources.subnet()?;
            match self.resources.claim_address(state, &subnet) {
                Ok(()) => {}
                Err(e) if e.is_unsupported() => {
                    tracing::warn!(container = %state.short_id(), error = %e, "Running without an address");
                }
                Err(e) => return Err(e),
            }
        }

        let binds = self.prepare_binds(&id, &spec.volumes)?;
        let log_dir = spec.detached.then(|| self.config.container_log_dir(&id));

        let isolation = IsolationConfig {
            id: id.clone(),
            rootfs: assembler.root().to_path_buf(),
            hostname: Some(state.hostname.clone()),
            argv: process.argv,
            env: process.env,
            work_dir: process.work_dir,
            namespaces: NamespaceConfig::for_container(&spec.network, spec.user_ns.is_some()),
            user_ns: spec.user_ns.clone(),
            log_dir,
            binds,
            detached: spec.detached,
        };

        let isolator = self.isolator(spec.user_ns.is_some());
        let mut child = isolator.spawn(&isolation).await?;
        let pid = child.pid();

        if limits_active {
            if let Err(e) = limits.add_process(pid) {
                let _ = child.kill();
                let _ = child.wait().await;
                return Err(e);
            }
        }
        child.release()?;

        state.transition(ContainerStatus::Running)?;
        state.pid = pid;
        self.resources.state.save(state)?;
        tracing::info!(
            container = %state.short_id(),
            pid,
            isolator = isolator.name(),
            detached = spec.detached,
            "Container running"
        );

        if spec.detached {
            let resources = self.resources.clone();
            let waiter_id = id.clone();
            child.detach(move |outcome| {
                let code = outcome.unwrap_or_else(|e| {
                    tracing::warn!(container = %waiter_id, error = %e, "Lost track of container process");
                    START_FAILED_EXIT_CODE
                });
                if let Err(e) = resources.finish(&waiter_id, code) {
                    tracing::warn!(container = %waiter_id, error = %e, "Failed to record container exit");
                }
            });
            return Ok(RunOutcome::Detached { id, pid });
        }

        let grace = Duration::from_secs(self.config.stop_timeout_secs);
        let exit_code = child.wait_foreground(grace).await?;
        self.resources.finish(&id, exit_code)?;
        Ok(RunOutcome::Exited { id, exit_code })
    }

    /// Returns whether limits are in effect.
    fn apply_limits(
        &self,
        limits: &dyn LimitsController,
        id: &str,
        memory_bytes: u64,
        cpu_shares: Option<u64>,
    ) -> Result<bool> {
        let applied = limits.create().and_then(|_| {
            if memory_bytes > 0 {
                limits.set_memory_limit(memory_bytes)?;
            }
            if let Some(shares) = cpu_shares {
                limits.set_cpu_limit(shares)?;
            }
            if self.config.cgroup.default_pid_limit > 0 {
                limits.set_pid_limit(self.config.cgroup.default_pid_limit)?;
            }
            Ok(())
        });
        match applied {
            Ok(()) => Ok(true),
            Err(e) if e.is_unsupported() => {
                if memory_bytes > 0 || cpu_shares.is_some() {
                    tracing::warn!(container = %id, error = %e, "Resource limits not applied");
                } else {
                    tracing::debug!(container = %id, error = %e, "Resource limits unavailable");
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve bindings to host paths, creating and claiming named volumes.
    fn prepare_binds(&self, id: &str, bindings: &[VolumeBinding]) -> Result<Vec<BindMount>> {
        let volumes = &self.resources.volumes;
        bindings
            .iter()
            .map(|binding| {
                let source = if binding.is_named() {
                    if volumes.get(&binding.source)?.is_none() {
                        volumes.create(&binding.source, None, HashMap::new())?;
                    }
                    volumes.attach(&binding.source, id)?;
                    volumes.volume_dir(&binding.source)
                } else {
                    PathBuf::from(&binding.source)
                };
                Ok(BindMount {
                    source,
                    target: binding.target.clone(),
                    read_only: binding.read_only,
                })
            })
            .collect()
    }

    fn isolator(&self, user_ns: bool) -> Arc<dyn Isolator> {
        match &self.isolator {
            Some(isolator) => Arc::clone(isolator),
            None => Arc::from(select_isolator(user_ns)),
        }
    }

    /// Stop a running container: SIGTERM, then SIGKILL after `timeout`
    /// (default: the configured stop timeout).
    pub async fn stop(&self, reference: &str, timeout: Option<Duration>) -> Result<ContainerState> {
        let state = self.resources.state.resolve(reference)?;
        if state.status != ContainerStatus::Running {
            tracing::debug!(container = %state.short_id(), status = %state.status, "Container not running");
            return Ok(state);
        }

        let grace = timeout.unwrap_or(Duration::from_secs(self.config.stop_timeout_secs));
        let exit_code = match terminate(state.pid, grace).await {
            Termination::Killed => 128 + libc::SIGKILL,
            Termination::Graceful => 128 + libc::SIGTERM,
            Termination::AlreadyExited => state.exit_code,
        };

        let stopped = self
            .resources
            .state
            .record_exit(&state.id, exit_code, ContainerStatus::Stopped)?;
        self.resources.release(&stopped);
        tracing::info!(container = %stopped.short_id(), exit_code, "Stopped container");
        Ok(stopped)
    }

    /// Delete a container and everything it owns. Running containers need
    /// `force` and are stopped first.
    pub async fn remove(&self, reference: &str, force: bool) -> Result<ContainerState> {
        let mut state = self.resources.state.resolve(reference)?;
        if state.status == ContainerStatus::Running {
            if !force {
                return Err(CtrError::Conflict(format!(
                    "container {} is running; stop it first or use --force",
                    state.short_id()
                )));
            }
            state = self.stop(&state.id, None).await?;
        } else {
            self.resources.release(&state);
        }

        RootfsAssembler::for_container(&self.config, &state.id).cleanup()?;
        let log_dir = self.config.container_log_dir(&state.id);
        if log_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&log_dir) {
                tracing::warn!(container = %state.short_id(), error = %e, "Failed to remove logs");
            }
        }
        self.resources.state.delete(&state.id)?;
        tracing::info!(container = %state.short_id(), name = %state.name, "Removed container");
        Ok(state)
    }

    /// Containers, newest first. Only running ones unless `all`.
    pub fn list(&self, all: bool) -> Result<Vec<ContainerState>> {
        if let Err(e) = self.resources.state.reconcile() {
            tracing::warn!(error = %e, "State reconciliation failed");
        }
        let mut states: Vec<ContainerState> = self
            .resources
            .state
            .list()?
            .into_iter()
            .filter(|s| all || s.status == ContainerStatus::Running)
            .collect();
        states.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        Ok(states)
    }

    pub fn inspect(&self, reference: &str) -> Result<ContainerState> {
        if let Err(e) = self.resources.state.reconcile() {
            tracing::warn!(error = %e, "State reconciliation failed");
        }
        self.resources.state.resolve(reference)
    }

    /// Stored output of a detached container, oldest first, limited to the
    /// last `tail` lines when given.
    pub fn logs(&self, reference: &str, tail: Option<usize>) -> Result<Vec<LogLine>> {
        let state = self.resources.state.resolve(reference)?;
        read_logs(&self.config.container_log_dir(&state.id), tail)
    }

    /// Best-effort usage counters.
    pub fn stats(&self, reference: &str) -> Result<ContainerStats> {
        let state = self.inspect(reference)?;
        let (usage, limits_supported) = match self.resources.limits(&state.id).stats() {
            Ok(usage) => (usage, true),
            Err(e) if e.is_unsupported() => (HashMap::new(), false),
            Err(e) => {
                tracing::warn!(container = %state.short_id(), error = %e, "Stats unavailable");
                (HashMap::new(), true)
            }
        };
        Ok(ContainerStats {
            id: state.id,
            name: state.name,
            status: state.status,
            pid: state.pid,
            memory_limit: state.memory,
            usage,
            limits_supported,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::extract::test_support::{tar_bytes, Item};
    use crate::ipam::Ipam;
    use crate::isolation::DirectIsolator;
    use serial_test::serial;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        manager: ContainerManager,
        cgroup_root: PathBuf,
    }

    /// Manager rooted in a temp dir with a fake v1 cgroup hierarchy, an
    /// in-memory allocator, direct execution and an imported `demo:v1`.
    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = RuntimeConfig::with_home(tmp.path().join("home"));
        let cgroup_root = tmp.path().join("cgroup");
        for subsystem in crate::cgroup::SUBSYSTEMS {
            std::fs::create_dir_all(cgroup_root.join(subsystem)).unwrap();
        }
        config.cgroup.root = cgroup_root.clone();
        config.network.subnet = "10.9.0.0/29".to_string();
        config.stop_timeout_secs = 2;

        let manager = ContainerManager::with_allocator(config, Arc::new(Ipam::new()))
            .unwrap()
            .with_isolator(Arc::new(DirectIsolator::new()));

        let archive = tmp.path().join("demo.tar");
        std::fs::write(
            &archive,
            tar_bytes(&[
                Item::Dir("etc/"),
                Item::File("etc/os-release", b"ID=demo\n"),
                Item::Dir("app/"),
            ]),
        )
        .unwrap();
        manager
            .images()
            .create_from_archive(&archive, "demo", Some("v1"))
            .await
            .unwrap();

        Fixture {
            _tmp: tmp,
            manager,
            cgroup_root,
        }
    }

    fn sh_spec(script: &str) -> RunSpec {
        RunSpec {
            image: "demo:v1".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_process_uses_image_defaults() {
        let image = ImageConfig {
            env: vec!["PATH=/bin".to_string(), "MODE=prod".to_string()],
            cmd: vec!["serve".to_string()],
            entrypoint: vec!["/app/bin".to_string()],
            working_dir: "/app".to_string(),
            ..ImageConfig::default()
        };
        let mut spec = RunSpec {
            image: "demo".to_string(),
            ..Default::default()
        };
        spec.env.insert("MODE".to_string(), "dev".to_string());

        let resolved = resolve_process(&spec, &image).unwrap();
        assert_eq!(resolved.argv, vec!["/app/bin", "serve"]);
        assert_eq!(resolved.env["MODE"], "dev");
        assert_eq!(resolved.env["PATH"], "/bin");
        assert_eq!(resolved.work_dir, "/app");

        spec.command = vec!["/bin/true".to_string()];
        spec.work_dir = Some("/tmp".to_string());
        let resolved = resolve_process(&spec, &image).unwrap();
        assert_eq!(resolved.argv, vec!["/bin/true"]);
        assert_eq!(resolved.work_dir, "/tmp");
    }

    #[test]
    fn test_resolve_process_without_command() {
        let spec = RunSpec {
            image: "scratch".to_string(),
            ..Default::default()
        };
        let err = resolve_process(&spec, &ImageConfig::default()).unwrap_err();
        assert!(matches!(err, CtrError::Validation(_)));
        assert!(err.to_string().contains("scratch"));
    }

    #[tokio::test]
    #[serial]
    async fn test_foreground_run_records_exit() {
        let f = fixture().await;
        let mut spec = sh_spec("exit 3");
        spec.name = Some("web".to_string());
        spec.memory = "128m".to_string();
        spec.cpus = "1.5".to_string();

        let outcome = f.manager.run(spec).await.unwrap();
        let RunOutcome::Exited { id, exit_code } = outcome else {
            panic!("expected foreground exit");
        };
        assert_eq!(exit_code, 3);

        let state = f.manager.inspect("web").unwrap();
        assert_eq!(state.id, id);
        assert_eq!(state.status, ContainerStatus::Exited);
        assert_eq!(state.exit_code, 3);
        assert_eq!(state.pid, 0);
        assert!(state.started.is_some());
        assert!(state.finished.is_some());
        assert_eq!(state.command, "/bin/sh");
        assert_eq!(state.memory, "128m");

        let rootfs = f.manager.config().container_dir(&id).join("rootfs");
        assert_eq!(
            std::fs::read_to_string(rootfs.join("etc/os-release")).unwrap(),
            "ID=demo\n"
        );

        // Limits were written, then the groups removed on exit.
        assert!(!f.cgroup_root.join("memory/a3s-ctr").join(&id).exists());
    }

    #[tokio::test]
    #[serial]
    async fn test_limits_written_while_running() {
        let f = fixture().await;
        let mut spec = sh_spec("exec sleep 30");
        spec.detached = true;
        spec.memory = "128m".to_string();
        spec.cpus = "1.5".to_string();

        let outcome = f.manager.run(spec).await.unwrap();
        let id = outcome.id().to_string();
        let group = |subsystem: &str, file: &str| {
            std::fs::read_to_string(f.cgroup_root.join(subsystem).join("a3s-ctr").join(&id).join(file))
                .unwrap()
        };
        assert_eq!(group("memory", "memory.limit_in_bytes"), "134217728");
        assert_eq!(group("cpu", "cpu.shares"), "1536");
        assert_eq!(group("pids", "pids.max"), "1024");
        let state = f.manager.inspect(&id).unwrap();
        assert_eq!(group("pids", "tasks"), state.pid.to_string());

        f.manager.remove(&id, true).await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_detached_stop_and_remove() {
        let f = fixture().await;
        let mut spec = sh_spec("exec sleep 30");
        spec.detached = true;
        spec.name = Some("bg".to_string());

        let RunOutcome::Detached { id, pid } = f.manager.run(spec).await.unwrap() else {
            panic!("expected detached run");
        };
        let running = f.manager.inspect("bg").unwrap();
        assert_eq!(running.status, ContainerStatus::Running);
        assert_eq!(running.pid, pid);
        assert_eq!(f.manager.list(false).unwrap().len(), 1);

        let err = f.manager.remove("bg", false).await.unwrap_err();
        assert!(matches!(err, CtrError::Conflict(_)));

        let stopped = f.manager.stop(&id[..12], Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(stopped.status, ContainerStatus::Stopped);
        assert_eq!(stopped.pid, 0);
        assert!(f.manager.list(false).unwrap().is_empty());
        assert_eq!(f.manager.list(true).unwrap().len(), 1);

        f.manager.remove("bg", false).await.unwrap();
        assert!(f.manager.inspect("bg").unwrap_err().is_not_found());
        assert!(!f.manager.config().container_dir(&id).exists());
    }

    #[tokio::test]
    #[serial]
    async fn test_name_conflict_creates_nothing() {
        let f = fixture().await;
        let mut spec = sh_spec("exit 0");
        spec.name = Some("dup".to_string());
        f.manager.run(spec.clone()).await.unwrap();

        let err = f.manager.run(spec).await.unwrap_err();
        assert!(matches!(err, CtrError::Conflict(_)));
        assert_eq!(f.manager.list(true).unwrap().len(), 1);
        let dirs = std::fs::read_dir(f.manager.config().data_dir.join("containers"))
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name() != "state")
            .count();
        assert_eq!(dirs, 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_invalid_limits_rejected_before_create() {
        let f = fixture().await;
        let mut spec = sh_spec("exit 0");
        spec.memory = "lots".to_string();
        assert!(f.manager.run(spec).await.unwrap_err().is_user_error());

        let mut spec = sh_spec("exit 0");
        spec.volumes = vec!["/definitely/not/here:/data".parse().unwrap()];
        assert!(f.manager.run(spec).await.unwrap_err().is_user_error());

        assert!(f.manager.list(true).unwrap().is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_bridge_address_is_released_on_exit() {
        let f = fixture().await;
        let first = f.manager.run(sh_spec("exit 0")).await.unwrap();
        let state = f.manager.inspect(first.id()).unwrap();
        let endpoint = state.network.unwrap();
        assert_eq!(endpoint.ip_address.to_string(), "10.9.0.2");
        assert_eq!(endpoint.gateway.to_string(), "10.9.0.1");

        let second = f.manager.run(sh_spec("exit 0")).await.unwrap();
        let endpoint = f.manager.inspect(second.id()).unwrap().network.unwrap();
        assert_eq!(endpoint.ip_address.to_string(), "10.9.0.2");

        let mut host = sh_spec("exit 0");
        host.network = NetworkMode::Host;
        let third = f.manager.run(host).await.unwrap();
        assert!(f.manager.inspect(third.id()).unwrap().network.is_none());
    }

    #[tokio::test]
    #[serial]
    async fn test_repeated_release_keeps_reassigned_address() {
        let f = fixture().await;
        let subnet = Subnet::parse("10.9.0.0/29").unwrap();
        let mut spec = sh_spec("exec sleep 30");
        spec.detached = true;

        let first = f.manager.run(spec.clone()).await.unwrap();
        let stopped = f.manager.stop(first.id(), Some(Duration::from_secs(5))).await.unwrap();
        let ip = stopped.network.clone().unwrap().ip_address;
        assert!(!f.manager.resources.ipam.is_allocated(&subnet, ip));

        let second = f.manager.run(spec.clone()).await.unwrap();
        let second_ip = f.manager.inspect(second.id()).unwrap().network.unwrap().ip_address;
        assert_eq!(second_ip, ip);

        // A late release for the first container, as the exit callback
        // would issue after stop.
        f.manager.resources.release(&stopped);
        assert!(f.manager.resources.ipam.is_allocated(&subnet, ip));

        let third = f.manager.run(spec).await.unwrap();
        let third_ip = f.manager.inspect(third.id()).unwrap().network.unwrap().ip_address;
        assert_ne!(third_ip, ip);

        f.manager.remove(second.id(), true).await.unwrap();
        f.manager.remove(third.id(), true).await.unwrap();
        assert!(f.manager.resources.ipam.allocated(&subnet).is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_named_volume_attached_and_released() {
        let f = fixture().await;
        let mut spec = sh_spec("exec sleep 30");
        spec.detached = true;
        spec.volumes = vec!["cache:/cache".parse().unwrap()];

        let outcome = f.manager.run(spec).await.unwrap();
        let volume = f.manager.volumes().get("cache").unwrap().unwrap();
        assert_eq!(volume.in_use_by, vec![outcome.id().to_string()]);

        f.manager.remove(outcome.id(), true).await.unwrap();
        let volume = f.manager.volumes().get("cache").unwrap().unwrap();
        assert!(volume.in_use_by.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_detached_output_readable_as_logs() {
        let f = fixture().await;
        let mut spec = sh_spec("echo first; echo second; echo oops >&2");
        spec.detached = true;
        spec.name = Some("chatty".to_string());
        f.manager.run(spec).await.unwrap();

        for _ in 0..100 {
            if f.manager.inspect("chatty").unwrap().status == ContainerStatus::Exited {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let lines = f.manager.logs("chatty", None).unwrap();
        let mut contents: Vec<&str> = lines.iter().map(|l| l.content.as_str()).collect();
        contents.sort();
        assert_eq!(contents, vec!["first", "oops", "second"]);

        let last = f.manager.logs("chatty", Some(1)).unwrap();
        assert_eq!(last.len(), 1);
        assert!(f.manager.logs("missing", None).unwrap_err().is_not_found());
    }

    #[tokio::test]
    #[serial]
    async fn test_stats_reads_counters() {
        let f = fixture().await;
        let mut spec = sh_spec("exec sleep 30");
        spec.detached = true;
        let outcome = f.manager.run(spec).await.unwrap();
        let id = outcome.id().to_string();
        std::fs::write(
            f.cgroup_root.join("memory/a3s-ctr").join(&id).join("memory.usage_in_bytes"),
            "4096\n",
        )
        .unwrap();

        let stats = f.manager.stats(&id).unwrap();
        assert!(stats.limits_supported);
        assert_eq!(stats.usage["memory_usage"], "4096");
        assert!(!stats.usage.contains_key("cpu_usage"));

        f.manager.remove(&id, true).await.unwrap();
    }
}
