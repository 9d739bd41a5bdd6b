use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::Utc;
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    config::{AgentConfig, FIRECRACKER_BINARY},
    runtime::{RuntimeKind, SandboxRuntime},
    vm::{BootFailure, MicroVmSupervisor, VmProcess},
    FleetError, FleetResult,
};

use super::{Resources, Sandbox, SandboxKey, SandboxStatus, StateStore};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long a stale hypervisor gets to exit after SIGTERM during recovery.
const STALE_TERM_GRACE: Duration = Duration::from_secs(2);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The host-local registry of sandboxes.
///
/// All mutations go through one lock. Slot choice and interface creation happen under the lock so
/// two creates can never derive the same TAP or address; the hypervisor boot itself runs outside
/// it so distinct seats boot concurrently.
pub struct Registry {
    config: AgentConfig,
    supervisor: MicroVmSupervisor,
    store: Arc<dyn StateStore>,
    started_at: Instant,
    inner: Mutex<RegistryInner>,
}

/// The `/health` document of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Always `ok` when the agent answers.
    pub status: String,

    /// The host's identity.
    pub worker_id: String,

    /// Number of sandboxes on the host, in any state.
    pub vm_count: usize,

    /// Maximum number of sandboxes on the host.
    pub capacity: usize,

    /// Seconds since the agent started.
    pub uptime_seconds: u64,
}

/// The `/info` document of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    /// The host's identity.
    pub worker_id: String,

    /// Agent version.
    pub version: String,

    /// Isolation technology.
    pub runtime: RuntimeKind,

    /// Maximum number of sandboxes on the host.
    pub capacity: usize,

    /// Number of sandboxes on the host.
    pub vm_count: usize,

    /// Bridge device name.
    pub bridge: String,

    /// Sandbox subnet.
    pub subnet: String,

    /// Gateway address of the sandboxes.
    pub gateway: Ipv4Addr,

    /// Guest port of the terminal service.
    pub terminal_port: u16,

    /// Guest port of the file service.
    pub files_port: u16,
}

#[derive(Default)]
struct RegistryInner {
    entries: BTreeMap<SandboxKey, Entry>,
    releasing: BTreeSet<u32>,
    next_generation: u64,
}

struct Entry {
    sandbox: Sandbox,
    process: Option<VmProcess>,
    generation: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Registry {
    /// Creates an empty registry.
    pub fn new(
        config: AgentConfig,
        supervisor: MicroVmSupervisor,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            supervisor,
            store,
            started_at: Instant::now(),
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// The agent configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Prepares the host: bridge, egress and reclaiming whatever a previous agent left behind.
    pub async fn initialize(&self) -> FleetResult<()> {
        let network = self.supervisor.network();
        network.ensure_bridge().await?;
        if let Err(e) = network.ensure_egress().await {
            tracing::warn!(error = %e, "failed to enable sandbox egress, guests will be offline");
        }

        if let Err(e) = self.supervisor.check_images().await {
            tracing::warn!(error = %e, "boot images missing, creates will fail until they exist");
        }

        let reclaimed = self.recover().await?;
        if reclaimed > 0 {
            tracing::info!(reclaimed, "reclaimed stale sandboxes");
        }
        Ok(())
    }

    /// Creates the sandbox of a seat.
    pub async fn create(
        &self,
        workshop_id: &str,
        seat_id: u32,
        resources: Resources,
    ) -> FleetResult<Sandbox> {
        let key = SandboxKey::new(workshop_id, seat_id);
        key.validate()?;
        resources.validate()?;
        let (vcpus, memory_mib) = resources.resolve(
            *self.config.get_default_vcpus(),
            *self.config.get_default_memory_mib(),
        );

        let (allocation, generation) = {
            let mut inner = self.lock().await;

            if inner.entries.contains_key(&key) {
                return Err(FleetError::SandboxExists(key));
            }

            let capacity = *self.config.get_capacity();
            if inner.entries.len() >= capacity {
                return Err(FleetError::CapacityExceeded { capacity });
            }

            let slot = inner.choose_slot(seat_id, self.supervisor.network().max_slots())?;
            let allocation = self
                .supervisor
                .network()
                .allocate_interface(slot)
                .await
                .map_err(|e| e.for_sandbox(&key))?;

            inner.next_generation += 1;
            let generation = inner.next_generation;
            let sandbox = Sandbox {
                workshop_id: key.workshop_id.clone(),
                seat_id,
                ip: allocation.ip,
                tap_name: allocation.tap_name.clone(),
                slot,
                pid: None,
                status: SandboxStatus::Provisioning,
                created_at: Utc::now(),
                vcpus,
                memory_mib,
                error: None,
            };
            inner.entries.insert(
                key.clone(),
                Entry {
                    sandbox,
                    process: None,
                    generation,
                },
            );
            self.persist(&inner).await;

            (allocation, generation)
        };

        tracing::info!(%key, slot = allocation.slot, ip = %allocation.ip, "provisioning sandbox");
        let booted = self
            .supervisor
            .boot(workshop_id, seat_id, &allocation, vcpus, memory_mib)
            .await;

        let mut inner = self.lock().await;
        let owned = inner
            .entries
            .get(&key)
            .is_some_and(|entry| entry.generation == generation);

        match booted {
            Ok(process) if owned => {
                let entry = inner.entry_mut(&key)?;
                entry.sandbox.status = SandboxStatus::Running;
                entry.sandbox.pid = Some(process.pid());
                entry.process = Some(process);
                let sandbox = entry.sandbox.clone();
                self.persist(&inner).await;

                tracing::info!(%key, ip = %sandbox.ip, pid = ?sandbox.pid, "sandbox running");
                Ok(sandbox)
            }
            Err(BootFailure {
                error,
                process: Some(process),
            }) if owned => {
                let entry = inner.entry_mut(&key)?;
                entry.sandbox.status = SandboxStatus::Error;
                entry.sandbox.pid = Some(process.pid());
                entry.sandbox.error = Some(error.to_string());
                entry.process = Some(process);
                self.persist(&inner).await;

                tracing::error!(%key, error = %error, "sandbox boot is ambiguous, keeping it for inspection");
                Err(error.for_sandbox(&key))
            }
            Err(BootFailure {
                error,
                process: None,
            }) => {
                if owned {
                    inner.entries.remove(&key);
                    self.persist(&inner).await;
                }

                if let Err(e) = self
                    .supervisor
                    .network()
                    .release_interface(allocation.slot)
                    .await
                {
                    tracing::error!(%key, error = %e, "failed to roll back interface");
                }
                inner.releasing.remove(&allocation.slot);

                tracing::error!(%key, error = %error, "sandbox boot failed");
                Err(error.for_sandbox(&key))
            }
            Ok(process) => {
                drop(inner);
                self.finish_abandoned(&key, allocation.slot, Some(process))
                    .await;
                Err(FleetError::Cancelled.for_sandbox(&key))
            }
            Err(BootFailure { error, process }) => {
                drop(inner);
                self.finish_abandoned(&key, allocation.slot, process).await;
                Err(error.for_sandbox(&key))
            }
        }
    }

    /// Destroys the sandbox of a seat. A missing sandbox is not an error.
    ///
    /// A sandbox that is still booting is handed back to its create call, which tears it down
    /// once the boot finishes.
    pub async fn destroy(&self, workshop_id: &str, seat_id: u32) -> FleetResult<()> {
        let key = SandboxKey::new(workshop_id, seat_id);

        let entry = {
            let mut inner = self.lock().await;
            let Some(entry) = inner.entries.remove(&key) else {
                tracing::debug!(%key, "destroy of unknown sandbox");
                return Ok(());
            };

            inner.releasing.insert(entry.sandbox.slot);
            self.persist(&inner).await;

            if entry.sandbox.status == SandboxStatus::Provisioning {
                tracing::info!(%key, "sandbox destroyed while provisioning");
                return Ok(());
            }
            entry
        };

        let slot = entry.sandbox.slot;
        let result = self
            .supervisor
            .stop(workshop_id, seat_id, slot, entry.process)
            .await;

        self.lock().await.releasing.remove(&slot);

        match result {
            Ok(()) => {
                tracing::info!(%key, "sandbox destroyed");
                Ok(())
            }
            Err(e) => Err(e.for_sandbox(&key)),
        }
    }

    /// Destroys every sandbox on the host. Returns how many were destroyed.
    pub async fn destroy_all(&self) -> FleetResult<usize> {
        let keys: Vec<SandboxKey> = self.lock().await.entries.keys().cloned().collect();

        let mut destroyed = 0;
        for key in keys {
            match self.destroy(&key.workshop_id, key.seat_id).await {
                Ok(()) => destroyed += 1,
                Err(e) => tracing::error!(%key, error = %e, "failed to destroy sandbox"),
            }
        }
        Ok(destroyed)
    }

    /// The sandbox of a seat.
    pub async fn get(&self, workshop_id: &str, seat_id: u32) -> FleetResult<Sandbox> {
        let key = SandboxKey::new(workshop_id, seat_id);
        let inner = self.lock().await;
        inner
            .entries
            .get(&key)
            .map(|entry| entry.sandbox.clone())
            .ok_or(FleetError::SandboxNotFound(key))
    }

    /// A snapshot of the sandboxes, optionally only those of one workshop.
    ///
    /// `None` and an empty filter both return every sandbox.
    pub async fn list(&self, workshop_id: Option<&str>) -> Vec<Sandbox> {
        let filter = workshop_id.filter(|id| !id.is_empty());
        let inner = self.lock().await;
        inner
            .entries
            .values()
            .filter(|entry| filter.map_or(true, |id| entry.sandbox.workshop_id == id))
            .map(|entry| entry.sandbox.clone())
            .collect()
    }

    /// The address of a running sandbox.
    ///
    /// Fails with [`FleetError::SandboxNotReady`] for sandboxes that exist but do not run.
    pub async fn running_ip(&self, workshop_id: &str, seat_id: u32) -> FleetResult<Ipv4Addr> {
        let sandbox = self.get(workshop_id, seat_id).await?;
        if !sandbox.is_running() {
            return Err(FleetError::SandboxNotReady {
                key: sandbox.key(),
                status: sandbox.status.to_string(),
            });
        }
        Ok(sandbox.ip)
    }

    /// Number of sandboxes on the host.
    pub async fn count(&self) -> usize {
        self.lock().await.entries.len()
    }

    /// The `/health` document.
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok".to_string(),
            worker_id: self.config.get_worker_id().clone(),
            vm_count: self.count().await,
            capacity: *self.config.get_capacity(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// The `/info` document.
    pub async fn info(&self) -> HostInfo {
        HostInfo {
            worker_id: self.config.get_worker_id().clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            runtime: RuntimeKind::MicroVm,
            capacity: *self.config.get_capacity(),
            vm_count: self.count().await,
            bridge: self.config.get_bridge_name().clone(),
            subnet: self.config.get_bridge_cidr().to_string(),
            gateway: self.config.gateway(),
            terminal_port: *self.config.get_terminal_port(),
            files_port: *self.config.get_files_port(),
        }
    }

    /// Reclaims sandboxes recorded by a previous agent process.
    ///
    /// Hypervisors that are still alive are terminated, then interfaces and working directories
    /// are released. Returns the number of sandboxes reclaimed.
    pub async fn recover(&self) -> FleetResult<usize> {
        let stale = self.store.load().await?;
        let count = stale.len();

        for sandbox in stale {
            let key = sandbox.key();
            if let Some(pid) = sandbox.pid {
                terminate_stale_hypervisor(pid).await;
            }

            if let Err(e) = self
                .supervisor
                .stop(&sandbox.workshop_id, sandbox.seat_id, sandbox.slot, None)
                .await
            {
                tracing::warn!(%key, error = %e, "failed to reclaim stale sandbox");
            }
        }

        let inner = self.lock().await;
        self.persist(&inner).await;
        Ok(count)
    }

    async fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().await
    }

    async fn persist(&self, inner: &RegistryInner) {
        let sandboxes: Vec<Sandbox> = inner
            .entries
            .values()
            .map(|entry| entry.sandbox.clone())
            .collect();

        if let Err(e) = self.store.save(&sandboxes).await {
            tracing::warn!(error = %e, "failed to persist sandbox state");
        }
    }

    /// Tears down a sandbox whose entry was destroyed while it was booting.
    async fn finish_abandoned(&self, key: &SandboxKey, slot: u32, process: Option<VmProcess>) {
        tracing::info!(%key, "tearing down sandbox destroyed during boot");
        if let Err(e) = self
            .supervisor
            .stop(&key.workshop_id, key.seat_id, slot, process)
            .await
        {
            tracing::error!(%key, error = %e, "failed to tear down abandoned sandbox");
        }
        self.lock().await.releasing.remove(&slot);
    }
}

impl RegistryInner {
    fn used_slots(&self) -> BTreeSet<u32> {
        self.entries
            .values()
            .map(|entry| entry.sandbox.slot)
            .chain(self.releasing.iter().copied())
            .collect()
    }

    /// Prefers `slot == seat_id` so a fresh host maps seat N to `base + 10 + N`, and falls back
    /// to the lowest free slot.
    fn choose_slot(&self, seat_id: u32, max_slots: u32) -> FleetResult<u32> {
        let used = self.used_slots();
        if (1..=max_slots).contains(&seat_id) && !used.contains(&seat_id) {
            return Ok(seat_id);
        }

        (1..=max_slots)
            .find(|slot| !used.contains(slot))
            .ok_or_else(|| FleetError::AddressPoolExhausted(format!("{max_slots} slots in use")))
    }

    fn entry_mut(&mut self, key: &SandboxKey) -> FleetResult<&mut Entry> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| FleetError::SandboxNotFound(key.clone()))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SandboxRuntime for Registry {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::MicroVm
    }

    async fn create(
        &self,
        workshop_id: &str,
        seat_id: u32,
        resources: Resources,
    ) -> FleetResult<Sandbox> {
        Registry::create(self, workshop_id, seat_id, resources).await
    }

    async fn destroy(&self, workshop_id: &str, seat_id: u32) -> FleetResult<()> {
        Registry::destroy(self, workshop_id, seat_id).await
    }

    async fn list(&self, workshop_id: Option<&str>) -> FleetResult<Vec<Sandbox>> {
        Ok(Registry::list(self, workshop_id).await)
    }

    async fn get_ip(&self, workshop_id: &str, seat_id: u32) -> FleetResult<Ipv4Addr> {
        self.running_ip(workshop_id, seat_id).await
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("worker_id", self.config.get_worker_id())
            .field("capacity", self.config.get_capacity())
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Terminates a hypervisor left over from a previous agent process.
///
/// Pids that are gone or that belong to something other than the hypervisor are left alone.
async fn terminate_stale_hypervisor(pid: u32) {
    let Ok(cmdline) = tokio::fs::read(format!("/proc/{pid}/cmdline")).await else {
        return;
    };
    if !String::from_utf8_lossy(&cmdline).contains(FIRECRACKER_BINARY) {
        tracing::debug!(pid, "stale pid now belongs to another process, leaving it alone");
        return;
    }

    let pid = Pid::from_raw(pid as i32);
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        tracing::debug!(%pid, error = %e, "stale hypervisor already gone");
        return;
    }

    let deadline = Instant::now() + STALE_TERM_GRACE;
    while Instant::now() < deadline {
        if kill(pid, None).is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    tracing::warn!(%pid, "stale hypervisor ignored SIGTERM, killing");
    let _ = kill(pid, Signal::SIGKILL);
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
