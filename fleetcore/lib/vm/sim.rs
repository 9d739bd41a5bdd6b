use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{FleetError, FleetResult};

use super::{BootSpec, Hypervisor, ShutdownOutcome, VmProcess};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// First pid handed out by the simulated hypervisor.
const FIRST_SIMULATED_PID: u32 = 100_000;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`Hypervisor`] that boots nothing, for development hosts without KVM and for tests.
///
/// Launch failures and silent control sockets can be injected to exercise the supervisor's
/// retry and rollback paths.
#[derive(Debug)]
pub struct SimulatedHypervisor {
    next_pid: AtomicU32,
    launches: AtomicU32,
    failing_launches: AtomicU32,
    silent_socket: AtomicBool,
    running: Mutex<BTreeSet<u32>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SimulatedHypervisor {
    /// Creates a hypervisor whose launches all succeed.
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(FIRST_SIMULATED_PID),
            launches: AtomicU32::new(0),
            failing_launches: AtomicU32::new(0),
            silent_socket: AtomicBool::new(false),
            running: Mutex::new(BTreeSet::new()),
        }
    }

    /// Makes the next `count` launches fail as if the process died on startup.
    pub fn fail_next_launches(&self, count: u32) {
        self.failing_launches.store(count, Ordering::SeqCst);
    }

    /// Makes launched processes never answer on their control socket.
    pub fn set_silent_socket(&self, silent: bool) {
        self.silent_socket.store(silent, Ordering::SeqCst);
    }

    /// Number of launch attempts so far, successful or not.
    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Pids of the simulated processes that are still running.
    pub fn running_pids(&self) -> Vec<u32> {
        self.lock_running().iter().copied().collect()
    }

    fn lock_running(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SimulatedHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    async fn spawn(&self, spec: &BootSpec) -> FleetResult<VmProcess> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failing_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FleetError::ProcessLaunch(format!(
                "simulated launch failure for {}",
                spec.get_id()
            )));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(
            spec.console_log_path(),
            format!("simulated boot: {}\n", spec.boot_args()),
        )
        .await?;
        self.lock_running().insert(pid);

        tracing::debug!(id = %spec.get_id(), pid, "simulated hypervisor started");
        Ok(VmProcess::detached(pid, spec.socket_path()))
    }

    async fn wait_ready(&self, process: &mut VmProcess, timeout: Duration) -> FleetResult<()> {
        if self.silent_socket.load(Ordering::SeqCst) {
            return Err(FleetError::BootTimeout {
                path: process.socket_path().to_path_buf(),
                timeout_secs: timeout.as_secs(),
            });
        }
        Ok(())
    }

    async fn shutdown(
        &self,
        process: &mut VmProcess,
        _timeout: Duration,
    ) -> FleetResult<ShutdownOutcome> {
        if self.lock_running().remove(&process.pid()) {
            Ok(ShutdownOutcome::Graceful)
        } else {
            Ok(ShutdownOutcome::AlreadyExited)
        }
    }
}
