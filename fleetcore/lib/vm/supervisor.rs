use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    config::{AgentConfig, KERNEL_IMAGE_FILENAME, ROOTFS_IMAGE_FILENAME},
    network::{Allocation, NetworkManager},
    FleetError, FleetResult,
};

use super::{sandbox_dir, BootSpec, Hypervisor, VmProcess};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many times a launch is attempted when the hypervisor dies during startup.
const LAUNCH_ATTEMPTS: usize = 2;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Boots and stops the hypervisor processes of one host.
#[derive(Clone)]
pub struct MicroVmSupervisor {
    hypervisor: Arc<dyn Hypervisor>,
    network: NetworkManager,
    images_dir: PathBuf,
    run_dir: PathBuf,
    boot_timeout: Duration,
    stop_timeout: Duration,
}

/// A failed boot.
///
/// `process` is set when the hypervisor is still running, i.e. the failure is ambiguous and the
/// sandbox should be kept around for inspection.
#[derive(Debug)]
pub struct BootFailure {
    /// What went wrong.
    pub error: FleetError,

    /// The hypervisor process, if it is still alive.
    pub process: Option<VmProcess>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MicroVmSupervisor {
    /// Creates a supervisor using the directories and timeouts of an agent configuration.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        network: NetworkManager,
        config: &AgentConfig,
    ) -> Self {
        Self {
            hypervisor,
            network,
            images_dir: config.get_images_dir().clone(),
            run_dir: config.get_run_dir().clone(),
            boot_timeout: *config.get_boot_timeout(),
            stop_timeout: *config.get_stop_timeout(),
        }
    }

    /// The network manager sandboxes are wired through.
    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    /// Path of the guest kernel.
    pub fn kernel_path(&self) -> PathBuf {
        self.images_dir.join(KERNEL_IMAGE_FILENAME)
    }

    /// Path of the pristine root filesystem image every sandbox is copied from.
    pub fn rootfs_image_path(&self) -> PathBuf {
        self.images_dir.join(ROOTFS_IMAGE_FILENAME)
    }

    /// The working directory of a sandbox.
    pub fn sandbox_dir(&self, workshop_id: &str, seat_id: u32, slot: u32) -> PathBuf {
        sandbox_dir(&self.run_dir, workshop_id, seat_id, slot)
    }

    /// Fails with [`FleetError::ImageMissing`] unless both boot images are present.
    pub async fn check_images(&self) -> FleetResult<()> {
        for path in [self.kernel_path(), self.rootfs_image_path()] {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(FleetError::ImageMissing(path));
            }
        }
        Ok(())
    }

    /// Boots the sandbox of a seat on an already allocated interface.
    ///
    /// Returns once the hypervisor answers on its control socket. A hypervisor that exits
    /// during startup is launched once more. Missing images are never retried.
    pub async fn boot(
        &self,
        workshop_id: &str,
        seat_id: u32,
        allocation: &Allocation,
        vcpus: u8,
        memory_mib: u32,
    ) -> Result<VmProcess, BootFailure> {
        self.check_images().await.map_err(BootFailure::from)?;

        let workdir = self.sandbox_dir(workshop_id, seat_id, allocation.slot);
        let rootfs_path = workdir.join(ROOTFS_IMAGE_FILENAME);
        self.prepare_workdir(&workdir, &rootfs_path)
            .await
            .map_err(BootFailure::from)?;

        let spec = BootSpec::builder()
            .id(format!("fleet-{}", allocation.slot))
            .kernel_path(self.kernel_path())
            .rootfs_path(rootfs_path)
            .workdir(workdir.clone())
            .allocation(allocation.clone())
            .vcpus(vcpus)
            .memory_mib(memory_mib)
            .build();

        let mut last_error = None;
        for attempt in 1..=LAUNCH_ATTEMPTS {
            match self.launch(&spec).await {
                Ok(process) => return Ok(process),
                Err(BootFailure {
                    error: error @ FleetError::ProcessLaunch(_),
                    process: None,
                }) => {
                    tracing::warn!(
                        workshop_id,
                        seat_id,
                        attempt,
                        error = %error,
                        "hypervisor died during launch"
                    );
                    last_error = Some(error);
                }
                Err(failure) => {
                    if failure.process.is_none() {
                        remove_workdir(&workdir).await;
                    }
                    return Err(failure);
                }
            }
        }

        remove_workdir(&workdir).await;
        Err(BootFailure {
            error: last_error.unwrap_or_else(|| {
                FleetError::ProcessLaunch("hypervisor launch failed".to_string())
            }),
            process: None,
        })
    }

    /// Stops a sandbox's hypervisor and tears down its interface and working directory.
    ///
    /// The interface is released whatever happens to the process. The first error encountered is
    /// returned after every step has been attempted.
    pub async fn stop(
        &self,
        workshop_id: &str,
        seat_id: u32,
        slot: u32,
        process: Option<VmProcess>,
    ) -> FleetResult<()> {
        let mut first_error = None;

        if let Some(mut process) = process {
            match self
                .hypervisor
                .shutdown(&mut process, self.stop_timeout)
                .await
            {
                Ok(outcome) => {
                    tracing::info!(workshop_id, seat_id, pid = process.pid(), %outcome, "hypervisor stopped")
                }
                Err(e) => {
                    tracing::warn!(workshop_id, seat_id, error = %e, "graceful stop failed, killing");
                    if let Err(kill_error) = process.kill().await {
                        tracing::error!(workshop_id, seat_id, error = %kill_error, "failed to kill hypervisor");
                    }
                    process.release_monitor().await;
                    first_error = Some(e);
                }
            }
        }

        if let Err(e) = self.network.release_interface(slot).await {
            tracing::error!(workshop_id, seat_id, slot, error = %e, "failed to release interface");
            first_error.get_or_insert(e);
        }

        remove_workdir(&self.sandbox_dir(workshop_id, seat_id, slot)).await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn launch(&self, spec: &BootSpec) -> Result<VmProcess, BootFailure> {
        let mut process = self.hypervisor.spawn(spec).await.map_err(BootFailure::from)?;

        match self
            .hypervisor
            .wait_ready(&mut process, self.boot_timeout)
            .await
        {
            Ok(()) => Ok(process),
            Err(error @ FleetError::ProcessLaunch(_)) => {
                process.release_monitor().await;
                Err(BootFailure::from(error))
            }
            Err(error) => Err(BootFailure {
                error,
                process: Some(process),
            }),
        }
    }

    async fn prepare_workdir(&self, workdir: &Path, rootfs_path: &Path) -> FleetResult<()> {
        if tokio::fs::try_exists(workdir).await.unwrap_or(false) {
            tracing::warn!(workdir = %workdir.display(), "replacing stale sandbox directory");
            tokio::fs::remove_dir_all(workdir).await?;
        }

        tokio::fs::create_dir_all(workdir).await?;
        tokio::fs::copy(self.rootfs_image_path(), rootfs_path).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn remove_workdir(workdir: &Path) {
    match tokio::fs::remove_dir_all(workdir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(workdir = %workdir.display(), error = %e, "failed to remove sandbox directory")
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<FleetError> for BootFailure {
    fn from(error: FleetError) -> Self {
        Self {
            error,
            process: None,
        }
    }
}

impl fmt::Debug for MicroVmSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicroVmSupervisor")
            .field("network", &self.network)
            .field("images_dir", &self.images_dir)
            .field("run_dir", &self.run_dir)
            .field("boot_timeout", &self.boot_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        network::SimulatedDriver,
        vm::SimulatedHypervisor,
    };

    struct Fixture {
        _dir: TempDir,
        driver: Arc<SimulatedDriver>,
        hypervisor: Arc<SimulatedHypervisor>,
        supervisor: MicroVmSupervisor,
    }

    async fn fixture(with_images: bool) -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let images_dir = dir.path().join("images");
        tokio::fs::create_dir_all(&images_dir).await?;
        if with_images {
            tokio::fs::write(images_dir.join(KERNEL_IMAGE_FILENAME), b"kernel").await?;
            tokio::fs::write(images_dir.join(ROOTFS_IMAGE_FILENAME), b"rootfs").await?;
        }

        let config = AgentConfig::builder()
            .worker_id("test")
            .auth_token("secret")
            .images_dir(images_dir)
            .run_dir(dir.path().join("run"))
            .build();

        let driver = Arc::new(SimulatedDriver::new());
        let network = NetworkManager::from_config(driver.clone(), &config);
        network.ensure_bridge().await?;

        let hypervisor = Arc::new(SimulatedHypervisor::new());
        let supervisor = MicroVmSupervisor::new(hypervisor.clone(), network, &config);

        Ok(Fixture {
            _dir: dir,
            driver,
            hypervisor,
            supervisor,
        })
    }

    #[tokio::test]
    async fn test_boot_creates_private_rootfs_and_stop_cleans_up() -> anyhow::Result<()> {
        let f = fixture(true).await?;
        let allocation = f.supervisor.network().allocate_interface(1).await?;

        let process = f
            .supervisor
            .boot("ws-1", 1, &allocation, 2, 512)
            .await
            .map_err(|failure| failure.error)?;

        let workdir = f.supervisor.sandbox_dir("ws-1", 1, 1);
        assert_eq!(
            tokio::fs::read(workdir.join(ROOTFS_IMAGE_FILENAME)).await?,
            b"rootfs"
        );
        assert_eq!(f.hypervisor.running_pids(), vec![process.pid()]);

        f.supervisor.stop("ws-1", 1, 1, Some(process)).await?;
        assert!(f.hypervisor.running_pids().is_empty());
        assert!(f.driver.tap_names().is_empty());
        assert!(!workdir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_boot_fails_fast_without_images() -> anyhow::Result<()> {
        let f = fixture(false).await?;
        let allocation = f.supervisor.network().allocation(1)?;

        let failure = f
            .supervisor
            .boot("ws-1", 1, &allocation, 2, 512)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, FleetError::ImageMissing(_)));
        assert!(failure.process.is_none());
        assert_eq!(f.hypervisor.launch_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_boot_retries_launch_once() -> anyhow::Result<()> {
        let f = fixture(true).await?;
        let allocation = f.supervisor.network().allocation(1)?;

        f.hypervisor.fail_next_launches(1);
        let process = f.supervisor.boot("ws-1", 1, &allocation, 2, 512).await;
        assert!(process.is_ok());
        assert_eq!(f.hypervisor.launch_count(), 2);

        f.hypervisor.fail_next_launches(2);
        let failure = f
            .supervisor
            .boot("ws-1", 2, &allocation, 2, 512)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, FleetError::ProcessLaunch(_)));
        assert_eq!(f.hypervisor.launch_count(), 4);
        assert!(!f.supervisor.sandbox_dir("ws-1", 2, 1).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_boot_timeout_keeps_process_and_workdir() -> anyhow::Result<()> {
        let f = fixture(true).await?;
        let allocation = f.supervisor.network().allocation(3)?;

        f.hypervisor.set_silent_socket(true);
        let failure = f
            .supervisor
            .boot("ws-1", 3, &allocation, 2, 512)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, FleetError::BootTimeout { .. }));
        assert!(failure.process.is_some());
        assert!(f.supervisor.sandbox_dir("ws-1", 3, 3).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_releases_interface_without_process() -> anyhow::Result<()> {
        let f = fixture(true).await?;
        f.supervisor.network().allocate_interface(5).await?;

        f.supervisor.stop("ws-2", 5, 5, None).await?;
        assert!(f.driver.tap_names().is_empty());
        Ok(())
    }
}
