use std::{
    fmt,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};

use async_trait::async_trait;
use fleetutils::ProcessMonitor;
use tokio::process::Child;

use crate::{FleetError, FleetResult};

use super::BootSpec;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Launches and stops hypervisor processes.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Starts the hypervisor for a sandbox. Returns as soon as the process exists.
    async fn spawn(&self, spec: &BootSpec) -> FleetResult<VmProcess>;

    /// Waits until the hypervisor answers on its control socket.
    ///
    /// Fails with [`FleetError::ProcessLaunch`] if the process exits first and with
    /// [`FleetError::BootTimeout`] if it is still running but silent after `timeout`.
    async fn wait_ready(&self, process: &mut VmProcess, timeout: Duration) -> FleetResult<()>;

    /// Asks the guest to shut down and kills the process if it is still alive after `timeout`.
    async fn shutdown(
        &self,
        process: &mut VmProcess,
        timeout: Duration,
    ) -> FleetResult<ShutdownOutcome>;
}

/// An owned handle to a running hypervisor process.
///
/// Dropping the handle kills the process.
pub struct VmProcess {
    pid: u32,
    socket_path: PathBuf,
    child: Option<Child>,
    monitor: Option<Box<dyn ProcessMonitor>>,
}

/// How a hypervisor process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The guest shut down within the timeout.
    Graceful,

    /// The process had to be killed.
    Killed,

    /// The process was already gone.
    AlreadyExited,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmProcess {
    /// A handle that tracks a pid without owning the process.
    pub fn detached(pid: u32, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            socket_path: socket_path.into(),
            child: None,
            monitor: None,
        }
    }

    /// Takes ownership of a spawned child. The child should have been spawned with
    /// `kill_on_drop(true)`.
    pub fn from_child(
        child: Child,
        socket_path: impl Into<PathBuf>,
        monitor: Option<Box<dyn ProcessMonitor>>,
    ) -> FleetResult<Self> {
        let pid = child.id().ok_or_else(|| {
            FleetError::ProcessLaunch("hypervisor exited before its pid was read".to_string())
        })?;

        Ok(Self {
            pid,
            socket_path: socket_path.into(),
            child: Some(child),
            monitor,
        })
    }

    /// The process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The control socket path.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The exit status if the process has exited. Detached handles always report `None`.
    pub fn try_exit_status(&mut self) -> FleetResult<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    /// Waits up to `timeout` for the process to exit. Returns whether it did.
    pub async fn wait_exit(&mut self, timeout: Duration) -> FleetResult<bool> {
        let Some(child) = self.child.as_mut() else {
            return Ok(false);
        };

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::debug!(pid = self.pid, %status, "hypervisor exited");
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Kills the process and reaps it.
    pub async fn kill(&mut self) -> FleetResult<()> {
        if let Some(child) = self.child.as_mut() {
            if child.try_wait()?.is_none() {
                child.kill().await?;
            }
        }
        Ok(())
    }

    /// Stops the output monitor, flushing the console log.
    pub async fn release_monitor(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            if let Err(e) = monitor.stop().await {
                tracing::warn!(pid = self.pid, error = %e, "failed to stop console monitor");
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for VmProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmProcess")
            .field("pid", &self.pid)
            .field("socket_path", &self.socket_path)
            .field("owned", &self.child.is_some())
            .finish()
    }
}

impl fmt::Display for ShutdownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownOutcome::Graceful => write!(f, "graceful"),
            ShutdownOutcome::Killed => write!(f, "killed"),
            ShutdownOutcome::AlreadyExited => write!(f, "already exited"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::process::Stdio;

    use tokio::process::Command;

    use super::*;

    #[tokio::test]
    async fn test_vm_process_kill_reaps_child() -> anyhow::Result<()> {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let mut process = VmProcess::from_child(child, "/tmp/unused.sock", None)?;

        assert!(process.try_exit_status()?.is_none());
        assert!(!process.wait_exit(Duration::from_millis(50)).await?);

        process.kill().await?;
        assert!(process.try_exit_status()?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_detached_process_never_reports_exit() -> anyhow::Result<()> {
        let mut process = VmProcess::detached(4242, "/tmp/unused.sock");
        assert_eq!(process.pid(), 4242);
        assert!(process.try_exit_status()?.is_none());
        assert!(!process.wait_exit(Duration::from_millis(10)).await?);
        process.kill().await?;
        Ok(())
    }
}
