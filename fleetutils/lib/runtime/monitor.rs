use std::path::Path;

use async_trait::async_trait;
use tokio::process::{ChildStderr, ChildStdout};

use crate::FleetutilsResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A trait for observing the output and lifetime of a spawned child process.
///
/// Implementations take ownership of the child's stdout/stderr pipes when it starts and release
/// whatever they hold when the process is gone.
#[async_trait]
pub trait ProcessMonitor: Send + Sync {
    /// Start monitoring the process `pid`, writing its output under `log_path`.
    async fn start(
        &mut self,
        pid: u32,
        stdout: ChildStdout,
        stderr: ChildStderr,
        log_path: &Path,
    ) -> FleetutilsResult<()>;

    /// Stop monitoring.
    async fn stop(&mut self) -> FleetutilsResult<()>;
}
