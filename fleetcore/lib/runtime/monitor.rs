use std::{io::Write, path::Path, time::Duration};

use async_trait::async_trait;
use fleetutils::{FleetutilsResult, ProcessMonitor, RotatingLog};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{ChildStderr, ChildStdout},
    task::JoinHandle,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long `stop` waits for the output pumps to drain before aborting them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Streams a hypervisor's stdout and stderr into the sandbox's rotating console log.
#[derive(Default)]
pub struct ConsoleMonitor {
    /// The console log, once started.
    log: Option<RotatingLog>,

    /// The tasks copying the child's pipes into the log.
    pumps: Vec<JoinHandle<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ConsoleMonitor {
    /// Creates a monitor that has not been started yet.
    pub fn new() -> Self {
        Self::default()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ProcessMonitor for ConsoleMonitor {
    async fn start(
        &mut self,
        pid: u32,
        stdout: ChildStdout,
        stderr: ChildStderr,
        log_path: &Path,
    ) -> FleetutilsResult<()> {
        let log = RotatingLog::new(log_path).await?;

        self.pumps.push(tokio::spawn(pump(
            stdout,
            log.get_sync_writer(),
            pid,
            "stdout",
        )));
        self.pumps.push(tokio::spawn(pump(
            stderr,
            log.get_sync_writer(),
            pid,
            "stderr",
        )));
        self.log = Some(log);

        Ok(())
    }

    async fn stop(&mut self) -> FleetutilsResult<()> {
        for mut pump in self.pumps.drain(..) {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut pump).await.is_err() {
                pump.abort();
            }
        }

        if let Some(log) = self.log.take() {
            log.flush().await?;
        }

        Ok(())
    }
}

impl Drop for ConsoleMonitor {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn pump(
    mut reader: impl AsyncRead + Unpin,
    mut writer: impl Write,
    pid: u32,
    stream: &'static str,
) {
    let mut buf = [0u8; 4096];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]) {
                    tracing::error!(pid, stream, error = %e, "failed to write hypervisor console log");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(pid, stream, error = %e, "failed to read hypervisor output");
                break;
            }
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
    async fn test_console_monitor_captures_both_streams() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let log_path = dir.path().join("console.log");

        let mut child = Command::new("sh")
            .args(["-c", "echo booted; echo oops >&2"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child.id().unwrap_or_default();
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let mut monitor = ConsoleMonitor::new();
        monitor.start(pid, stdout, stderr, &log_path).await?;
        child.wait().await?;
        monitor.stop().await?;

        let console = tokio::fs::read_to_string(&log_path).await?;
        assert!(console.contains("booted"));
        assert!(console.contains("oops"));
        Ok(())
    }
}
