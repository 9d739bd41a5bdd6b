use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use fleetutils::ProcessMonitor;
use http_body_util::{BodyExt, Full};
use hyper::{body::Bytes, header, Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as HyperlocalUri};
use serde_json::{json, Value};
use tokio::{process::Command, time::Instant};

use crate::{
    config::{FIRECRACKER_BINARY, FIRECRACKER_EXE_ENV_VAR},
    runtime::ConsoleMonitor,
    FleetError, FleetResult,
};

use super::{BootSpec, Hypervisor, ShutdownOutcome, VmProcess};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Interval between control socket checks while a hypervisor starts.
const API_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Timeout of a single control socket request.
const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runs sandboxes as Firecracker microVMs.
#[derive(Debug, Clone)]
pub struct FirecrackerHypervisor {
    binary: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirecrackerHypervisor {
    /// Uses the given hypervisor binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Locates the hypervisor binary through `FLEET_FIRECRACKER_EXE` or `PATH`.
    pub fn from_env() -> FleetResult<Self> {
        let binary = fleetutils::resolve_binary(FIRECRACKER_BINARY, FIRECRACKER_EXE_ENV_VAR)?;
        tracing::debug!(binary = %binary.display(), "using hypervisor binary");
        Ok(Self::new(binary))
    }

    /// The hypervisor binary.
    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Hypervisor for FirecrackerHypervisor {
    async fn spawn(&self, spec: &BootSpec) -> FleetResult<VmProcess> {
        let config = serde_json::to_vec_pretty(&spec.firecracker_config())?;
        tokio::fs::write(spec.config_path(), config).await?;

        let socket_path = spec.socket_path();
        match tokio::fs::remove_file(&socket_path).await {
            Ok(()) => tracing::debug!(socket = %socket_path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut child = Command::new(&self.binary)
            .arg("--api-sock")
            .arg(&socket_path)
            .arg("--config-file")
            .arg(spec.config_path())
            .arg("--id")
            .arg(spec.get_id())
            .current_dir(spec.get_workdir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FleetError::ProcessLaunch(format!(
                    "failed to start {}: {e}",
                    self.binary.display()
                ))
            })?;

        let pid = child.id().unwrap_or_default();
        let monitor: Option<Box<dyn ProcessMonitor>> =
            match (child.stdout.take(), child.stderr.take()) {
                (Some(stdout), Some(stderr)) => {
                    let mut monitor = ConsoleMonitor::new();
                    monitor
                        .start(pid, stdout, stderr, &spec.console_log_path())
                        .await?;
                    Some(Box::new(monitor))
                }
                _ => None,
            };

        let process = VmProcess::from_child(child, &socket_path, monitor)?;
        tracing::info!(id = %spec.get_id(), pid = process.pid(), "hypervisor started");
        Ok(process)
    }

    async fn wait_ready(&self, process: &mut VmProcess, timeout: Duration) -> FleetResult<()> {
        let deadline = Instant::now() + timeout;
        let mut last_error = String::from("no response");

        loop {
            if let Some(status) = process.try_exit_status()? {
                return Err(FleetError::ProcessLaunch(format!(
                    "hypervisor exited with {status} before its control socket answered"
                )));
            }

            match api_request(process.socket_path(), Method::GET, "/", None).await {
                Ok(status) if status.is_success() => return Ok(()),
                Ok(status) => last_error = format!("status {status}"),
                Err(e) => last_error = e.to_string(),
            }

            if Instant::now() >= deadline {
                tracing::warn!(pid = process.pid(), %last_error, "hypervisor control socket timed out");
                return Err(FleetError::BootTimeout {
                    path: process.socket_path().to_path_buf(),
                    timeout_secs: timeout.as_secs(),
                });
            }

            tokio::time::sleep(API_POLL_INTERVAL).await;
        }
    }

    async fn shutdown(
        &self,
        process: &mut VmProcess,
        timeout: Duration,
    ) -> FleetResult<ShutdownOutcome> {
        if process.try_exit_status()?.is_some() {
            process.release_monitor().await;
            return Ok(ShutdownOutcome::AlreadyExited);
        }

        let body = json!({ "action_type": "SendCtrlAltDel" });
        match api_request(process.socket_path(), Method::PUT, "/actions", Some(body)).await {
            Ok(status) if status.is_success() => {}
            Ok(status) => {
                tracing::warn!(pid = process.pid(), status = %status, "ctrl-alt-del rejected")
            }
            Err(e) => tracing::warn!(pid = process.pid(), error = %e, "ctrl-alt-del failed"),
        }

        let outcome = if process.wait_exit(timeout).await? {
            ShutdownOutcome::Graceful
        } else {
            tracing::warn!(pid = process.pid(), "guest did not shut down in time, killing");
            process.kill().await?;
            ShutdownOutcome::Killed
        };

        process.release_monitor().await;
        Ok(outcome)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sends one request over the hypervisor control socket and returns the response status.
async fn api_request(
    socket_path: &Path,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> FleetResult<StatusCode> {
    let client: Client<UnixConnector, Full<Bytes>> = Client::unix();
    let uri: Uri = HyperlocalUri::new(socket_path, path).into();

    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::ACCEPT, "application/json");
    let body = match body {
        Some(payload) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Full::new(Bytes::from(payload.to_string()))
        }
        None => Full::new(Bytes::new()),
    };
    let request = builder.body(body).map_err(|e| {
        FleetError::ProcessLaunch(format!("invalid control request for {path}: {e}"))
    })?;

    let exchange = async {
        let response = client.request(request).await.map_err(|e| {
            FleetError::ProcessLaunch(format!(
                "control socket {} unreachable: {e}",
                socket_path.display()
            ))
        })?;

        let status = response.status();
        response.into_body().collect().await.map_err(|e| {
            FleetError::ProcessLaunch(format!(
                "unreadable response on {}: {e}",
                socket_path.display()
            ))
        })?;
        Ok(status)
    };

    tokio::time::timeout(API_REQUEST_TIMEOUT, exchange)
        .await
        .map_err(|_| {
            FleetError::ProcessLaunch(format!(
                "request to {} timed out",
                socket_path.display()
            ))
        })?
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::UnixListener,
    };

    use super::*;

    /// Serves one connection on `listener`, answering with `response` once a full request with
    /// a body of `body_len` bytes has arrived. Returns the raw request.
    async fn answer_once(
        listener: UnixListener,
        body_len: usize,
        response: &'static [u8],
    ) -> std::io::Result<String> {
        let (mut stream, _) = listener.accept().await?;
        let mut request = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                if request.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        stream.write_all(response).await?;
        Ok(String::from_utf8_lossy(&request).into_owned())
    }

    #[tokio::test]
    async fn test_api_request_sends_json_over_socket() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket_path)?;
        let body = json!({ "action_type": "SendCtrlAltDel" });
        let body_len = body.to_string().len();

        let server = tokio::spawn(answer_once(
            listener,
            body_len,
            b"HTTP/1.1 204 No Content\r\n\r\n",
        ));

        let status = api_request(&socket_path, Method::PUT, "/actions", Some(body)).await?;
        let request = server.await??;

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(request.starts_with("PUT /actions HTTP/1.1\r\n"));
        let lowered = request.to_ascii_lowercase();
        assert!(lowered.contains("content-type: application/json\r\n"));
        assert!(lowered.contains(&format!("content-length: {body_len}\r\n")));
        assert!(request.ends_with(r#"{"action_type":"SendCtrlAltDel"}"#));
        Ok(())
    }

    #[tokio::test]
    async fn test_api_request_reads_body_of_error_response() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket_path)?;

        let server = tokio::spawn(answer_once(
            listener,
            0,
            b"HTTP/1.1 400 Bad Request\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n15\r\n{\"fault_message\":\"x\"}\r\n0\r\n\r\n",
        ));

        let status = api_request(&socket_path, Method::GET, "/", None).await?;
        let request = server.await??;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(request.starts_with("GET / HTTP/1.1\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_api_request_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = api_request(&dir.path().join("missing.sock"), Method::GET, "/", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::ProcessLaunch(_)));
    }

    #[tokio::test]
    async fn test_wait_ready_accepts_answering_socket() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket_path)?;
        let server = tokio::spawn(answer_once(
            listener,
            0,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n{}",
        ));

        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()?;
        let mut process = VmProcess::from_child(child, &socket_path, None)?;

        let hypervisor = FirecrackerHypervisor::new("/nonexistent/firecracker");
        hypervisor
            .wait_ready(&mut process, Duration::from_secs(5))
            .await?;

        server.await??;
        process.kill().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_ready_reports_early_exit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let child = Command::new("true").kill_on_drop(true).spawn()?;
        let mut process = VmProcess::from_child(child, dir.path().join("missing.sock"), None)?;

        let hypervisor = FirecrackerHypervisor::new("/nonexistent/firecracker");
        let err = hypervisor
            .wait_ready(&mut process, Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::ProcessLaunch(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_on_silent_process() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()?;
        let mut process = VmProcess::from_child(child, dir.path().join("missing.sock"), None)?;

        let hypervisor = FirecrackerHypervisor::new("/nonexistent/firecracker");
        let err = hypervisor
            .wait_ready(&mut process, Duration::from_millis(200))
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::BootTimeout { .. }));
        process.kill().await?;
        Ok(())
    }
}
