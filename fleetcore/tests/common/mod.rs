use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use fleetcore::{
    config::{AgentConfig, KERNEL_IMAGE_FILENAME, ROOTFS_IMAGE_FILENAME},
    network::{NetworkManager, SimulatedDriver},
    registry::{NoopStore, Registry},
    server::AgentServer,
    vm::{MicroVmSupervisor, SimulatedHypervisor},
};
use ipnetwork::Ipv4Network;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A host agent with simulated networking and hypervisor, served on a random local port.
pub struct TestAgent {
    pub addr: SocketAddr,
    pub registry: Arc<Registry>,
    shutdown: CancellationToken,
    _dir: TempDir,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TestAgent {
    /// Starts an agent accepting `token` with room for `capacity` sandboxes.
    pub async fn start(worker_id: &str, token: &str, capacity: usize) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let images_dir = write_images(&dir).await?;

        let config = AgentConfig::builder()
            .worker_id(worker_id)
            .auth_token(token)
            .capacity(capacity)
            .images_dir(images_dir)
            .run_dir(dir.path().join("run"))
            .build();

        Self::launch(config, dir).await
    }

    /// Starts an agent whose sandboxes live on the loopback subnet, so seat `n` is reachable at
    /// `127.0.0.{10 + n}` where tests can run guest services.
    #[allow(dead_code)]
    pub async fn start_on_loopback(
        token: &str,
        terminal_port: u16,
        files_port: u16,
    ) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let images_dir = write_images(&dir).await?;

        let config = AgentConfig::builder()
            .worker_id("loopback")
            .auth_token(token)
            .capacity(4)
            .bridge_cidr(Ipv4Network::new(Ipv4Addr::new(127, 0, 0, 1), 24)?)
            .terminal_port(terminal_port)
            .files_port(files_port)
            .images_dir(images_dir)
            .run_dir(dir.path().join("run"))
            .build();

        Self::launch(config, dir).await
    }

    async fn launch(config: AgentConfig, dir: TempDir) -> anyhow::Result<Self> {
        let network = NetworkManager::from_config(Arc::new(SimulatedDriver::new()), &config);
        let supervisor =
            MicroVmSupervisor::new(Arc::new(SimulatedHypervisor::new()), network, &config);
        let registry = Arc::new(Registry::new(config, supervisor, Arc::new(NoopStore)));
        registry.initialize().await?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let server = AgentServer::new(addr, registry.clone())?;
        let stopped = shutdown.clone();
        tokio::spawn(async move {
            let _ = server
                .serve_on(listener, async move { stopped.cancelled().await })
                .await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown,
            _dir: dir,
        })
    }

    /// Base URL of the agent API.
    #[allow(dead_code)]
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn write_images(dir: &TempDir) -> anyhow::Result<PathBuf> {
    let images_dir = dir.path().join("images");
    tokio::fs::create_dir_all(&images_dir).await?;
    tokio::fs::write(images_dir.join(KERNEL_IMAGE_FILENAME), b"kernel").await?;
    tokio::fs::write(images_dir.join(ROOTFS_IMAGE_FILENAME), b"rootfs").await?;
    Ok(images_dir)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
