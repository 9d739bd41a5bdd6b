use std::sync::Arc;

use clap::Parser;
use fleetcore::{
    cli::FleetdArgs,
    config::{AgentConfig, KERNEL_IMAGE_FILENAME, ROOTFS_IMAGE_FILENAME},
    network::{IpCommandDriver, NetworkDriver, NetworkManager, SimulatedDriver},
    registry::{JsonFileStore, NoopStore, Registry, StateStore},
    server::AgentServer,
    vm::{FirecrackerHypervisor, Hypervisor, MicroVmSupervisor, SimulatedHypervisor},
    FleetResult,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> FleetResult<()> {
    dotenvy::dotenv().ok();

    fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = FleetdArgs::parse();
    let config = args.agent_config();
    config.validate()?;

    let (driver, hypervisor): (Arc<dyn NetworkDriver>, Arc<dyn Hypervisor>) = if args.simulate {
        tracing::warn!("running with simulated networking and hypervisor");
        prepare_simulated_images(&config).await?;
        (
            Arc::new(SimulatedDriver::new()),
            Arc::new(SimulatedHypervisor::new()),
        )
    } else {
        let hypervisor = match &args.firecracker {
            Some(binary) => FirecrackerHypervisor::new(binary),
            None => FirecrackerHypervisor::from_env()?,
        };
        (Arc::new(IpCommandDriver::new()), Arc::new(hypervisor))
    };

    let store: Arc<dyn StateStore> = match &args.state_file {
        Some(path) => Arc::new(JsonFileStore::new(path)),
        None => Arc::new(NoopStore),
    };

    let network = NetworkManager::from_config(driver, &config);
    let supervisor = MicroVmSupervisor::new(hypervisor, network, &config);
    let registry = Arc::new(Registry::new(config, supervisor, store));
    registry.initialize().await?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let server = AgentServer::new(args.listen, registry.clone())?;
    let stopped = shutdown.clone();
    server
        .serve(async move { stopped.cancelled().await })
        .await?;

    if args.cleanup_on_exit {
        let destroyed = registry.destroy_all().await?;
        tracing::info!(destroyed, "destroyed sandboxes on exit");
    } else {
        tracing::info!(
            remaining = registry.count().await,
            "leaving sandboxes running"
        );
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

/// Cancels `shutdown` on the first SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) -> FleetResult<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        shutdown.cancel();
    });
    Ok(())
}

/// Simulated sandboxes never read their images, but the supervisor still copies the root
/// filesystem per sandbox. Empty placeholders keep that working on a bare machine.
async fn prepare_simulated_images(config: &AgentConfig) -> FleetResult<()> {
    let images_dir = config.get_images_dir();
    tokio::fs::create_dir_all(images_dir).await?;

    for name in [KERNEL_IMAGE_FILENAME, ROOTFS_IMAGE_FILENAME] {
        let path = images_dir.join(name);
        if !tokio::fs::try_exists(&path).await? {
            tokio::fs::write(&path, b"").await?;
            tracing::debug!(path = %path.display(), "created placeholder image");
        }
    }
    Ok(())
}
