use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use clap::Parser;
use fleetcore::{
    cli::{AnsiStyles, CloudArgs, FleetctlArgs, FleetctlSubcommand, PoolArgs},
    config::ProvisionerConfig,
    pool::{WorkerPool, WorkerStatus},
    provision::{
        CloudProvider, GcloudProvider, ProvisionPhase, Provisioner, SimulatedCloud,
        WorkshopRequest, WorkshopStatus,
    },
    registry::Sandbox,
    FleetResult,
};
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

    let args = FleetctlArgs::parse();
    let request_timeout = args.request_timeout();
    let resources = args.subcommand.resources();

    match args.subcommand {
        FleetctlSubcommand::Provision {
            workshop_id,
            seats,
            ready_timeout_secs,
            cloud,
            ..
        } => {
            tracing::trace!("provisioning workshop: workshop_id={workshop_id}, seats={seats}");
            let provisioner = provisioner(
                &cloud,
                request_timeout,
                Duration::from_secs(ready_timeout_secs),
            )?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, stopping provisioning");
                    on_interrupt.cancel();
                }
            });

            let request = WorkshopRequest::builder()
                .workshop_id(workshop_id.as_str())
                .seats(seats)
                .resources(resources)
                .build();
            let result = provisioner.provision(request, cancel).await;

            if let Some(status) = provisioner.status(&workshop_id).await {
                print_workshop(&status);
            }
            if cloud.auth_token.is_none() {
                if let Some(token) = provisioner.auth_token(&workshop_id).await {
                    println!("{} {token}", "token:".header());
                }
            }
            result?;
        }
        FleetctlSubcommand::Teardown { workshop_id, cloud } => {
            tracing::trace!("tearing down workshop: workshop_id={workshop_id}");
            let provisioner = provisioner(&cloud, request_timeout, request_timeout)?;
            provisioner.teardown(&workshop_id).await?;
            println!("workshop {} torn down", workshop_id.literal());
        }
        FleetctlSubcommand::ProvisionPool {
            workshop_id,
            seats,
            pool,
            ..
        } => {
            tracing::trace!("provisioning workshop on pool: workshop_id={workshop_id}, seats={seats}");
            let provisioner = pool_provisioner(&pool, request_timeout).await?;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, stopping provisioning");
                    on_interrupt.cancel();
                }
            });

            let request = WorkshopRequest::builder()
                .workshop_id(workshop_id.as_str())
                .seats(seats)
                .resources(resources)
                .build();
            let result = provisioner.provision(request, cancel).await;

            if let Some(status) = provisioner.status(&workshop_id).await {
                print_workshop(&status);
            }
            result?;
        }
        FleetctlSubcommand::TeardownPool { workshop_id, pool } => {
            let provisioner = pool_provisioner(&pool, request_timeout).await?;
            provisioner.teardown(&workshop_id).await?;
            println!("workshop {} torn down", workshop_id.literal());
        }
        FleetctlSubcommand::Place {
            workshop_id,
            seat_id,
            pool,
            ..
        } => {
            let pool = worker_pool(&pool, request_timeout).await?;
            let placement = pool.place(&workshop_id, seat_id, resources).await?;
            println!(
                "{} placed on {} ({})",
                placement.sandbox.key().to_string().literal(),
                placement.worker.header(),
                placement.address
            );
            print_sandboxes(std::slice::from_ref(&placement.sandbox));
        }
        FleetctlSubcommand::Release {
            workshop_id,
            seat_id,
            pool,
        } => {
            let pool = worker_pool(&pool, request_timeout).await?;
            pool.release(&workshop_id, seat_id).await?;
            println!("{workshop_id}/{seat_id} released");
        }
        FleetctlSubcommand::Vms { workshop_id, pool } => {
            let pool = worker_pool(&pool, request_timeout).await?;
            print_sandboxes(&pool.list(workshop_id.as_deref()).await);
        }
        FleetctlSubcommand::Workers {
            watch: false, pool, ..
        } => {
            let pool = worker_pool(&pool, request_timeout).await?;
            print_workers(&pool.statuses().await);
        }
        FleetctlSubcommand::Workers {
            watch: true,
            interval_secs,
            failure_threshold,
            pool,
        } => {
            let interval = Duration::from_secs(interval_secs.max(1));
            let pool = Arc::new(
                WorkerPool::from_file(&pool.workers, request_timeout, failure_threshold).await?,
            );

            let cancel = CancellationToken::new();
            let checks = pool.clone().spawn_health_loop(interval, cancel.clone());
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        print_workers(&pool.statuses().await);
                        println!();
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            cancel.cancel();
            checks.await?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

fn provisioner(
    cloud: &CloudArgs,
    request_timeout: Duration,
    ready_timeout: Duration,
) -> FleetResult<Provisioner> {
    let provider: Arc<dyn CloudProvider> = if cloud.simulate {
        tracing::warn!("using a simulated cloud, every host is 127.0.0.1");
        Arc::new(SimulatedCloud::new(Ipv4Addr::LOCALHOST))
    } else {
        Arc::new(GcloudProvider::from_env(cloud.cloud_config()?)?)
    };

    Provisioner::new(
        provider,
        cloud.provisioner_config(request_timeout, ready_timeout),
    )
}

/// Loads the pool and runs one health check so every command sees current worker state. A
/// single missed check takes a worker out of rotation.
async fn worker_pool(args: &PoolArgs, request_timeout: Duration) -> FleetResult<WorkerPool> {
    let pool = WorkerPool::from_file(&args.workers, request_timeout, 1).await?;
    let healthy = pool.check_health().await.unwrap_or_default();
    tracing::debug!(workers = %args.workers.display(), healthy, "worker pool loaded");
    Ok(pool)
}

/// A provisioner that places seats on the worker pool.
async fn pool_provisioner(args: &PoolArgs, request_timeout: Duration) -> FleetResult<Provisioner> {
    let pool = worker_pool(args, request_timeout).await?;
    Provisioner::with_runtime(
        Arc::new(pool),
        ProvisionerConfig::builder()
            .request_timeout(request_timeout)
            .build(),
    )
}

fn print_workshop(status: &WorkshopStatus) {
    let phase = match &status.phase {
        ProvisionPhase::Ready => status.phase.to_string().valid(),
        ProvisionPhase::Failed { .. } => status.phase.to_string().invalid(),
        _ => status.phase.to_string(),
    };

    println!("{} {}", "workshop:".header(), status.workshop_id);
    println!("{} {phase}", "phase:".header());
    if let Some(host_name) = &status.host_name {
        println!("{} {host_name}", "host:".header());
    }
    if let Some(agent_url) = &status.agent_url {
        println!("{} {agent_url}", "agent:".header());
    }
    println!(
        "{} {}/{}",
        "seats:".header(),
        status.sandboxes.len(),
        status.seats
    );
    print_sandboxes(&status.sandboxes);
}

fn print_sandboxes(sandboxes: &[Sandbox]) {
    if sandboxes.is_empty() {
        println!("no sandboxes");
        return;
    }

    println!(
        "{}",
        format!(
            "{:<24} {:>5} {:<16} {:<12} {:<10}",
            "WORKSHOP", "SEAT", "IP", "TAP", "STATUS"
        )
        .header()
    );
    for sandbox in sandboxes {
        println!(
            "{:<24} {:>5} {:<16} {:<12} {:<10}",
            sandbox.workshop_id,
            sandbox.seat_id,
            sandbox.ip.to_string(),
            sandbox.tap_name,
            sandbox.status.to_string()
        );
    }
}

fn print_workers(workers: &[WorkerStatus]) {
    println!(
        "{}",
        format!(
            "{:<20} {:<32} {:<10} {:>9}  {}",
            "NAME", "ADDRESS", "STATE", "VMS", "LAST ERROR"
        )
        .header()
    );
    for worker in workers {
        let state = if worker.suspect {
            "suspect".invalid()
        } else if worker.healthy {
            "healthy".valid()
        } else {
            "down".invalid()
        };

        println!(
            "{:<20} {:<32} {:<10} {:>9}  {}",
            worker.name,
            worker.address,
            state,
            format!("{}/{}", worker.vm_count, worker.capacity),
            worker.last_error.as_deref().unwrap_or("-")
        );
    }
}
