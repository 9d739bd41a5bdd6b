mod common;

use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use common::TestAgent;
use fleetcore::{
    client::AgentClient,
    config::{ProvisionerConfig, WorkerDescriptor},
    pool::WorkerPool,
    provision::{host_name_for, ProvisionPhase, Provisioner, SimulatedCloud, WorkshopRequest},
    registry::Resources,
    ErrorKind, FleetError,
};
use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const TOKEN: &str = "workshop-secret";

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_provision_and_teardown_workshop() -> anyhow::Result<()> {
    let agent = TestAgent::start("fleet-ws-ws-1", TOKEN, 3).await?;
    let cloud = Arc::new(SimulatedCloud::new(Ipv4Addr::LOCALHOST));
    let provisioner = Provisioner::new(
        cloud.clone(),
        ProvisionerConfig::builder()
            .agent_port(agent.addr.port())
            .auth_token(TOKEN)
            .poll_interval(Duration::from_millis(50))
            .ready_timeout(Duration::from_secs(5))
            .build(),
    )?;

    let request = WorkshopRequest::builder()
        .workshop_id("ws-1")
        .seats(3)
        .build();
    let status = provisioner
        .provision(request, CancellationToken::new())
        .await?;

    assert_eq!(status.phase, ProvisionPhase::Ready);
    assert_eq!(status.host_name, Some(host_name_for("ws-1")));
    assert_eq!(status.agent_url, Some(agent.url()));

    let ips: Vec<String> = status.sandboxes.iter().map(|s| s.ip.to_string()).collect();
    assert_eq!(ips, ["172.16.0.11", "172.16.0.12", "172.16.0.13"]);
    assert_eq!(agent.registry.count().await, 3);

    let spec = cloud
        .host_spec(&host_name_for("ws-1"))
        .ok_or_else(|| anyhow::anyhow!("host missing"))?;
    assert_eq!(spec.seats, 3);
    assert_eq!(spec.auth_token, TOKEN);

    provisioner.teardown("ws-1").await?;
    assert_eq!(agent.registry.count().await, 0);
    assert!(cloud.host_names().is_empty());
    assert!(provisioner.status("ws-1").await.is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unhealthy_host_fails_workshop_and_keeps_host() -> anyhow::Result<()> {
    let cloud = Arc::new(SimulatedCloud::new(Ipv4Addr::LOCALHOST));
    let provisioner = Provisioner::new(
        cloud.clone(),
        ProvisionerConfig::builder()
            .agent_port(1)
            .poll_interval(Duration::from_millis(100))
            .ready_timeout(Duration::from_millis(800))
            .request_timeout(Duration::from_secs(1))
            .build(),
    )?;

    let request = WorkshopRequest::builder()
        .workshop_id("ws-dead")
        .seats(2)
        .build();
    let err = provisioner
        .provision(request, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HealthTimeout);

    let status = provisioner
        .status("ws-dead")
        .await
        .ok_or_else(|| anyhow::anyhow!("status missing"))?;
    assert!(matches!(status.phase, ProvisionPhase::Failed { .. }));
    assert!(status.sandboxes.is_empty());
    assert_eq!(cloud.host_names(), [host_name_for("ws-dead")]);

    // Teardown deletes the host even though its agent never answered.
    provisioner.teardown("ws-dead").await?;
    assert!(cloud.host_names().is_empty());
    assert!(provisioner.status("ws-dead").await.is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_seats_beyond_capacity_fail_workshop() -> anyhow::Result<()> {
    let agent = TestAgent::start("fleet-ws-ws-2", TOKEN, 2).await?;
    let cloud = Arc::new(SimulatedCloud::new(Ipv4Addr::LOCALHOST));
    let provisioner = Provisioner::new(
        cloud.clone(),
        ProvisionerConfig::builder()
            .agent_port(agent.addr.port())
            .auth_token(TOKEN)
            .poll_interval(Duration::from_millis(50))
            .ready_timeout(Duration::from_secs(5))
            .seat_concurrency(1)
            .build(),
    )?;

    let request = WorkshopRequest::builder()
        .workshop_id("ws-2")
        .seats(3)
        .build();
    let err = provisioner
        .provision(request, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapacityExceeded);

    let status = provisioner
        .status("ws-2")
        .await
        .ok_or_else(|| anyhow::anyhow!("status missing"))?;
    assert!(matches!(status.phase, ProvisionPhase::Failed { .. }));
    assert_eq!(status.sandboxes.len(), 2);
    assert_eq!(cloud.host_names().len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_provision_workshop_on_worker_pool() -> anyhow::Result<()> {
    let a = TestAgent::start("worker-a", TOKEN, 4).await?;
    let b = TestAgent::start("worker-b", TOKEN, 4).await?;
    let pool = WorkerPool::new(
        &[worker("worker-a", a.url(), 4), worker("worker-b", b.url(), 4)],
        Duration::from_secs(2),
        3,
    )?;
    let provisioner =
        Provisioner::with_runtime(Arc::new(pool), ProvisionerConfig::builder().build())?;

    let request = WorkshopRequest::builder()
        .workshop_id("ws-pool")
        .seats(4)
        .build();
    let status = provisioner
        .provision(request, CancellationToken::new())
        .await?;

    assert_eq!(status.phase, ProvisionPhase::Ready);
    assert!(status.host_name.is_none());
    assert!(status.agent_url.is_none());
    let seats: Vec<u32> = status.sandboxes.iter().map(|s| s.seat_id).collect();
    assert_eq!(seats, [1, 2, 3, 4]);

    let (on_a, on_b) = (a.registry.count().await, b.registry.count().await);
    assert_eq!(on_a + on_b, 4);
    assert!(on_a > 0 && on_b > 0);
    assert!(provisioner.auth_token("ws-pool").await.is_none());

    provisioner.teardown("ws-pool").await?;
    assert_eq!(a.registry.count().await + b.registry.count().await, 0);
    assert!(provisioner.status("ws-pool").await.is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_provision_workshop_on_existing_host() -> anyhow::Result<()> {
    let agent = TestAgent::start("shared-host", TOKEN, 4).await?;
    agent
        .registry
        .create("ws-other", 1, Resources::default())
        .await?;

    let client = AgentClient::new(agent.url(), TOKEN, Duration::from_secs(2))?;
    let provisioner =
        Provisioner::with_runtime(Arc::new(client), ProvisionerConfig::builder().build())?;

    let request = WorkshopRequest::builder()
        .workshop_id("ws-3")
        .seats(3)
        .build();
    let status = provisioner
        .provision(request.clone(), CancellationToken::new())
        .await?;
    assert_eq!(status.phase, ProvisionPhase::Ready);
    assert_eq!(agent.registry.count().await, 4);

    // One workshop at a time until it is torn down.
    assert!(provisioner
        .provision(request, CancellationToken::new())
        .await
        .is_err());

    provisioner.teardown("ws-3").await?;
    assert_eq!(agent.registry.count().await, 1);
    assert_eq!(agent.registry.list(Some("ws-other")).await.len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_pool_without_room_fails_workshop() -> anyhow::Result<()> {
    let agent = TestAgent::start("worker-small", TOKEN, 1).await?;
    let pool = WorkerPool::new(
        &[worker("worker-small", agent.url(), 1)],
        Duration::from_secs(2),
        3,
    )?;
    let provisioner = Provisioner::with_runtime(
        Arc::new(pool),
        ProvisionerConfig::builder().seat_concurrency(1).build(),
    )?;

    let request = WorkshopRequest::builder()
        .workshop_id("ws-4")
        .seats(2)
        .build();
    let err = provisioner
        .provision(request, CancellationToken::new())
        .await
        .unwrap_err();
    let FleetError::WithSandbox { key, source } = err else {
        panic!("expected a seat error, got {err:?}");
    };
    assert_eq!(key.seat_id, 2);
    assert!(matches!(*source, FleetError::NoWorkerAvailable(_)));

    let status = provisioner
        .status("ws-4")
        .await
        .ok_or_else(|| anyhow::anyhow!("status missing"))?;
    assert!(matches!(status.phase, ProvisionPhase::Failed { .. }));
    assert_eq!(status.sandboxes.len(), 1);
    assert_eq!(agent.registry.count().await, 1);

    provisioner.teardown("ws-4").await?;
    assert_eq!(agent.registry.count().await, 0);
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn worker(name: &str, address: String, capacity: usize) -> WorkerDescriptor {
    WorkerDescriptor {
        name: Some(name.to_string()),
        address,
        token: TOKEN.to_string(),
        capacity,
    }
}
