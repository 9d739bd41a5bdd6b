mod common;

use std::time::Duration;

use common::TestAgent;
use fleetcore::{config::WorkerDescriptor, pool::WorkerPool, registry::Resources, FleetError};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const TOKEN: &str = "pool-secret";

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn worker(name: &str, address: String, token: &str, capacity: usize) -> WorkerDescriptor {
    WorkerDescriptor {
        name: Some(name.to_string()),
        address,
        token: token.to_string(),
        capacity,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_placement_skips_unreachable_worker() -> anyhow::Result<()> {
    let agent = TestAgent::start("worker-b", TOKEN, 4).await?;
    let pool = WorkerPool::new(
        &[
            worker("worker-a", "http://127.0.0.1:1".to_string(), TOKEN, 4),
            worker("worker-b", agent.url(), TOKEN, 4),
        ],
        Duration::from_secs(2),
        3,
    )?;

    let placement = pool.place("ws-1", 1, Resources::default()).await?;
    assert_eq!(placement.worker, "worker-b");
    assert_eq!(placement.sandbox.seat_id, 1);
    assert_eq!(agent.registry.count().await, 1);

    let statuses = pool.statuses().await;
    assert_eq!(statuses[0].consecutive_failures, 1);
    assert!(statuses[0].last_error.is_some());
    assert_eq!(statuses[1].vm_count, 1);

    assert!(matches!(
        pool.place("ws-1", 1, Resources::default()).await,
        Err(FleetError::SandboxExists(_))
    ));

    pool.release("ws-1", 1).await?;
    assert_eq!(agent.registry.count().await, 0);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_placement_skips_full_and_rejecting_workers() -> anyhow::Result<()> {
    let full = TestAgent::start("worker-full", TOKEN, 1).await?;
    let rejecting = TestAgent::start("worker-rejecting", "another-token", 4).await?;
    let open = TestAgent::start("worker-open", TOKEN, 4).await?;

    full.registry
        .create("ws-other", 1, Resources::default())
        .await?;

    let pool = WorkerPool::new(
        &[
            worker("worker-full", full.url(), TOKEN, 4),
            worker("worker-rejecting", rejecting.url(), TOKEN, 4),
            worker("worker-open", open.url(), TOKEN, 4),
        ],
        Duration::from_secs(2),
        3,
    )?;

    let placement = pool.place("ws-1", 1, Resources::default()).await?;
    assert_eq!(placement.worker, "worker-open");

    let statuses = pool.statuses().await;
    assert!(!statuses[0].accepts_placement());
    assert!(statuses[1].suspect);
    assert!(statuses[2].accepts_placement());

    // Health checks see the full worker's real load and keep the suspect worker out.
    assert_eq!(pool.check_health().await, Some(3));
    let statuses = pool.statuses().await;
    assert_eq!(statuses[0].vm_count, 1);
    assert_eq!(statuses[0].capacity, 1);
    assert!(statuses[1].suspect);

    let placement = pool.place("ws-1", 2, Resources::default()).await?;
    assert_eq!(placement.worker, "worker-open");
    assert_eq!(open.registry.count().await, 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_pool_lists_and_destroys_workshop() -> anyhow::Result<()> {
    let a = TestAgent::start("worker-a", TOKEN, 4).await?;
    let b = TestAgent::start("worker-b", TOKEN, 4).await?;
    let pool = WorkerPool::new(
        &[
            worker("worker-a", a.url(), TOKEN, 4),
            worker("worker-b", b.url(), TOKEN, 4),
        ],
        Duration::from_secs(2),
        3,
    )?;

    for seat in 1..=4 {
        pool.place("ws-1", seat, Resources::default()).await?;
    }
    pool.place("ws-2", 1, Resources::default()).await?;

    // Equal loads alternate between the workers.
    assert_eq!(a.registry.count().await, 3);
    assert_eq!(b.registry.count().await, 2);
    assert_eq!(pool.list(Some("ws-1")).await.len(), 4);
    assert_eq!(pool.list(None).await.len(), 5);

    assert_eq!(pool.destroy_workshop("ws-1").await?, 4);
    assert_eq!(pool.list(None).await.len(), 1);
    assert!(pool.worker_for("ws-1", 1).await.is_none());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_concurrent_placements_of_one_seat_run_once() -> anyhow::Result<()> {
    let a = TestAgent::start("worker-a", TOKEN, 4).await?;
    let b = TestAgent::start("worker-b", TOKEN, 4).await?;
    let pool = WorkerPool::new(
        &[
            worker("worker-a", a.url(), TOKEN, 4),
            worker("worker-b", b.url(), TOKEN, 4),
        ],
        Duration::from_secs(2),
        3,
    )?;

    let (first, second) = tokio::join!(
        pool.place("ws-1", 1, Resources::default()),
        pool.place("ws-1", 1, Resources::default()),
    );

    let placed = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(placed, 1);
    assert!([first, second]
        .into_iter()
        .any(|r| matches!(r, Err(FleetError::SandboxExists(_)))));
    assert_eq!(a.registry.count().await + b.registry.count().await, 1);

    // The reservation is gone once the seat is released.
    pool.release("ws-1", 1).await?;
    assert_eq!(a.registry.count().await + b.registry.count().await, 0);
    pool.place("ws-1", 1, Resources::default()).await?;
    assert_eq!(a.registry.count().await + b.registry.count().await, 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_failed_placement_frees_the_seat() -> anyhow::Result<()> {
    let full = TestAgent::start("worker-full", TOKEN, 1).await?;
    full.registry
        .create("ws-other", 1, Resources::default())
        .await?;
    let pool = WorkerPool::new(
        &[worker("worker-full", full.url(), TOKEN, 1)],
        Duration::from_secs(2),
        3,
    )?;

    assert!(matches!(
        pool.place("ws-1", 1, Resources::default()).await,
        Err(FleetError::NoWorkerAvailable(_))
    ));

    full.registry.destroy("ws-other", 1).await?;
    assert_eq!(pool.check_health().await, Some(1));
    let placement = pool.place("ws-1", 1, Resources::default()).await?;
    assert_eq!(placement.worker, "worker-full");
    Ok(())
}
