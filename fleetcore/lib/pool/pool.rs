use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    client::AgentClient,
    config::{WorkerDescriptor, WorkersFile},
    registry::{Resources, Sandbox, SandboxKey},
    runtime::{RuntimeKind, SandboxRuntime},
    ErrorKind, FleetError, FleetResult,
};

use super::{rank_candidates, Placement, WorkerStatus};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A fixed set of workers that sandboxes are spread across.
///
/// The pool remembers which worker runs each `(workshop, seat)` so later calls reach the right
/// host. Health state and placements live behind one lock that is never held across a network
/// call.
pub struct WorkerPool {
    workers: Vec<PoolWorker>,
    failure_threshold: u32,
    state: Mutex<PoolState>,
    checking: Mutex<()>,
}

struct PoolWorker {
    name: String,
    configured_capacity: usize,
    client: AgentClient,
}

struct PoolState {
    statuses: Vec<WorkerStatus>,
    placements: BTreeMap<SandboxKey, usize>,
    /// Seats with a placement in flight.
    pending: BTreeSet<SandboxKey>,
    rotation: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl WorkerPool {
    /// Creates a pool over the given workers. Every request to a worker is bounded by
    /// `request_timeout`; a worker leaves rotation after `failure_threshold` missed checks.
    pub fn new(
        descriptors: &[WorkerDescriptor],
        request_timeout: Duration,
        failure_threshold: u32,
    ) -> FleetResult<Self> {
        if descriptors.is_empty() {
            return Err(FleetError::InvalidConfig(
                "the worker pool needs at least one worker".to_string(),
            ));
        }

        let mut workers = Vec::with_capacity(descriptors.len());
        let mut statuses = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let client = AgentClient::new(
                descriptor.address.as_str(),
                descriptor.resolve_token()?,
                request_timeout,
            )?;
            statuses.push(WorkerStatus::new(
                descriptor.display_name(),
                client.base_url(),
                descriptor.capacity,
            ));
            workers.push(PoolWorker {
                name: descriptor.display_name().to_string(),
                configured_capacity: descriptor.capacity,
                client,
            });
        }

        Ok(Self {
            workers,
            failure_threshold: failure_threshold.max(1),
            state: Mutex::new(PoolState {
                statuses,
                placements: BTreeMap::new(),
                pending: BTreeSet::new(),
                rotation: 0,
            }),
            checking: Mutex::new(()),
        })
    }

    /// Creates a pool from a workers file.
    pub async fn from_file(
        path: impl AsRef<Path>,
        request_timeout: Duration,
        failure_threshold: u32,
    ) -> FleetResult<Self> {
        let file = WorkersFile::load(path).await?;
        Self::new(&file.workers, request_timeout, failure_threshold)
    }

    /// Checks every worker once. Returns the number of healthy workers, or `None` if a check
    /// cycle was already running.
    pub async fn check_health(&self) -> Option<usize> {
        let _cycle = self.checking.try_lock().ok()?;

        let suspect: Vec<bool> = {
            let state = self.state.lock().await;
            state.statuses.iter().map(|s| s.suspect).collect()
        };

        let reports = join_all(self.workers.iter().zip(suspect).map(
            |(worker, suspect)| async move {
                let health = worker.client.health().await;
                // Health is unauthenticated; a suspect worker must also pass an authenticated call.
                let authenticated = match &health {
                    Ok(_) if suspect => Some(worker.client.info().await),
                    _ => None,
                };
                (health, authenticated)
            },
        ))
        .await;

        let mut state = self.state.lock().await;
        for ((worker, status), (health, authenticated)) in self
            .workers
            .iter()
            .zip(state.statuses.iter_mut())
            .zip(reports)
        {
            match health {
                Ok(health) => {
                    let recovered = !status.healthy;
                    status.record_health(&health, worker.configured_capacity);
                    if recovered {
                        tracing::info!(worker = %worker.name, "worker back in rotation");
                    }
                }
                Err(e) => {
                    if status.record_miss(&e, self.failure_threshold) {
                        tracing::warn!(worker = %worker.name, error = %e, "worker taken out of rotation");
                    } else {
                        tracing::debug!(worker = %worker.name, error = %e, failures = status.consecutive_failures, "worker missed a health check");
                    }
                }
            }

            match authenticated {
                Some(Ok(_)) => {
                    tracing::info!(worker = %worker.name, "worker accepts our token again");
                    status.suspect = false;
                }
                Some(Err(e)) => status.last_error = Some(e.to_string()),
                None => {}
            }
        }

        Some(state.statuses.iter().filter(|s| s.healthy).count())
    }

    /// Runs [`check_health`](Self::check_health) every `interval` until `cancel` fires.
    pub fn spawn_health_loop(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.check_health().await.is_none() {
                            tracing::debug!("previous health check still running, skipping");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::debug!("worker health loop stopped");
        })
    }

    /// Places the sandbox of a seat on the best worker that takes it.
    ///
    /// Workers are tried least loaded first. A worker that is full, unreachable or rejects our
    /// token is skipped in favour of the next one; any other error is returned as is. A seat is
    /// reserved while its placement runs, so a concurrent placement of the same seat fails with
    /// [`FleetError::SandboxExists`].
    pub async fn place(
        &self,
        workshop_id: &str,
        seat_id: u32,
        resources: Resources,
    ) -> FleetResult<Placement> {
        let key = SandboxKey::new(workshop_id, seat_id);
        key.validate()?;

        let candidates = {
            let mut state = self.state.lock().await;
            if state.placements.contains_key(&key) || !state.pending.insert(key.clone()) {
                return Err(FleetError::SandboxExists(key));
            }

            let candidates = rank_candidates(&state.statuses, state.rotation);
            if let Some(&first) = candidates.first() {
                state.rotation = (first + 1) % self.workers.len();
            }
            candidates
        };

        let result = self.try_candidates(&key, candidates, resources).await;

        let mut state = self.state.lock().await;
        state.pending.remove(&key);
        let (index, sandbox) = result?;
        state.placements.insert(key.clone(), index);
        state.statuses[index].vm_count += 1;
        drop(state);

        let worker = &self.workers[index];
        tracing::info!(%key, worker = %worker.name, ip = %sandbox.ip, "sandbox placed");
        Ok(Placement {
            worker: worker.name.clone(),
            address: worker.client.base_url().to_string(),
            sandbox,
        })
    }

    /// Destroys a placed sandbox. Unknown seats are not an error.
    pub async fn release(&self, workshop_id: &str, seat_id: u32) -> FleetResult<()> {
        let key = SandboxKey::new(workshop_id, seat_id);
        let Some(index) = self.locate(&key).await else {
            tracing::debug!(%key, "release of unplaced sandbox");
            return Ok(());
        };

        self.workers[index]
            .client
            .destroy(workshop_id, seat_id)
            .await?;

        let mut state = self.state.lock().await;
        state.placements.remove(&key);
        let status = &mut state.statuses[index];
        status.vm_count = status.vm_count.saturating_sub(1);
        Ok(())
    }

    /// Destroys every sandbox of a workshop on every healthy worker. Returns how many were
    /// destroyed.
    pub async fn destroy_workshop(&self, workshop_id: &str) -> FleetResult<usize> {
        if workshop_id.is_empty() {
            return Err(FleetError::InvalidArgument(
                "workshop_id must not be empty".to_string(),
            ));
        }

        let healthy = self.healthy_indices().await;

        let mut destroyed = 0;
        let mut first_error = None;
        for index in healthy {
            let worker = &self.workers[index];
            let sandboxes = match worker.client.list(Some(workshop_id)).await {
                Ok(sandboxes) => sandboxes,
                Err(e) => {
                    tracing::warn!(worker = %worker.name, error = %e, "failed to list workshop sandboxes");
                    first_error.get_or_insert(e);
                    continue;
                }
            };

            for sandbox in sandboxes {
                match worker.client.destroy(workshop_id, sandbox.seat_id).await {
                    Ok(()) => {
                        destroyed += 1;
                        let mut state = self.state.lock().await;
                        state.placements.remove(&sandbox.key());
                        let status = &mut state.statuses[index];
                        status.vm_count = status.vm_count.saturating_sub(1);
                    }
                    Err(e) => {
                        tracing::warn!(key = %sandbox.key(), worker = %worker.name, error = %e, "failed to destroy sandbox");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) if destroyed == 0 => Err(e),
            _ => {
                tracing::info!(%workshop_id, destroyed, "workshop sandboxes destroyed");
                Ok(destroyed)
            }
        }
    }

    /// Sandboxes across all healthy workers, optionally of one workshop.
    pub async fn list(&self, workshop_id: Option<&str>) -> Vec<Sandbox> {
        let healthy = self.healthy_indices().await;
        let lists = join_all(
            healthy
                .iter()
                .map(|&index| self.workers[index].client.list(workshop_id)),
        )
        .await;

        let mut sandboxes = Vec::new();
        for (index, list) in healthy.into_iter().zip(lists) {
            match list {
                Ok(list) => sandboxes.extend(list),
                Err(e) => {
                    tracing::warn!(worker = %self.workers[index].name, error = %e, "failed to list sandboxes")
                }
            }
        }
        sandboxes.sort_by(|a, b| a.key().cmp(&b.key()));
        sandboxes
    }

    /// The worker running a seat's sandbox.
    pub async fn worker_for(&self, workshop_id: &str, seat_id: u32) -> Option<String> {
        let index = self.locate(&SandboxKey::new(workshop_id, seat_id)).await?;
        Some(self.workers[index].name.clone())
    }

    /// A snapshot of every worker's health.
    pub async fn statuses(&self) -> Vec<WorkerStatus> {
        self.state.lock().await.statuses.clone()
    }

    /// Finds the worker of a sandbox: the recorded placement, or else the first healthy worker
    /// that knows it. A sandbox found that way is recorded for next time.
    async fn locate(&self, key: &SandboxKey) -> Option<usize> {
        if let Some(index) = self.state.lock().await.placements.get(key).copied() {
            return Some(index);
        }

        for index in self.healthy_indices().await {
            match self.workers[index]
                .client
                .get(&key.workshop_id, key.seat_id)
                .await
            {
                Ok(_) => {
                    self.state.lock().await.placements.insert(key.clone(), index);
                    return Some(index);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::debug!(%key, worker = %self.workers[index].name, error = %e, "could not ask worker about sandbox")
                }
            }
        }
        None
    }

    async fn try_candidates(
        &self,
        key: &SandboxKey,
        candidates: Vec<usize>,
        resources: Resources,
    ) -> FleetResult<(usize, Sandbox)> {
        let mut last_error = None;
        for index in candidates {
            let worker = &self.workers[index];
            match worker
                .client
                .create(&key.workshop_id, key.seat_id, resources)
                .await
            {
                Ok(sandbox) => return Ok((index, sandbox)),
                Err(e) if e.is_retryable_elsewhere() => {
                    tracing::warn!(%key, worker = %worker.name, error = %e, "worker declined sandbox, trying next");
                    self.record_declined(index, &e).await;
                    last_error = Some(format!("{}: {e}", worker.name));
                }
                Err(e) => return Err(e),
            }
        }

        Err(FleetError::NoWorkerAvailable(last_error.unwrap_or_else(|| {
            "no healthy worker has free capacity".to_string()
        })))
    }

    async fn healthy_indices(&self) -> Vec<usize> {
        let state = self.state.lock().await;
        state
            .statuses
            .iter()
            .enumerate()
            .filter(|(_, status)| status.healthy && !status.suspect)
            .map(|(index, _)| index)
            .collect()
    }

    async fn record_declined(&self, index: usize, error: &FleetError) {
        let mut state = self.state.lock().await;
        let status = &mut state.statuses[index];
        match error.kind() {
            ErrorKind::AuthFailure => {
                tracing::error!(worker = %status.name, "worker rejected our token, marking suspect");
                status.mark_suspect(error);
            }
            ErrorKind::CapacityExceeded => {
                status.vm_count = status.capacity;
                status.last_error = Some(error.to_string());
            }
            _ => {
                status.record_miss(error, self.failure_threshold);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SandboxRuntime for WorkerPool {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::MicroVm
    }

    async fn create(
        &self,
        workshop_id: &str,
        seat_id: u32,
        resources: Resources,
    ) -> FleetResult<Sandbox> {
        Ok(self.place(workshop_id, seat_id, resources).await?.sandbox)
    }

    async fn destroy(&self, workshop_id: &str, seat_id: u32) -> FleetResult<()> {
        self.release(workshop_id, seat_id).await
    }

    async fn list(&self, workshop_id: Option<&str>) -> FleetResult<Vec<Sandbox>> {
        Ok(WorkerPool::list(self, workshop_id).await)
    }

    async fn get_ip(&self, workshop_id: &str, seat_id: u32) -> FleetResult<Ipv4Addr> {
        let key = SandboxKey::new(workshop_id, seat_id);
        match self.locate(&key).await {
            Some(index) => self.workers[index].client.get_ip(workshop_id, seat_id).await,
            None => Err(FleetError::SandboxNotFound(key)),
        }
    }

    async fn destroy_workshop(&self, workshop_id: &str) -> FleetResult<usize> {
        WorkerPool::destroy_workshop(self, workshop_id).await
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field(
                "workers",
                &self.workers.iter().map(|w| &w.name).collect::<Vec<_>>(),
            )
            .field("failure_threshold", &self.failure_threshold)
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(address: &str) -> WorkerDescriptor {
        WorkerDescriptor {
            name: None,
            address: address.to_string(),
            token: "secret".to_string(),
            capacity: 4,
        }
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(matches!(
            WorkerPool::new(&[], Duration::from_secs(1), 3),
            Err(FleetError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_worker_leaves_rotation_after_threshold() -> anyhow::Result<()> {
        let pool = WorkerPool::new(
            &[descriptor("http://127.0.0.1:1")],
            Duration::from_secs(2),
            2,
        )?;

        assert_eq!(pool.check_health().await, Some(1));
        assert_eq!(pool.check_health().await, Some(0));

        let status = &pool.statuses().await[0];
        assert!(!status.healthy);
        assert_eq!(status.consecutive_failures, 2);
        assert!(status.last_error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_place_without_healthy_workers_fails() -> anyhow::Result<()> {
        let pool = WorkerPool::new(
            &[descriptor("http://127.0.0.1:1")],
            Duration::from_secs(2),
            1,
        )?;
        pool.check_health().await;

        let err = pool
            .place("ws-1", 1, Resources::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NoWorkerAvailable(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_release_of_unplaced_seat_is_ok() -> anyhow::Result<()> {
        let pool = WorkerPool::new(
            &[descriptor("http://127.0.0.1:1")],
            Duration::from_secs(2),
            1,
        )?;
        pool.check_health().await;

        pool.release("ws-1", 7).await?;
        assert!(pool.worker_for("ws-1", 7).await.is_none());
        Ok(())
    }
}
