use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    client::AgentClient,
    config::{ProvisionerConfig, GENERATED_TOKEN_LEN},
    registry::{HealthReport, Resources, Sandbox, SandboxKey},
    runtime::SandboxRuntime,
    FleetError, FleetResult,
};

use super::{host_name_for, CloudProvider, HostSpec};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a workshop is in its provisioning.
///
/// Phases only move forward. `Failed` can follow any phase before `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionPhase {
    /// Accepted, nothing created yet.
    Pending,

    /// Waiting for the cloud to create the host.
    CreatingHost,

    /// Polling the host agent until it reports healthy.
    WaitingForAgent,

    /// Creating one sandbox per seat.
    CreatingSandboxes,

    /// Every seat has a running sandbox.
    Ready,

    /// Provisioning stopped. The host, if created, is kept.
    Failed {
        /// Why provisioning stopped.
        reason: String,
    },
}

/// A snapshot of a workshop's provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkshopStatus {
    /// The workshop.
    pub workshop_id: String,

    /// Current phase.
    pub phase: ProvisionPhase,

    /// Number of seats requested.
    pub seats: u32,

    /// Name of the workshop's cloud host. `None` when the workshop runs on an existing runtime.
    pub host_name: Option<String>,

    /// Base URL of the host agent, once the host has an address.
    pub agent_url: Option<String>,

    /// Sandboxes created so far, by seat.
    pub sandboxes: Vec<Sandbox>,

    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

/// A request to provision a workshop.
#[derive(Debug, Clone, TypedBuilder)]
pub struct WorkshopRequest {
    /// The workshop.
    #[builder(setter(into))]
    pub workshop_id: String,

    /// Number of seats; seats are numbered from 1.
    pub seats: u32,

    /// Resources of every sandbox.
    #[builder(default)]
    pub resources: Resources,
}

/// Provisions workshops, one sandbox per seat.
///
/// A provisioner either creates one cloud host per workshop ([`new`](Self::new)) or places every
/// seat on a runtime that already exists, such as a single host's agent or a
/// [`WorkerPool`](crate::pool::WorkerPool) ([`with_runtime`](Self::with_runtime)).
pub struct Provisioner {
    target: Target,
    config: ProvisionerConfig,
    workshops: Mutex<HashMap<String, WorkshopRecord>>,
}

enum Target {
    /// A fresh cloud host per workshop.
    Cloud(Arc<dyn CloudProvider>),

    /// Hosts that are already running.
    Runtime(Arc<dyn SandboxRuntime>),
}

struct WorkshopRecord {
    status: WorkshopStatus,
    auth_token: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Provisioner {
    /// Creates a provisioner that creates a host on `cloud` for every workshop.
    pub fn new(cloud: Arc<dyn CloudProvider>, config: ProvisionerConfig) -> FleetResult<Self> {
        Self::with_target(Target::Cloud(cloud), config)
    }

    /// Creates a provisioner that places every seat on `runtime`. The host phases are skipped:
    /// a workshop goes from `Pending` straight to `CreatingSandboxes`.
    pub fn with_runtime(
        runtime: Arc<dyn SandboxRuntime>,
        config: ProvisionerConfig,
    ) -> FleetResult<Self> {
        Self::with_target(Target::Runtime(runtime), config)
    }

    fn with_target(target: Target, config: ProvisionerConfig) -> FleetResult<Self> {
        config.validate()?;
        Ok(Self {
            target,
            config,
            workshops: Mutex::new(HashMap::new()),
        })
    }

    /// The provisioner configuration.
    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    /// Provisions a workshop and returns its final status.
    ///
    /// On failure the workshop is left `Failed` and its host, if any, is kept for inspection;
    /// call [`teardown`](Self::teardown) to remove it. Cancelling through `cancel` also fails the
    /// workshop but does not undo sandboxes that were already created.
    pub async fn provision(
        &self,
        request: WorkshopRequest,
        cancel: CancellationToken,
    ) -> FleetResult<WorkshopStatus> {
        let workshop_id = request.workshop_id.clone();
        SandboxKey::new(workshop_id.as_str(), 1).validate()?;
        if request.seats == 0 {
            return Err(FleetError::InvalidArgument(
                "a workshop needs at least one seat".to_string(),
            ));
        }
        request.resources.validate()?;

        let auth_token = self
            .config
            .get_auth_token()
            .clone()
            .unwrap_or_else(generate_token);
        let host_name = match &self.target {
            Target::Cloud(_) => Some(host_name_for(&workshop_id)),
            Target::Runtime(_) => None,
        };

        {
            let mut workshops = self.workshops.lock().await;
            if workshops.contains_key(&workshop_id) {
                return Err(FleetError::InvalidArgument(format!(
                    "workshop {workshop_id} is already provisioned, tear it down first"
                )));
            }

            workshops.insert(
                workshop_id.clone(),
                WorkshopRecord {
                    status: WorkshopStatus {
                        workshop_id: workshop_id.clone(),
                        phase: ProvisionPhase::Pending,
                        seats: request.seats,
                        host_name: host_name.clone(),
                        agent_url: None,
                        sandboxes: Vec::new(),
                        updated_at: Utc::now(),
                    },
                    auth_token: match &self.target {
                        Target::Cloud(_) => Some(auth_token.clone()),
                        Target::Runtime(_) => None,
                    },
                },
            );
        }

        let result = match &self.target {
            Target::Cloud(cloud) => {
                let host_name = host_name_for(&workshop_id);
                self.run_phases(cloud.as_ref(), &request, &host_name, &auth_token, &cancel)
                    .await
            }
            Target::Runtime(runtime) => {
                self.set_phase(&workshop_id, ProvisionPhase::CreatingSandboxes)
                    .await;
                cancellable(&cancel, self.create_seats(runtime.as_ref(), &request)).await
            }
        };

        match result {
            Ok(()) => {
                let status = self
                    .update(&workshop_id, |status| status.phase = ProvisionPhase::Ready)
                    .await;
                tracing::info!(%workshop_id, host = ?host_name, seats = request.seats, "workshop ready");
                // A concurrent teardown removes the record.
                status.ok_or(FleetError::Cancelled)
            }
            Err(e) => {
                self.update(&workshop_id, |status| {
                    status.phase = ProvisionPhase::Failed {
                        reason: e.to_string(),
                    }
                })
                .await;
                tracing::error!(%workshop_id, host = ?host_name, error = %e, "provisioning failed, resources kept");
                Err(e)
            }
        }
    }

    /// Tears a workshop down.
    ///
    /// On a cloud host, the workshop's sandboxes are destroyed if the agent answers and the host
    /// is then deleted, even when the agent is unreachable or the workshop is unknown to this
    /// provisioner. On an existing runtime, the workshop's sandboxes are destroyed and the
    /// workshop is forgotten only if that worked.
    pub async fn teardown(&self, workshop_id: &str) -> FleetResult<()> {
        SandboxKey::new(workshop_id, 1).validate()?;
        match &self.target {
            Target::Cloud(cloud) => self.teardown_host(cloud.as_ref(), workshop_id).await?,
            Target::Runtime(runtime) => {
                let destroyed = runtime.destroy_workshop(workshop_id).await?;
                tracing::info!(%workshop_id, destroyed, "workshop sandboxes destroyed");
            }
        }

        self.workshops.lock().await.remove(workshop_id);
        tracing::info!(%workshop_id, "workshop torn down");
        Ok(())
    }

    /// The status of a workshop known to this provisioner.
    pub async fn status(&self, workshop_id: &str) -> Option<WorkshopStatus> {
        self.workshops
            .lock()
            .await
            .get(workshop_id)
            .map(|record| record.status.clone())
    }

    /// The status of every known workshop.
    pub async fn workshops(&self) -> Vec<WorkshopStatus> {
        let mut statuses: Vec<WorkshopStatus> = self
            .workshops
            .lock()
            .await
            .values()
            .map(|record| record.status.clone())
            .collect();
        statuses.sort_by(|a, b| a.workshop_id.cmp(&b.workshop_id));
        statuses
    }

    /// The agent token of a workshop known to this provisioner.
    pub async fn auth_token(&self, workshop_id: &str) -> Option<String> {
        self.workshops
            .lock()
            .await
            .get(workshop_id)
            .and_then(|record| record.auth_token.clone())
    }

    async fn teardown_host(
        &self,
        cloud: &dyn CloudProvider,
        workshop_id: &str,
    ) -> FleetResult<()> {
        let host_name = host_name_for(workshop_id);
        let known = self.workshops.lock().await.get(workshop_id).map(|record| {
            (record.status.agent_url.clone(), record.auth_token.clone())
        });

        let (agent_url, auth_token) = match known {
            Some((agent_url, token)) => (
                agent_url,
                token.or_else(|| self.config.get_auth_token().clone()),
            ),
            None => (None, self.config.get_auth_token().clone()),
        };

        let agent_url = match agent_url {
            Some(url) => Some(url),
            None => self.lookup_agent_url(cloud, &host_name).await,
        };

        match (agent_url, auth_token) {
            (Some(agent_url), Some(auth_token)) => {
                if let Err(e) = self
                    .destroy_sandboxes(&agent_url, &auth_token, workshop_id)
                    .await
                {
                    tracing::warn!(%workshop_id, agent = %agent_url, error = %e, "could not destroy sandboxes, deleting host anyway");
                }
            }
            _ => {
                tracing::info!(%workshop_id, "agent unknown, skipping sandbox cleanup");
            }
        }

        cloud.delete_host(&host_name).await?;
        tracing::info!(%workshop_id, host = %host_name, "host deleted");
        Ok(())
    }

    async fn run_phases(
        &self,
        cloud: &dyn CloudProvider,
        request: &WorkshopRequest,
        host_name: &str,
        auth_token: &str,
        cancel: &CancellationToken,
    ) -> FleetResult<()> {
        let workshop_id = request.workshop_id.as_str();

        self.set_phase(workshop_id, ProvisionPhase::CreatingHost)
            .await;
        let spec = HostSpec {
            name: host_name.to_string(),
            workshop_id: workshop_id.to_string(),
            seats: request.seats,
            auth_token: auth_token.to_string(),
        };
        let host = cancellable(cancel, cloud.create_host(&spec)).await?;

        let ip = host
            .agent_ip(*self.config.get_use_internal_ip())
            .ok_or_else(|| FleetError::Cloud(format!("host {host_name} has no address")))?;
        let agent_url = format!("http://{ip}:{}", self.config.get_agent_port());
        self.update(workshop_id, |status| {
            status.phase = ProvisionPhase::WaitingForAgent;
            status.agent_url = Some(agent_url.clone());
        })
        .await;
        tracing::info!(%workshop_id, host = %host_name, agent = %agent_url, "host created, waiting for agent");

        let client = AgentClient::new(
            agent_url.as_str(),
            auth_token,
            *self.config.get_request_timeout(),
        )?;
        let health = self.wait_for_agent(&client, cancel).await?;
        tracing::info!(%workshop_id, worker_id = %health.worker_id, capacity = health.capacity, "agent healthy");

        if health.capacity < request.seats as usize {
            tracing::warn!(%workshop_id, capacity = health.capacity, seats = request.seats, "host capacity is below the seat count");
        }

        self.set_phase(workshop_id, ProvisionPhase::CreatingSandboxes)
            .await;
        cancellable(cancel, self.create_seats(&client, request)).await
    }

    /// Polls `/health` on the configured interval until it answers or the ready timeout passes.
    async fn wait_for_agent(
        &self,
        client: &AgentClient,
        cancel: &CancellationToken,
    ) -> FleetResult<HealthReport> {
        let interval = *self.config.get_poll_interval();
        let timeout = *self.config.get_ready_timeout();

        let poll = async {
            loop {
                match client.health().await {
                    Ok(health) => return health,
                    Err(e) => {
                        tracing::debug!(agent = %client.base_url(), error = %e, "agent not healthy yet")
                    }
                }
                tokio::time::sleep(interval).await;
            }
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, poll) => {
                result.map_err(|_| FleetError::HealthTimeout {
                    address: client.base_url().to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
            _ = cancel.cancelled() => Err(FleetError::Cancelled),
        }
    }

    /// Creates every seat with bounded concurrency. Seats that succeed are recorded even when
    /// others fail.
    async fn create_seats(
        &self,
        runtime: &dyn SandboxRuntime,
        request: &WorkshopRequest,
    ) -> FleetResult<()> {
        let workshop_id = request.workshop_id.as_str();
        let resources = request.resources;

        let mut results = stream::iter(1..=request.seats)
            .map(|seat_id| async move {
                let result = runtime.create(workshop_id, seat_id, resources).await;
                (seat_id, result)
            })
            .buffer_unordered(*self.config.get_seat_concurrency());

        let mut failures = Vec::new();
        while let Some((seat_id, result)) = results.next().await {
            match result {
                Ok(sandbox) => {
                    tracing::info!(%workshop_id, seat_id, ip = %sandbox.ip, "seat ready");
                    self.update(workshop_id, |status| {
                        status.sandboxes.push(sandbox);
                        status.sandboxes.sort_by_key(|sandbox| sandbox.seat_id);
                    })
                    .await;
                }
                Err(e) => {
                    tracing::error!(%workshop_id, seat_id, error = %e, "seat failed");
                    failures.push((seat_id, e));
                }
            }
        }

        failures.sort_by_key(|(seat_id, _)| *seat_id);
        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(()),
            Some((seat_id, first)) => {
                tracing::error!(%workshop_id, failed, seats = request.seats, "workshop has failed seats");
                Err(first.for_sandbox(&SandboxKey::new(workshop_id, seat_id)))
            }
        }
    }

    async fn destroy_sandboxes(
        &self,
        agent_url: &str,
        auth_token: &str,
        workshop_id: &str,
    ) -> FleetResult<usize> {
        let client = AgentClient::new(agent_url, auth_token, *self.config.get_request_timeout())?;

        // A single attempt first so a dead agent does not go through the retry backoff.
        client.health().await?;

        let sandboxes = client.list(Some(workshop_id)).await?;
        let mut destroyed = 0;
        for sandbox in sandboxes {
            match client.destroy(&sandbox.workshop_id, sandbox.seat_id).await {
                Ok(()) => destroyed += 1,
                Err(e) => {
                    tracing::warn!(key = %sandbox.key(), error = %e, "failed to destroy sandbox")
                }
            }
        }
        Ok(destroyed)
    }

    async fn lookup_agent_url(
        &self,
        cloud: &dyn CloudProvider,
        host_name: &str,
    ) -> Option<String> {
        match cloud.get_host(host_name).await {
            Ok(host) => host
                .and_then(|host| host.agent_ip(*self.config.get_use_internal_ip()))
                .map(|ip| format!("http://{ip}:{}", self.config.get_agent_port())),
            Err(e) => {
                tracing::warn!(host = %host_name, error = %e, "failed to look host up");
                None
            }
        }
    }

    async fn set_phase(&self, workshop_id: &str, phase: ProvisionPhase) {
        tracing::debug!(%workshop_id, %phase, "workshop phase changed");
        self.update(workshop_id, |status| status.phase = phase).await;
    }

    async fn update(
        &self,
        workshop_id: &str,
        change: impl FnOnce(&mut WorkshopStatus),
    ) -> Option<WorkshopStatus> {
        let mut workshops = self.workshops.lock().await;
        let record = workshops.get_mut(workshop_id)?;
        change(&mut record.status);
        record.status.updated_at = Utc::now();
        Some(record.status.clone())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for ProvisionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionPhase::Pending => write!(f, "pending"),
            ProvisionPhase::CreatingHost => write!(f, "creating_host"),
            ProvisionPhase::WaitingForAgent => write!(f, "waiting_for_agent"),
            ProvisionPhase::CreatingSandboxes => write!(f, "creating_sandboxes"),
            ProvisionPhase::Ready => write!(f, "ready"),
            ProvisionPhase::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

impl fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.target {
            Target::Cloud(_) => "cloud".to_string(),
            Target::Runtime(runtime) => format!("{} runtime", runtime.kind()),
        };
        f.debug_struct("Provisioner")
            .field("target", &target)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// A random alphanumeric agent token.
pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_TOKEN_LEN)
        .map(char::from)
        .collect()
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = FleetResult<T>>,
) -> FleetResult<T> {
    tokio::select! {
        result = future => result,
        _ = cancel.cancelled() => Err(FleetError::Cancelled),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
