use std::{net::Ipv4Addr, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;

use crate::{
    registry::{HealthReport, HostInfo, Resources, Sandbox},
    runtime::{RuntimeKind, SandboxRuntime},
    server::{CreateVmRequest, ErrorResponse, ListResponse, StatusResponse},
    FleetError, FleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for one host agent.
///
/// Reads and deletes are idempotent and go through a retrying client with exponential backoff.
/// Creates are sent once; a retried create could report a conflict for a sandbox the first
/// attempt created.
#[derive(Debug, Clone)]
pub struct AgentClient {
    /// Agent base URL without a trailing slash.
    base_url: String,

    /// Bearer token of the agent.
    token: String,

    /// Client for idempotent calls.
    retrying: ClientWithMiddleware,

    /// Client for single-shot calls.
    plain: Client,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AgentClient {
    /// Creates a client for the agent at `base_url`. Every request is bounded by `timeout`.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> FleetResult<Self> {
        let plain = Client::builder().timeout(timeout).build()?;

        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let retrying = ClientBuilder::new(plain.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            retrying,
            plain,
        })
    }

    /// The agent base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// One unauthenticated `GET /health`, without retries. Callers poll.
    pub async fn health(&self) -> FleetResult<HealthReport> {
        let response = self.plain.get(self.url("/health")).send().await?;
        decode(response).await
    }

    /// `GET /info`.
    pub async fn info(&self) -> FleetResult<HostInfo> {
        let response = self
            .retrying
            .get(self.url("/info"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(response).await
    }

    /// `POST /vms`.
    pub async fn create(
        &self,
        workshop_id: &str,
        seat_id: u32,
        resources: Resources,
    ) -> FleetResult<Sandbox> {
        let request = CreateVmRequest {
            workshop_id: workshop_id.to_string(),
            seat_id,
            vcpus: resources.vcpus,
            memory_mb: resources.memory_mib,
        };

        let response = self
            .plain
            .post(self.url("/vms"))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;
        decode(response).await
    }

    /// `DELETE /vms/{workshop_id}/{seat_id}`.
    pub async fn destroy(&self, workshop_id: &str, seat_id: u32) -> FleetResult<()> {
        let response = self
            .retrying
            .delete(self.url(&format!("/vms/{workshop_id}/{seat_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status: StatusResponse = decode(response).await?;
        tracing::debug!(agent = %self.base_url, message = %status.message, "destroyed sandbox");
        Ok(())
    }

    /// `GET /vms`, optionally filtered by workshop.
    pub async fn list(&self, workshop_id: Option<&str>) -> FleetResult<Vec<Sandbox>> {
        let mut request = self.retrying.get(self.url("/vms")).bearer_auth(&self.token);
        if let Some(workshop_id) = workshop_id {
            request = request.query(&[("workshop_id", workshop_id)]);
        }

        let list: ListResponse<Sandbox> = decode(request.send().await?).await?;
        Ok(list.vms)
    }

    /// `GET /vms/{workshop_id}/{seat_id}`.
    pub async fn get(&self, workshop_id: &str, seat_id: u32) -> FleetResult<Sandbox> {
        let response = self
            .retrying
            .get(self.url(&format!("/vms/{workshop_id}/{seat_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl SandboxRuntime for AgentClient {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::MicroVm
    }

    async fn create(
        &self,
        workshop_id: &str,
        seat_id: u32,
        resources: Resources,
    ) -> FleetResult<Sandbox> {
        AgentClient::create(self, workshop_id, seat_id, resources).await
    }

    async fn destroy(&self, workshop_id: &str, seat_id: u32) -> FleetResult<()> {
        AgentClient::destroy(self, workshop_id, seat_id).await
    }

    async fn list(&self, workshop_id: Option<&str>) -> FleetResult<Vec<Sandbox>> {
        AgentClient::list(self, workshop_id).await
    }

    async fn get_ip(&self, workshop_id: &str, seat_id: u32) -> FleetResult<Ipv4Addr> {
        let sandbox = self.get(workshop_id, seat_id).await?;
        if !sandbox.is_running() {
            return Err(FleetError::SandboxNotReady {
                key: sandbox.key(),
                status: sandbox.status.to_string(),
            });
        }
        Ok(sandbox.ip)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Decodes a success body, or turns an error body into a [`FleetError`].
async fn decode<T: DeserializeOwned>(response: Response) -> FleetResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .map(|error| error.message)
        .unwrap_or(body);

    if status == StatusCode::UNAUTHORIZED {
        return Err(FleetError::AuthFailure(message));
    }

    Err(FleetError::Agent {
        status: status.as_u16(),
        message,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
