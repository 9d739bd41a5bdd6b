use std::time::Duration;

use getset::Getters;
use typed_builder::TypedBuilder;

use crate::{FleetError, FleetResult};

use super::{
    DEFAULT_AGENT_PORT, DEFAULT_AGENT_READY_TIMEOUT, DEFAULT_CAPACITY,
    DEFAULT_HEALTH_POLL_INTERVAL, DEFAULT_MACHINE_TYPE, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SEAT_CONCURRENCY,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where and how the control plane creates workshop hosts.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct CloudConfig {
    /// Cloud project the hosts live in.
    #[builder(setter(into))]
    project: String,

    /// Zone the hosts are created in.
    #[builder(setter(into))]
    zone: String,

    /// Snapshot the host boot disk is created from.
    #[builder(setter(into))]
    snapshot: String,

    /// Machine type of the hosts.
    #[builder(default = DEFAULT_MACHINE_TYPE.to_string(), setter(into))]
    machine_type: String,

    /// Whether hosts use spot scheduling instead of on-demand.
    #[builder(default)]
    spot: bool,

    /// VPC network to attach hosts to, provider default when unset.
    #[builder(default, setter(strip_option, into))]
    network: Option<String>,

    /// Network tags applied to hosts (firewall rules for the agent port key off these).
    #[builder(default = vec!["fleet-agent".to_string()])]
    tags: Vec<String>,
}

/// Behaviour of the control-plane provisioner.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ProvisionerConfig {
    /// Port the agent listens on inside each host.
    #[builder(default = DEFAULT_AGENT_PORT)]
    agent_port: u16,

    /// Reach agents on the host's internal address instead of the external one.
    #[builder(default)]
    use_internal_ip: bool,

    /// Shared agent token; a random one is generated per workshop when unset.
    #[builder(default, setter(strip_option, into))]
    auth_token: Option<String>,

    /// Capacity advertised to (and enforced by) each workshop host.
    #[builder(default = DEFAULT_CAPACITY)]
    host_capacity: usize,

    /// Interval between health polls of a new host.
    #[builder(default = DEFAULT_HEALTH_POLL_INTERVAL)]
    poll_interval: Duration,

    /// Overall time a new host gets to become healthy.
    #[builder(default = DEFAULT_AGENT_READY_TIMEOUT)]
    ready_timeout: Duration,

    /// Per-request timeout for agent calls.
    #[builder(default = DEFAULT_REQUEST_TIMEOUT)]
    request_timeout: Duration,

    /// How many seats are created concurrently.
    #[builder(default = DEFAULT_SEAT_CONCURRENCY)]
    seat_concurrency: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProvisionerConfig {
    /// Checks the timing and concurrency settings.
    pub fn validate(&self) -> FleetResult<()> {
        if self.seat_concurrency == 0 {
            return Err(FleetError::InvalidConfig(
                "seat concurrency must be at least 1".to_string(),
            ));
        }

        if self.poll_interval.is_zero() || self.poll_interval > self.ready_timeout {
            return Err(FleetError::InvalidConfig(format!(
                "poll interval {:?} must be non-zero and shorter than the ready timeout {:?}",
                self.poll_interval, self.ready_timeout
            )));
        }

        if let Some(token) = &self.auth_token {
            if token.trim().is_empty() {
                return Err(FleetError::InvalidConfig(
                    "auth token must not be empty when set".to_string(),
                ));
            }
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
