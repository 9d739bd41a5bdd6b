use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{config::HOST_NAME_PREFIX, FleetResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Longest host name cloud providers accept.
const MAX_HOST_NAME_LEN: usize = 63;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates and deletes workshop hosts.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Creates a host and returns once the provider reports it created. The agent on it may
    /// still be starting.
    async fn create_host(&self, spec: &HostSpec) -> FleetResult<HostRecord>;

    /// Deletes a host. A host that does not exist is not an error.
    async fn delete_host(&self, name: &str) -> FleetResult<()>;

    /// Looks a host up by name.
    async fn get_host(&self, name: &str) -> FleetResult<Option<HostRecord>>;
}

/// What the provisioner asks the cloud for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    /// Host name, see [`host_name_for`].
    pub name: String,

    /// The workshop the host serves.
    pub workshop_id: String,

    /// Number of seats, passed to the host as metadata.
    pub seats: u32,

    /// Agent token, passed to the host as metadata.
    pub auth_token: String,
}

/// A host as reported by the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    /// Host name.
    pub name: String,

    /// Public address, if the host has one.
    pub external_ip: Option<Ipv4Addr>,

    /// Address inside the cloud network.
    pub internal_ip: Option<Ipv4Addr>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostRecord {
    /// The address the control plane reaches the agent on.
    pub fn agent_ip(&self, use_internal_ip: bool) -> Option<Ipv4Addr> {
        if use_internal_ip {
            self.internal_ip
        } else {
            self.external_ip.or(self.internal_ip)
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The host name of a workshop: lowercase, `[a-z0-9-]` only, at most 63 characters.
pub fn host_name_for(workshop_id: &str) -> String {
    let sanitized: String = workshop_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    let mut name = format!("{HOST_NAME_PREFIX}-{sanitized}");
    name.truncate(MAX_HOST_NAME_LEN);
    name.trim_end_matches('-').to_string()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
