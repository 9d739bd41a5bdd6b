//! Server state management.
//!
//! This module provides the [`AgentState`] type shared by every route of the host agent.

use std::{sync::Arc, time::Duration};

use getset::Getters;

use crate::{registry::Registry, FleetResult};

//-------------------------------------------------------------------------------------------------
// Constants
//-------------------------------------------------------------------------------------------------

/// Connect timeout for requests the proxy makes to guest services.
const GUEST_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Shared server state containing the registry.
///
/// Cloning is cheap; every field is reference counted.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct AgentState {
    /// The host's sandbox registry.
    registry: Arc<Registry>,

    /// Bearer token required on authenticated routes.
    auth_token: Arc<str>,

    /// Client used to reach guest services.
    guest_client: reqwest::Client,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl AgentState {
    /// Creates the state for a registry, taking the token from its configuration.
    pub fn new(registry: Arc<Registry>) -> FleetResult<Self> {
        let auth_token = Arc::from(registry.config().get_auth_token().as_str());
        // Guest redirects go back to the browser untouched.
        let guest_client = reqwest::Client::builder()
            .connect_timeout(GUEST_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            registry,
            auth_token,
            guest_client,
        })
    }
}
