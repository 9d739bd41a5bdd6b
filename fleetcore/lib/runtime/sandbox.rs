use std::{fmt, net::Ipv4Addr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    registry::{Resources, Sandbox},
    FleetError, FleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The isolation technology behind a [`SandboxRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// One Firecracker microVM per sandbox.
    MicroVm,

    /// One container per sandbox. No implementation ships in this crate.
    Container,
}

/// Anything that can create and destroy sandboxes.
///
/// Implemented by the host-local [`Registry`](crate::registry::Registry), by the
/// [`AgentClient`](crate::client::AgentClient) that talks to a remote host, and by the
/// [`WorkerPool`](crate::pool::WorkerPool) that spreads sandboxes over many hosts. The
/// provisioner only ever sees this trait.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// The isolation technology used.
    fn kind(&self) -> RuntimeKind;

    /// Creates the sandbox of a seat.
    async fn create(
        &self,
        workshop_id: &str,
        seat_id: u32,
        resources: Resources,
    ) -> FleetResult<Sandbox>;

    /// Destroys the sandbox of a seat. Destroying a missing sandbox succeeds.
    async fn destroy(&self, workshop_id: &str, seat_id: u32) -> FleetResult<()>;

    /// Lists sandboxes, optionally only those of one workshop. `None` and `Some("")` both mean
    /// every sandbox.
    async fn list(&self, workshop_id: Option<&str>) -> FleetResult<Vec<Sandbox>>;

    /// The guest address of a running sandbox.
    async fn get_ip(&self, workshop_id: &str, seat_id: u32) -> FleetResult<Ipv4Addr>;

    /// Destroys every sandbox of a workshop and returns how many went away. Errors are only
    /// returned when nothing could be destroyed.
    async fn destroy_workshop(&self, workshop_id: &str) -> FleetResult<usize> {
        if workshop_id.is_empty() {
            return Err(FleetError::InvalidArgument(
                "workshop_id must not be empty".to_string(),
            ));
        }

        let mut destroyed = 0;
        let mut first_error = None;
        for sandbox in self.list(Some(workshop_id)).await? {
            match self.destroy(&sandbox.workshop_id, sandbox.seat_id).await {
                Ok(()) => destroyed += 1,
                Err(e) => {
                    tracing::warn!(key = %sandbox.key(), error = %e, "failed to destroy sandbox");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if destroyed == 0 => Err(e),
            _ => Ok(destroyed),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeKind::MicroVm => write!(f, "microvm"),
            RuntimeKind::Container => write!(f, "container"),
        }
    }
}
