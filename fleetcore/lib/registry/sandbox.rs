use std::{fmt, net::Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{FleetError, FleetResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Maximum length of a workshop id.
pub const MAX_WORKSHOP_ID_LEN: usize = 64;

/// Largest vCPU count a sandbox may ask for.
pub const MAX_VCPUS: u8 = 32;

/// Smallest amount of memory a sandbox may ask for.
pub const MIN_MEMORY_MIB: u32 = 128;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The identity of a sandbox: one seat of one workshop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SandboxKey {
    /// The workshop the seat belongs to.
    pub workshop_id: String,

    /// The seat number within the workshop.
    pub seat_id: u32,
}

/// The lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Interface allocated, hypervisor starting.
    Provisioning,

    /// Hypervisor answering on its control socket.
    Running,

    /// Boot failed with the hypervisor still alive; kept for inspection until destroyed.
    Error,

    /// Torn down.
    Removed,
}

/// A sandbox as reported by a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sandbox {
    /// The workshop the seat belongs to.
    pub workshop_id: String,

    /// The seat number within the workshop.
    pub seat_id: u32,

    /// Guest address on the host bridge.
    pub ip: Ipv4Addr,

    /// Host TAP device.
    pub tap_name: String,

    /// Host-local slot the address and TAP were derived from.
    pub slot: u32,

    /// Hypervisor process id, once there is one.
    #[serde(default)]
    pub pid: Option<u32>,

    /// Lifecycle state.
    pub status: SandboxStatus,

    /// When the create request was accepted.
    pub created_at: DateTime<Utc>,

    /// Number of vCPUs.
    pub vcpus: u8,

    /// Guest memory in MiB.
    pub memory_mib: u32,

    /// Why the sandbox is in [`SandboxStatus::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Resources requested for a sandbox. Unset values fall back to the host defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Number of vCPUs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u8>,

    /// Guest memory in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mib: Option<u32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxKey {
    /// Creates a key.
    pub fn new(workshop_id: impl Into<String>, seat_id: u32) -> Self {
        Self {
            workshop_id: workshop_id.into(),
            seat_id,
        }
    }

    /// Checks that the key can name host resources.
    ///
    /// Workshop ids are limited to ASCII letters, digits, `-` and `_` because they end up in
    /// directory names.
    pub fn validate(&self) -> FleetResult<()> {
        let id = &self.workshop_id;
        if id.is_empty() || id.len() > MAX_WORKSHOP_ID_LEN {
            return Err(FleetError::InvalidArgument(format!(
                "workshop_id must be 1 to {MAX_WORKSHOP_ID_LEN} characters"
            )));
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(FleetError::InvalidArgument(format!(
                "workshop_id {id:?} may only contain letters, digits, '-' and '_'"
            )));
        }

        if self.seat_id == 0 {
            return Err(FleetError::InvalidArgument(
                "seat_id must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

impl Sandbox {
    /// The sandbox's identity.
    pub fn key(&self) -> SandboxKey {
        SandboxKey::new(&self.workshop_id, self.seat_id)
    }

    /// Whether the sandbox can take traffic.
    pub fn is_running(&self) -> bool {
        self.status == SandboxStatus::Running
    }
}

impl Resources {
    /// Requests explicit resources.
    pub fn new(vcpus: u8, memory_mib: u32) -> Self {
        Self {
            vcpus: Some(vcpus),
            memory_mib: Some(memory_mib),
        }
    }

    /// Rejects values no guest can boot with.
    pub fn validate(&self) -> FleetResult<()> {
        if let Some(vcpus) = self.vcpus {
            if vcpus == 0 || vcpus > MAX_VCPUS {
                return Err(FleetError::InvalidArgument(format!(
                    "vcpus must be between 1 and {MAX_VCPUS}"
                )));
            }
        }

        if let Some(memory_mib) = self.memory_mib {
            if memory_mib < MIN_MEMORY_MIB {
                return Err(FleetError::InvalidArgument(format!(
                    "memory must be at least {MIN_MEMORY_MIB} MiB"
                )));
            }
        }

        Ok(())
    }

    /// Fills unset values from host defaults.
    pub fn resolve(&self, default_vcpus: u8, default_memory_mib: u32) -> (u8, u32) {
        (
            self.vcpus.unwrap_or(default_vcpus),
            self.memory_mib.unwrap_or(default_memory_mib),
        )
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for SandboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workshop_id, self.seat_id)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxStatus::Provisioning => write!(f, "provisioning"),
            SandboxStatus::Running => write!(f, "running"),
            SandboxStatus::Error => write!(f, "error"),
            SandboxStatus::Removed => write!(f, "removed"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_key_validation() {
        assert!(SandboxKey::new("ws-1", 1).validate().is_ok());
        assert!(SandboxKey::new("intro_rust", 12).validate().is_ok());
        assert!(SandboxKey::new("", 1).validate().is_err());
        assert!(SandboxKey::new("../etc", 1).validate().is_err());
        assert!(SandboxKey::new("ws 1", 1).validate().is_err());
        assert!(SandboxKey::new("ws-1", 0).validate().is_err());
        assert!(SandboxKey::new("a".repeat(65), 1).validate().is_err());
    }

    #[test]
    fn test_resources_resolve_defaults() {
        assert_eq!(Resources::default().resolve(2, 1024), (2, 1024));
        assert_eq!(
            Resources {
                vcpus: Some(4),
                memory_mib: None
            }
            .resolve(2, 1024),
            (4, 1024)
        );
        assert!(Resources::new(0, 1024).validate().is_err());
        assert!(Resources::new(2, 64).validate().is_err());
        assert!(Resources::new(2, 2048).validate().is_ok());
    }

    #[test]
    fn test_status_serializes_lowercase() -> anyhow::Result<()> {
        assert_eq!(
            serde_json::to_string(&SandboxStatus::Provisioning)?,
            "\"provisioning\""
        );
        assert_eq!(SandboxStatus::Running.to_string(), "running");
        Ok(())
    }
}
