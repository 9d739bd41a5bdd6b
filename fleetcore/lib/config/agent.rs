use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use getset::Getters;
use ipnetwork::Ipv4Network;
use typed_builder::TypedBuilder;

use crate::{FleetError, FleetResult};

use super::{
    DEFAULT_BOOT_TIMEOUT, DEFAULT_BRIDGE_CIDR, DEFAULT_BRIDGE_NAME, DEFAULT_CAPACITY,
    DEFAULT_FILES_PORT, DEFAULT_IMAGES_DIR, DEFAULT_MEMORY_MIB, DEFAULT_NUM_VCPUS,
    DEFAULT_RUN_DIR, DEFAULT_STOP_TIMEOUT, DEFAULT_TERMINAL_PATH, DEFAULT_TERMINAL_PORT,
    SEAT_IP_OFFSET,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration of a host agent.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct AgentConfig {
    /// Identity reported on `/health` and `/info`.
    #[builder(setter(into))]
    worker_id: String,

    /// Pre-shared bearer token required on authenticated routes.
    #[builder(setter(into))]
    auth_token: String,

    /// Maximum number of sandboxes on this host.
    #[builder(default = DEFAULT_CAPACITY)]
    capacity: usize,

    /// Name of the bridge device sandboxes attach to.
    #[builder(default = DEFAULT_BRIDGE_NAME.to_string(), setter(into))]
    bridge_name: String,

    /// Gateway address and prefix of the sandbox subnet.
    #[builder(default = default_bridge_cidr())]
    bridge_cidr: Ipv4Network,

    /// Directory holding the kernel and root filesystem images.
    #[builder(default = DEFAULT_IMAGES_DIR.clone(), setter(into))]
    images_dir: PathBuf,

    /// Directory for per-sandbox working files.
    #[builder(default = DEFAULT_RUN_DIR.clone(), setter(into))]
    run_dir: PathBuf,

    /// vCPUs given to a sandbox when the request does not say.
    #[builder(default = DEFAULT_NUM_VCPUS)]
    default_vcpus: u8,

    /// Memory given to a sandbox when the request does not say.
    #[builder(default = DEFAULT_MEMORY_MIB)]
    default_memory_mib: u32,

    /// Guest port of the terminal service.
    #[builder(default = DEFAULT_TERMINAL_PORT)]
    terminal_port: u16,

    /// Guest path of the terminal WebSocket endpoint.
    #[builder(default = DEFAULT_TERMINAL_PATH.to_string(), setter(into))]
    terminal_path: String,

    /// Guest port of the file service.
    #[builder(default = DEFAULT_FILES_PORT)]
    files_port: u16,

    /// How long the hypervisor gets to answer on its control socket.
    #[builder(default = DEFAULT_BOOT_TIMEOUT)]
    boot_timeout: Duration,

    /// How long a graceful stop may take before the process is killed.
    #[builder(default = DEFAULT_STOP_TIMEOUT)]
    stop_timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl AgentConfig {
    /// The gateway address sandboxes route through.
    pub fn gateway(&self) -> Ipv4Addr {
        self.bridge_cidr.ip()
    }

    /// Checks that the configuration can actually serve `capacity` sandboxes.
    pub fn validate(&self) -> FleetResult<()> {
        if self.auth_token.trim().is_empty() {
            return Err(FleetError::InvalidConfig(
                "auth token must not be empty".to_string(),
            ));
        }

        if self.capacity == 0 {
            return Err(FleetError::InvalidConfig(
                "capacity must be at least 1".to_string(),
            ));
        }

        let slots = max_slots(&self.bridge_cidr);
        if (slots as usize) < self.capacity {
            return Err(FleetError::InvalidConfig(format!(
                "subnet {} has room for {slots} sandboxes but capacity is {}",
                self.bridge_cidr, self.capacity
            )));
        }

        if self.default_vcpus == 0 || self.default_memory_mib == 0 {
            return Err(FleetError::InvalidConfig(
                "default vcpus and memory must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The default sandbox subnet, `172.16.0.1/24`.
pub fn default_bridge_cidr() -> Ipv4Network {
    DEFAULT_BRIDGE_CIDR
        .parse()
        .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::new(172, 16, 0, 1)))
}

/// Number of slots a subnet can host: every address above `base + SEAT_IP_OFFSET` except the
/// broadcast address.
pub fn max_slots(cidr: &Ipv4Network) -> u32 {
    cidr.size().saturating_sub(SEAT_IP_OFFSET + 2)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
