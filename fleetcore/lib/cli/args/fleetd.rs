use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use ipnetwork::Ipv4Network;

use crate::{
    cli::styles,
    config::{
        AgentConfig, DEFAULT_BOOT_TIMEOUT, DEFAULT_BRIDGE_CIDR, DEFAULT_BRIDGE_NAME,
        DEFAULT_CAPACITY, DEFAULT_IMAGES_DIR, DEFAULT_MEMORY_MIB, DEFAULT_NUM_VCPUS,
        DEFAULT_RUN_DIR,
    },
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// `fleetd` runs the sandboxes of one workshop host and serves the agent API.
#[derive(Debug, Parser)]
#[command(name = "fleetd", author, version, styles=styles::styles())]
pub struct FleetdArgs {
    /// Address the agent API listens on
    #[arg(long, env = "FLEET_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Identity reported on /health and /info
    #[arg(long, env = "FLEET_WORKER_ID", default_value = "fleet-agent")]
    pub worker_id: String,

    /// Bearer token required on authenticated routes
    #[arg(long, env = "FLEET_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: String,

    /// Maximum number of sandboxes on this host
    #[arg(long, env = "FLEET_CAPACITY", default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,

    /// Bridge device sandboxes attach to
    #[arg(long, env = "FLEET_BRIDGE", default_value = DEFAULT_BRIDGE_NAME)]
    pub bridge: String,

    /// Gateway address and prefix of the sandbox subnet
    #[arg(long, env = "FLEET_BRIDGE_CIDR", default_value = DEFAULT_BRIDGE_CIDR)]
    pub bridge_cidr: Ipv4Network,

    /// Directory holding the kernel and root filesystem images
    #[arg(long, env = "FLEET_IMAGES_DIR")]
    pub images_dir: Option<PathBuf>,

    /// Directory for per-sandbox working files
    #[arg(long, env = "FLEET_RUN_DIR")]
    pub run_dir: Option<PathBuf>,

    /// Hypervisor binary, looked up on PATH when unset
    #[arg(long, env = "FLEET_FIRECRACKER_EXE")]
    pub firecracker: Option<PathBuf>,

    /// vCPUs per sandbox when a request does not say
    #[arg(long, default_value_t = DEFAULT_NUM_VCPUS)]
    pub vcpus: u8,

    /// Memory per sandbox in MiB when a request does not say
    #[arg(long, default_value_t = DEFAULT_MEMORY_MIB)]
    pub memory_mib: u32,

    /// Seconds the hypervisor gets to answer on its control socket
    #[arg(long, default_value_t = DEFAULT_BOOT_TIMEOUT.as_secs())]
    pub boot_timeout_secs: u64,

    /// Keep a snapshot of the sandboxes here and reclaim them after a restart
    #[arg(long, env = "FLEET_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Destroy every sandbox when the agent shuts down
    #[arg(long)]
    pub cleanup_on_exit: bool,

    /// Use simulated networking and hypervisor, for hosts without KVM or root
    #[arg(long)]
    pub simulate: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FleetdArgs {
    /// The agent configuration these arguments describe.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig::builder()
            .worker_id(self.worker_id.as_str())
            .auth_token(self.auth_token.as_str())
            .capacity(self.capacity)
            .bridge_name(self.bridge.as_str())
            .bridge_cidr(self.bridge_cidr)
            .images_dir(
                self.images_dir
                    .clone()
                    .unwrap_or_else(|| DEFAULT_IMAGES_DIR.clone()),
            )
            .run_dir(self.run_dir.clone().unwrap_or_else(|| DEFAULT_RUN_DIR.clone()))
            .default_vcpus(self.vcpus)
            .default_memory_mib(self.memory_mib)
            .boot_timeout(Duration::from_secs(self.boot_timeout_secs))
            .build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleetd_args_to_config() -> anyhow::Result<()> {
        let args = FleetdArgs::try_parse_from([
            "fleetd",
            "--auth-token",
            "secret",
            "--capacity",
            "3",
            "--bridge-cidr",
            "10.20.0.1/24",
            "--images-dir",
            "/srv/images",
            "--simulate",
        ])?;

        let config = args.agent_config();
        assert_eq!(config.get_auth_token(), "secret");
        assert_eq!(*config.get_capacity(), 3);
        assert_eq!(config.gateway().to_string(), "10.20.0.1");
        assert_eq!(config.get_images_dir(), &PathBuf::from("/srv/images"));
        assert_eq!(config.get_run_dir(), &*DEFAULT_RUN_DIR);
        assert!(args.simulate);
        assert!(!args.cleanup_on_exit);
        Ok(())
    }
}
