use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    cli::styles,
    config::{
        CloudConfig, ProvisionerConfig, DEFAULT_AGENT_PORT, DEFAULT_AGENT_READY_TIMEOUT,
        DEFAULT_CAPACITY, DEFAULT_MACHINE_TYPE, DEFAULT_REQUEST_TIMEOUT,
        DEFAULT_WORKER_FAILURE_THRESHOLD, DEFAULT_WORKER_HEALTH_INTERVAL,
    },
    registry::Resources,
    FleetError, FleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// `fleetctl` provisions workshop hosts and places sandboxes on a worker pool.
#[derive(Debug, Parser)]
#[command(name = "fleetctl", author, version, styles=styles::styles())]
pub struct FleetctlArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: FleetctlSubcommand,

    /// Per-request timeout for agent calls, in seconds
    #[arg(long, global = true, default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    pub request_timeout_secs: u64,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum FleetctlSubcommand {
    /// Create a workshop host and one sandbox per seat
    #[command(name = "provision")]
    Provision {
        /// Workshop to provision
        workshop_id: String,

        /// Number of seats
        #[arg(long)]
        seats: u32,

        /// vCPUs per seat, host default when unset
        #[arg(long)]
        vcpus: Option<u8>,

        /// Memory per seat in MiB, host default when unset
        #[arg(long)]
        memory_mib: Option<u32>,

        /// Seconds the new host gets to become healthy
        #[arg(long, default_value_t = DEFAULT_AGENT_READY_TIMEOUT.as_secs())]
        ready_timeout_secs: u64,

        /// Where the host lives
        #[command(flatten)]
        cloud: CloudArgs,
    },

    /// Destroy a workshop's sandboxes and delete its host
    #[command(name = "teardown")]
    Teardown {
        /// Workshop to tear down
        workshop_id: String,

        /// Where the host lives
        #[command(flatten)]
        cloud: CloudArgs,
    },

    /// Provision every seat of a workshop on the worker pool instead of a new host
    #[command(name = "provision-pool")]
    ProvisionPool {
        /// Workshop to provision
        workshop_id: String,

        /// Number of seats
        #[arg(long)]
        seats: u32,

        /// vCPUs per seat, worker default when unset
        #[arg(long)]
        vcpus: Option<u8>,

        /// Memory per seat in MiB, worker default when unset
        #[arg(long)]
        memory_mib: Option<u32>,

        /// Workers to use
        #[command(flatten)]
        pool: PoolArgs,
    },

    /// Destroy every sandbox of a workshop on the worker pool
    #[command(name = "teardown-pool")]
    TeardownPool {
        /// Workshop to tear down
        workshop_id: String,

        /// Workers to use
        #[command(flatten)]
        pool: PoolArgs,
    },

    /// Place the sandbox of a seat on the worker pool
    #[command(name = "place")]
    Place {
        /// Workshop of the seat
        workshop_id: String,

        /// Seat number
        seat_id: u32,

        /// vCPUs, worker default when unset
        #[arg(long)]
        vcpus: Option<u8>,

        /// Memory in MiB, worker default when unset
        #[arg(long)]
        memory_mib: Option<u32>,

        /// Workers to use
        #[command(flatten)]
        pool: PoolArgs,
    },

    /// Destroy the sandbox of a seat on whichever worker runs it
    #[command(name = "release")]
    Release {
        /// Workshop of the seat
        workshop_id: String,

        /// Seat number
        seat_id: u32,

        /// Workers to use
        #[command(flatten)]
        pool: PoolArgs,
    },

    /// List the sandboxes on the worker pool
    #[command(name = "vms")]
    Vms {
        /// Only sandboxes of this workshop
        #[arg(long)]
        workshop_id: Option<String>,

        /// Workers to use
        #[command(flatten)]
        pool: PoolArgs,
    },

    /// Check and show the health of every worker
    #[command(name = "workers")]
    Workers {
        /// Keep checking and redraw the table after every check
        #[arg(long)]
        watch: bool,

        /// Seconds between checks with --watch
        #[arg(long, default_value_t = DEFAULT_WORKER_HEALTH_INTERVAL.as_secs())]
        interval_secs: u64,

        /// Missed checks before a worker counts as down with --watch
        #[arg(long, default_value_t = DEFAULT_WORKER_FAILURE_THRESHOLD)]
        failure_threshold: u32,

        /// Workers to use
        #[command(flatten)]
        pool: PoolArgs,
    },
}

/// Where workshop hosts are created.
#[derive(Debug, Clone, Args)]
pub struct CloudArgs {
    /// Cloud project
    #[arg(long, env = "FLEET_PROJECT")]
    pub project: Option<String>,

    /// Cloud zone
    #[arg(long, env = "FLEET_ZONE")]
    pub zone: Option<String>,

    /// Snapshot the host disk is created from
    #[arg(long, env = "FLEET_SNAPSHOT")]
    pub snapshot: Option<String>,

    /// Host machine type
    #[arg(long, env = "FLEET_MACHINE_TYPE", default_value = DEFAULT_MACHINE_TYPE)]
    pub machine_type: String,

    /// Use spot scheduling for hosts
    #[arg(long)]
    pub spot: bool,

    /// VPC network of the hosts
    #[arg(long, env = "FLEET_NETWORK")]
    pub network: Option<String>,

    /// Port the agent listens on inside each host
    #[arg(long, env = "FLEET_AGENT_PORT", default_value_t = DEFAULT_AGENT_PORT)]
    pub agent_port: u16,

    /// Reach agents on the internal address of the host
    #[arg(long)]
    pub use_internal_ip: bool,

    /// Shared agent token, generated per workshop when unset
    #[arg(long, env = "FLEET_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Sandboxes each host accepts
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub host_capacity: usize,

    /// Pretend every host is the agent on 127.0.0.1 instead of calling the cloud
    #[arg(long)]
    pub simulate: bool,
}

/// The worker pool to work against.
#[derive(Debug, Clone, Args)]
pub struct PoolArgs {
    /// TOML file listing the workers
    #[arg(long, env = "FLEET_WORKERS_FILE", default_value = "workers.toml")]
    pub workers: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FleetctlArgs {
    /// The per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl FleetctlSubcommand {
    /// The resources asked for on the command line, if the subcommand creates sandboxes.
    pub fn resources(&self) -> Resources {
        match self {
            FleetctlSubcommand::Provision {
                vcpus, memory_mib, ..
            }
            | FleetctlSubcommand::ProvisionPool {
                vcpus, memory_mib, ..
            }
            | FleetctlSubcommand::Place {
                vcpus, memory_mib, ..
            } => Resources {
                vcpus: *vcpus,
                memory_mib: *memory_mib,
            },
            _ => Resources::default(),
        }
    }
}

impl CloudArgs {
    /// The cloud configuration. Project, zone and snapshot are required.
    pub fn cloud_config(&self) -> FleetResult<CloudConfig> {
        let required = |value: &Option<String>, flag: &str| {
            value
                .clone()
                .ok_or_else(|| FleetError::InvalidConfig(format!("--{flag} is required")))
        };

        let config = CloudConfig::builder()
            .project(required(&self.project, "project")?)
            .zone(required(&self.zone, "zone")?)
            .snapshot(required(&self.snapshot, "snapshot")?)
            .machine_type(self.machine_type.as_str())
            .spot(self.spot);

        Ok(match &self.network {
            Some(network) => config.network(network.as_str()).build(),
            None => config.build(),
        })
    }

    /// The provisioner configuration.
    pub fn provisioner_config(
        &self,
        request_timeout: Duration,
        ready_timeout: Duration,
    ) -> ProvisionerConfig {
        let config = ProvisionerConfig::builder()
            .agent_port(self.agent_port)
            .use_internal_ip(self.use_internal_ip)
            .host_capacity(self.host_capacity)
            .request_timeout(request_timeout)
            .ready_timeout(ready_timeout);

        match &self.auth_token {
            Some(token) => config.auth_token(token.as_str()).build(),
            None => config.build(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
