use std::{path::PathBuf, sync::LazyLock, time::Duration};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Default port the host agent listens on.
pub const DEFAULT_AGENT_PORT: u16 = 8080;

/// Default name of the host bridge device.
pub const DEFAULT_BRIDGE_NAME: &str = "fcbr0";

/// Default gateway address and prefix of the sandbox subnet.
pub const DEFAULT_BRIDGE_CIDR: &str = "172.16.0.1/24";

/// Offset added to a slot number to get the sandbox's host octet (slot 1 -> `.11`).
pub const SEAT_IP_OFFSET: u32 = 10;

/// Prefix of the TAP device names; the slot number is appended.
pub const TAP_NAME_PREFIX: &str = "fctap";

/// Default number of sandboxes a host accepts.
pub const DEFAULT_CAPACITY: usize = 10;

/// The default number of vCPUs given to a sandbox.
pub const DEFAULT_NUM_VCPUS: u8 = 2;

/// The default amount of RAM in MiB given to a sandbox.
pub const DEFAULT_MEMORY_MIB: u32 = 1024;

/// Guest port of the terminal (WebSocket) service.
pub const DEFAULT_TERMINAL_PORT: u16 = 7681;

/// Guest path of the terminal WebSocket endpoint.
pub const DEFAULT_TERMINAL_PATH: &str = "/ws";

/// Guest port of the file service.
pub const DEFAULT_FILES_PORT: u16 = 8090;

/// Kernel image file name inside the images directory.
pub const KERNEL_IMAGE_FILENAME: &str = "vmlinux";

/// Root filesystem image file name inside the images directory.
pub const ROOTFS_IMAGE_FILENAME: &str = "rootfs.ext4";

/// Environment variable overriding the hypervisor binary location.
pub const FIRECRACKER_EXE_ENV_VAR: &str = "FLEET_FIRECRACKER_EXE";

/// Name of the hypervisor binary looked up on `PATH`.
pub const FIRECRACKER_BINARY: &str = "firecracker";

/// How long a hypervisor may take to answer on its control socket.
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a graceful shutdown may take before the process is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between agent health polls while a host comes up.
pub const DEFAULT_HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Overall time a freshly created host gets to report healthy.
pub const DEFAULT_AGENT_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Per-request timeout for control-plane calls to an agent.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval of the worker pool's background health checks.
pub const DEFAULT_WORKER_HEALTH_INTERVAL: Duration = Duration::from_secs(15);

/// Consecutive failed health checks before a worker is taken out of rotation.
pub const DEFAULT_WORKER_FAILURE_THRESHOLD: u32 = 3;

/// How many sandboxes the provisioner creates at once on a host.
pub const DEFAULT_SEAT_CONCURRENCY: usize = 4;

/// Default machine type for workshop hosts.
pub const DEFAULT_MACHINE_TYPE: &str = "n2-standard-8";

/// Instance metadata key carrying the agent token.
pub const METADATA_AUTH_TOKEN_KEY: &str = "fleet-auth-token";

/// Instance metadata key carrying the seat count.
pub const METADATA_SEATS_KEY: &str = "fleet-seats";

/// Instance metadata key carrying the workshop id.
pub const METADATA_WORKSHOP_KEY: &str = "fleet-workshop";

/// Name of the cloud CLI looked up on `PATH`.
pub const GCLOUD_BINARY: &str = "gcloud";

/// Environment variable overriding the cloud CLI location.
pub const GCLOUD_EXE_ENV_VAR: &str = "FLEET_GCLOUD_EXE";

/// Length of generated agent tokens.
pub const GENERATED_TOKEN_LEN: usize = 32;

/// Prefix of cloud host names.
pub const HOST_NAME_PREFIX: &str = "fleet-ws";

/// The directory where per-sandbox working files are kept.
pub static DEFAULT_RUN_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/var/lib/fleet/run"));

/// The directory where kernel and root filesystem images are read from.
pub static DEFAULT_IMAGES_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| PathBuf::from("/var/lib/fleet/images"));
