use std::path::{Path, PathBuf};

use fleetutils::CONSOLE_LOG_FILENAME;
use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::network::Allocation;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// File name of the hypervisor control socket inside a sandbox directory.
pub const API_SOCKET_FILENAME: &str = "firecracker.sock";

/// File name of the hypervisor configuration inside a sandbox directory.
pub const VM_CONFIG_FILENAME: &str = "vm-config.json";

/// Name of the guest NIC as seen by the guest kernel.
pub const GUEST_IFACE: &str = "eth0";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything needed to boot one sandbox.
///
/// ## Examples
///
/// ```rust
/// use fleetcore::{config::default_bridge_cidr, network::allocate, vm::BootSpec};
///
/// # fn main() -> anyhow::Result<()> {
/// let spec = BootSpec::builder()
///     .id("fleet-3")
///     .kernel_path("/var/lib/fleet/images/vmlinux")
///     .rootfs_path("/var/lib/fleet/run/003-ws-1-3/rootfs.ext4")
///     .workdir("/var/lib/fleet/run/003-ws-1-3")
///     .allocation(allocate(&default_bridge_cidr(), 3)?)
///     .vcpus(2)
///     .memory_mib(1024)
///     .build();
///
/// assert!(spec.boot_args().ends_with("ip=172.16.0.13::172.16.0.1:255.255.255.0::eth0:off"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct BootSpec {
    /// Hypervisor instance id.
    #[builder(setter(into))]
    id: String,

    /// Uncompressed guest kernel.
    #[builder(setter(into))]
    kernel_path: PathBuf,

    /// The sandbox's private, writable root filesystem.
    #[builder(setter(into))]
    rootfs_path: PathBuf,

    /// Directory holding the socket, config and console log.
    #[builder(setter(into))]
    workdir: PathBuf,

    /// Network identity of the guest.
    allocation: Allocation,

    /// Number of vCPUs.
    vcpus: u8,

    /// Guest memory in MiB.
    memory_mib: u32,
}

/// Firecracker's `--config-file` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    /// Kernel and command line.
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,

    /// Block devices.
    pub drives: Vec<Drive>,

    /// vCPU and memory sizing.
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,

    /// Guest NICs.
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
}

/// The `boot-source` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootSource {
    /// Path of the guest kernel.
    pub kernel_image_path: PathBuf,

    /// Kernel command line.
    pub boot_args: String,
}

/// One entry of the `drives` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drive {
    /// Drive identifier.
    pub drive_id: String,

    /// Backing file on the host.
    pub path_on_host: PathBuf,

    /// Whether the guest boots from this drive.
    pub is_root_device: bool,

    /// Whether the guest may write to it.
    pub is_read_only: bool,
}

/// The `machine-config` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of vCPUs.
    pub vcpu_count: u8,

    /// Guest memory in MiB.
    pub mem_size_mib: u32,
}

/// One entry of the `network-interfaces` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Interface identifier.
    pub iface_id: String,

    /// MAC address presented to the guest.
    pub guest_mac: String,

    /// Host TAP device backing the interface.
    pub host_dev_name: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BootSpec {
    /// Path of the hypervisor control socket.
    pub fn socket_path(&self) -> PathBuf {
        self.workdir.join(API_SOCKET_FILENAME)
    }

    /// Path the hypervisor configuration is written to.
    pub fn config_path(&self) -> PathBuf {
        self.workdir.join(VM_CONFIG_FILENAME)
    }

    /// Path of the rotating console log.
    pub fn console_log_path(&self) -> PathBuf {
        self.workdir.join(CONSOLE_LOG_FILENAME)
    }

    /// Kernel command line with the guest's static network configuration.
    pub fn boot_args(&self) -> String {
        boot_args(&self.allocation)
    }

    /// The hypervisor configuration for this sandbox.
    pub fn firecracker_config(&self) -> FirecrackerConfig {
        FirecrackerConfig {
            boot_source: BootSource {
                kernel_image_path: self.kernel_path.clone(),
                boot_args: self.boot_args(),
            },
            drives: vec![Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: self.rootfs_path.clone(),
                is_root_device: true,
                is_read_only: false,
            }],
            machine_config: MachineConfig {
                vcpu_count: self.vcpus,
                mem_size_mib: self.memory_mib,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: GUEST_IFACE.to_string(),
                guest_mac: self.allocation.guest_mac.clone(),
                host_dev_name: self.allocation.tap_name.clone(),
            }],
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Kernel command line for a guest: serial console, reboot-on-panic and a static `ip=` setting.
pub fn boot_args(allocation: &Allocation) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:{}::{GUEST_IFACE}:off",
        allocation.ip, allocation.gateway, allocation.netmask
    )
}

/// The directory name of a sandbox under the run directory, e.g. `003-ws-1-3`.
///
/// The slot prefix keeps a sandbox that is still being torn down apart from a new sandbox for
/// the same seat.
pub fn sandbox_dir_name(workshop_id: &str, seat_id: u32, slot: u32) -> String {
    format!("{slot:03}-{workshop_id}-{seat_id}")
}

/// The sandbox directory of a seat under `run_dir`.
pub fn sandbox_dir(run_dir: &Path, workshop_id: &str, seat_id: u32, slot: u32) -> PathBuf {
    run_dir.join(sandbox_dir_name(workshop_id, seat_id, slot))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
