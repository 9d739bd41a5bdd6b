use std::process::Output;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use tokio::process::Command;

use crate::{FleetError, FleetResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Low-level operations on host network devices.
///
/// The [`NetworkManager`](super::NetworkManager) composes these into idempotent bridge setup and
/// per-sandbox TAP allocation. Implementations only need to do exactly what each method says.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Whether a link with this name exists.
    async fn link_exists(&self, name: &str) -> FleetResult<bool>;

    /// Creates a bridge device.
    async fn add_bridge(&self, name: &str) -> FleetResult<()>;

    /// Sets the address of a link, replacing an identical one if present.
    async fn assign_address(&self, name: &str, address: Ipv4Network) -> FleetResult<()>;

    /// Creates a TAP device.
    async fn add_tap(&self, name: &str) -> FleetResult<()>;

    /// Enslaves a link to a bridge.
    async fn attach(&self, name: &str, bridge: &str) -> FleetResult<()>;

    /// Brings a link up.
    async fn set_up(&self, name: &str) -> FleetResult<()>;

    /// Deletes a link. Returns `false` if it did not exist.
    async fn delete_link(&self, name: &str) -> FleetResult<bool>;

    /// Allows traffic from the subnet behind `bridge` to leave the host.
    async fn enable_egress(&self, bridge: &str, subnet: Ipv4Network) -> FleetResult<()>;
}

/// A [`NetworkDriver`] that shells out to `ip`, `sysctl` and `iptables`.
///
/// Requires `CAP_NET_ADMIN`.
#[derive(Debug, Clone, Default)]
pub struct IpCommandDriver;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IpCommandDriver {
    /// Creates a new driver.
    pub fn new() -> Self {
        Self
    }

    async fn output(program: &str, args: &[&str]) -> FleetResult<Output> {
        tracing::trace!(program, ?args, "running network command");
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| FleetError::NetworkSetup(format!("failed to run {program}: {e}")))
    }

    async fn run(program: &str, args: &[&str]) -> FleetResult<()> {
        let output = Self::output(program, args).await?;
        if output.status.success() {
            return Ok(());
        }

        Err(FleetError::NetworkSetup(format!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }

    /// Appends an iptables rule unless an identical one is already present.
    async fn ensure_iptables_rule(table: &str, chain: &str, rule: &[&str]) -> FleetResult<()> {
        let mut check = vec!["-t", table, "-C", chain];
        check.extend_from_slice(rule);
        if Self::output("iptables", &check).await?.status.success() {
            return Ok(());
        }

        let mut append = vec!["-t", table, "-A", chain];
        append.extend_from_slice(rule);
        Self::run("iptables", &append).await
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl NetworkDriver for IpCommandDriver {
    async fn link_exists(&self, name: &str) -> FleetResult<bool> {
        let output = Self::output("ip", &["link", "show", "dev", name]).await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_device(&stderr) {
            return Ok(false);
        }

        Err(FleetError::NetworkSetup(format!(
            "ip link show {name} failed: {}",
            stderr.trim()
        )))
    }

    async fn add_bridge(&self, name: &str) -> FleetResult<()> {
        Self::run("ip", &["link", "add", "name", name, "type", "bridge"]).await
    }

    async fn assign_address(&self, name: &str, address: Ipv4Network) -> FleetResult<()> {
        let address = address.to_string();
        Self::run("ip", &["addr", "replace", &address, "dev", name]).await
    }

    async fn add_tap(&self, name: &str) -> FleetResult<()> {
        Self::run("ip", &["tuntap", "add", "dev", name, "mode", "tap"]).await
    }

    async fn attach(&self, name: &str, bridge: &str) -> FleetResult<()> {
        Self::run("ip", &["link", "set", "dev", name, "master", bridge]).await
    }

    async fn set_up(&self, name: &str) -> FleetResult<()> {
        Self::run("ip", &["link", "set", "dev", name, "up"]).await
    }

    async fn delete_link(&self, name: &str) -> FleetResult<bool> {
        let output = Self::output("ip", &["link", "del", "dev", name]).await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing_device(&stderr) {
            return Ok(false);
        }

        Err(FleetError::NetworkSetup(format!(
            "ip link del {name} failed: {}",
            stderr.trim()
        )))
    }

    async fn enable_egress(&self, bridge: &str, subnet: Ipv4Network) -> FleetResult<()> {
        Self::run("sysctl", &["-q", "-w", "net.ipv4.ip_forward=1"]).await?;

        let source = format!("{}/{}", subnet.network(), subnet.prefix());
        Self::ensure_iptables_rule(
            "nat",
            "POSTROUTING",
            &["-s", &source, "!", "-o", bridge, "-j", "MASQUERADE"],
        )
        .await?;
        Self::ensure_iptables_rule("filter", "FORWARD", &["-i", bridge, "-j", "ACCEPT"]).await?;
        Self::ensure_iptables_rule(
            "filter",
            "FORWARD",
            &[
                "-o",
                bridge,
                "-m",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        )
        .await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn is_missing_device(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("Cannot find device")
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
