use std::sync::Arc;

use getset::Getters;
use ipnetwork::Ipv4Network;

use crate::{
    config::{max_slots, AgentConfig},
    FleetError, FleetResult,
};

use super::{allocate, Allocation, NetworkDriver};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Owns the host bridge and the per-sandbox TAP devices attached to it.
#[derive(Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct NetworkManager {
    /// The driver that performs the device operations.
    #[getset(skip)]
    driver: Arc<dyn NetworkDriver>,

    /// Name of the bridge device.
    bridge_name: String,

    /// Gateway address and prefix of the sandbox subnet.
    cidr: Ipv4Network,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkManager {
    /// Creates a manager for the given bridge and subnet.
    pub fn new(
        driver: Arc<dyn NetworkDriver>,
        bridge_name: impl Into<String>,
        cidr: Ipv4Network,
    ) -> Self {
        Self {
            driver,
            bridge_name: bridge_name.into(),
            cidr,
        }
    }

    /// Creates a manager from an agent configuration.
    pub fn from_config(driver: Arc<dyn NetworkDriver>, config: &AgentConfig) -> Self {
        Self::new(driver, config.get_bridge_name(), *config.get_bridge_cidr())
    }

    /// Number of sandbox slots the subnet has room for.
    pub fn max_slots(&self) -> u32 {
        max_slots(&self.cidr)
    }

    /// Creates the bridge if needed, assigns the gateway address and brings it up.
    ///
    /// Safe to call on every startup: an existing bridge is reused.
    pub async fn ensure_bridge(&self) -> FleetResult<()> {
        if self.driver.link_exists(&self.bridge_name).await? {
            tracing::debug!(bridge = %self.bridge_name, "reusing existing bridge");
        } else {
            tracing::info!(bridge = %self.bridge_name, cidr = %self.cidr, "creating bridge");
            self.driver.add_bridge(&self.bridge_name).await?;
        }

        self.driver
            .assign_address(&self.bridge_name, self.cidr)
            .await?;
        self.driver.set_up(&self.bridge_name).await
    }

    /// Enables forwarding and NAT so sandboxes can reach the outside world.
    pub async fn ensure_egress(&self) -> FleetResult<()> {
        self.driver
            .enable_egress(&self.bridge_name, self.cidr)
            .await
    }

    /// The allocation a slot maps to, without touching any device.
    pub fn allocation(&self, slot: u32) -> FleetResult<Allocation> {
        allocate(&self.cidr, slot)
    }

    /// Creates the TAP device of a slot and attaches it to the bridge.
    ///
    /// Fails with [`FleetError::InterfaceExists`] if the TAP is already present. A TAP that was
    /// created but could not be attached is removed again before the error is returned.
    pub async fn allocate_interface(&self, slot: u32) -> FleetResult<Allocation> {
        let allocation = self.allocation(slot)?;
        let tap = allocation.tap_name.as_str();

        if self.driver.link_exists(tap).await? {
            return Err(FleetError::InterfaceExists(tap.to_string()));
        }

        self.driver.add_tap(tap).await?;

        let attached = async {
            self.driver.attach(tap, &self.bridge_name).await?;
            self.driver.set_up(tap).await
        }
        .await;

        if let Err(e) = attached {
            if let Err(cleanup) = self.driver.delete_link(tap).await {
                tracing::warn!(tap, error = %cleanup, "failed to remove half-configured tap");
            }
            return Err(e);
        }

        tracing::debug!(tap, ip = %allocation.ip, "allocated interface");
        Ok(allocation)
    }

    /// Deletes the TAP device of a slot. A missing device is not an error.
    pub async fn release_interface(&self, slot: u32) -> FleetResult<()> {
        let tap = super::tap_name(slot);
        if !self.driver.delete_link(&tap).await? {
            tracing::debug!(tap, "tap already absent");
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("bridge_name", &self.bridge_name)
            .field("cidr", &self.cidr)
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::{config::default_bridge_cidr, network::SimulatedDriver};

    fn manager() -> (Arc<SimulatedDriver>, NetworkManager) {
        let driver = Arc::new(SimulatedDriver::new());
        let manager = NetworkManager::new(driver.clone(), "fcbr0", default_bridge_cidr());
        (driver, manager)
    }

    #[tokio::test]
    async fn test_ensure_bridge_is_idempotent() -> anyhow::Result<()> {
        let (driver, manager) = manager();

        manager.ensure_bridge().await?;
        manager.ensure_bridge().await?;

        let bridge = driver.link("fcbr0").expect("bridge exists");
        assert!(bridge.up);
        assert_eq!(bridge.addresses, vec![default_bridge_cidr()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_interface_attaches_tap() -> anyhow::Result<()> {
        let (driver, manager) = manager();
        manager.ensure_bridge().await?;

        let allocation = manager.allocate_interface(1).await?;
        assert_eq!(allocation.ip, Ipv4Addr::new(172, 16, 0, 11));

        let tap = driver.link("fctap1").expect("tap exists");
        assert_eq!(tap.master.as_deref(), Some("fcbr0"));
        assert!(tap.up);
        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_interface_rejects_existing_tap() -> anyhow::Result<()> {
        let (_, manager) = manager();
        manager.ensure_bridge().await?;
        manager.allocate_interface(2).await?;

        let err = manager.allocate_interface(2).await.unwrap_err();
        assert!(matches!(err, FleetError::InterfaceExists(name) if name == "fctap2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_allocate_interface_rolls_back_on_attach_failure() -> anyhow::Result<()> {
        let (driver, manager) = manager();
        // No bridge, so attaching fails after the tap was created.
        let err = manager.allocate_interface(1).await.unwrap_err();

        assert!(matches!(err, FleetError::NetworkSetup(_)));
        assert!(driver.tap_names().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_release_interface_tolerates_absence() -> anyhow::Result<()> {
        let (driver, manager) = manager();
        manager.ensure_bridge().await?;
        manager.allocate_interface(4).await?;

        manager.release_interface(4).await?;
        manager.release_interface(4).await?;
        assert!(driver.tap_names().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_ensure_egress_records_subnet() -> anyhow::Result<()> {
        let (driver, manager) = manager();
        manager.ensure_egress().await?;
        manager.ensure_egress().await?;

        assert_eq!(
            driver.egress_rules(),
            vec![("fcbr0".to_string(), default_bridge_cidr())]
        );
        Ok(())
    }
}
