use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use ipnetwork::Ipv4Network;

use crate::{FleetError, FleetResult};

use super::NetworkDriver;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory [`NetworkDriver`] for hosts without `CAP_NET_ADMIN` and for tests.
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    links: Mutex<BTreeMap<String, SimulatedLink>>,
    egress: Mutex<Vec<(String, Ipv4Network)>>,
    fail_tap_creation: AtomicBool,
}

/// A simulated network device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedLink {
    /// Whether the link is a bridge or a TAP.
    pub kind: SimulatedLinkKind,

    /// Addresses assigned to the link.
    pub addresses: Vec<Ipv4Network>,

    /// The bridge the link is attached to.
    pub master: Option<String>,

    /// Whether the link is up.
    pub up: bool,
}

/// The kind of a simulated link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedLinkKind {
    /// A bridge device.
    Bridge,

    /// A TAP device.
    Tap,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SimulatedDriver {
    /// Creates a driver with no links.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent TAP creations fail, to exercise rollback paths.
    pub fn set_fail_tap_creation(&self, fail: bool) {
        self.fail_tap_creation.store(fail, Ordering::SeqCst);
    }

    /// Returns a copy of a link's state.
    pub fn link(&self, name: &str) -> Option<SimulatedLink> {
        self.lock_links().get(name).cloned()
    }

    /// Names of all TAP devices currently present.
    pub fn tap_names(&self) -> Vec<String> {
        self.lock_links()
            .iter()
            .filter(|(_, link)| link.kind == SimulatedLinkKind::Tap)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Bridges that egress has been enabled for.
    pub fn egress_rules(&self) -> Vec<(String, Ipv4Network)> {
        self.egress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn lock_links(&self) -> MutexGuard<'_, BTreeMap<String, SimulatedLink>> {
        self.links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_link(&self, name: &str, kind: SimulatedLinkKind) -> FleetResult<()> {
        let mut links = self.lock_links();
        if links.contains_key(name) {
            return Err(FleetError::NetworkSetup(format!(
                "link {name} already exists"
            )));
        }

        links.insert(
            name.to_string(),
            SimulatedLink {
                kind,
                addresses: Vec::new(),
                master: None,
                up: false,
            },
        );
        Ok(())
    }

    fn with_link<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut SimulatedLink) -> T,
    ) -> FleetResult<T> {
        let mut links = self.lock_links();
        let link = links
            .get_mut(name)
            .ok_or_else(|| FleetError::NetworkSetup(format!("cannot find device {name}")))?;
        Ok(f(link))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl NetworkDriver for SimulatedDriver {
    async fn link_exists(&self, name: &str) -> FleetResult<bool> {
        Ok(self.lock_links().contains_key(name))
    }

    async fn add_bridge(&self, name: &str) -> FleetResult<()> {
        self.add_link(name, SimulatedLinkKind::Bridge)
    }

    async fn assign_address(&self, name: &str, address: Ipv4Network) -> FleetResult<()> {
        self.with_link(name, |link| {
            if !link.addresses.contains(&address) {
                link.addresses.push(address);
            }
        })
    }

    async fn add_tap(&self, name: &str) -> FleetResult<()> {
        if self.fail_tap_creation.load(Ordering::SeqCst) {
            return Err(FleetError::NetworkSetup(format!(
                "simulated failure creating {name}"
            )));
        }

        self.add_link(name, SimulatedLinkKind::Tap)
    }

    async fn attach(&self, name: &str, bridge: &str) -> FleetResult<()> {
        let is_bridge = matches!(
            self.link(bridge),
            Some(SimulatedLink {
                kind: SimulatedLinkKind::Bridge,
                ..
            })
        );
        if !is_bridge {
            return Err(FleetError::NetworkSetup(format!(
                "{bridge} is not a bridge"
            )));
        }

        self.with_link(name, |link| link.master = Some(bridge.to_string()))
    }

    async fn set_up(&self, name: &str) -> FleetResult<()> {
        self.with_link(name, |link| link.up = true)
    }

    async fn delete_link(&self, name: &str) -> FleetResult<bool> {
        Ok(self.lock_links().remove(name).is_some())
    }

    async fn enable_egress(&self, bridge: &str, subnet: Ipv4Network) -> FleetResult<()> {
        let mut egress = self
            .egress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let rule = (bridge.to_string(), subnet);
        if !egress.contains(&rule) {
            egress.push(rule);
        }
        Ok(())
    }
}
