use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use crate::{FleetError, FleetResult};

use super::{CloudProvider, HostRecord, HostSpec};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory [`CloudProvider`].
///
/// Every host it "creates" reports the same address, so pointing it at a locally running agent
/// gives a complete control plane without a cloud account.
#[derive(Debug)]
pub struct SimulatedCloud {
    address: Ipv4Addr,
    state: Mutex<SimulatedCloudState>,
}

#[derive(Debug, Default)]
struct SimulatedCloudState {
    hosts: BTreeMap<String, HostSpec>,
    fail_creates: bool,
    deletes: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SimulatedCloud {
    /// A cloud whose hosts all answer on `address`.
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            state: Mutex::new(SimulatedCloudState::default()),
        }
    }

    /// Makes host creation fail until reset.
    pub fn set_fail_creates(&self, fail: bool) {
        self.state().fail_creates = fail;
    }

    /// Names of the hosts that currently exist.
    pub fn host_names(&self) -> Vec<String> {
        self.state().hosts.keys().cloned().collect()
    }

    /// The [`HostSpec`] a host was created with.
    pub fn host_spec(&self, name: &str) -> Option<HostSpec> {
        self.state().hosts.get(name).cloned()
    }

    /// Number of delete calls, including those for absent hosts.
    pub fn delete_count(&self) -> usize {
        self.state().deletes
    }

    fn state(&self) -> MutexGuard<'_, SimulatedCloudState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, name: &str) -> HostRecord {
        HostRecord {
            name: name.to_string(),
            external_ip: Some(self.address),
            internal_ip: Some(self.address),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CloudProvider for SimulatedCloud {
    async fn create_host(&self, spec: &HostSpec) -> FleetResult<HostRecord> {
        let mut state = self.state();
        if state.fail_creates {
            return Err(FleetError::Cloud(format!(
                "quota exceeded creating {}",
                spec.name
            )));
        }

        if state.hosts.contains_key(&spec.name) {
            return Err(FleetError::Cloud(format!(
                "host {} already exists",
                spec.name
            )));
        }

        state.hosts.insert(spec.name.clone(), spec.clone());
        tracing::info!(host = %spec.name, address = %self.address, "simulated host created");
        Ok(self.record(&spec.name))
    }

    async fn delete_host(&self, name: &str) -> FleetResult<()> {
        let mut state = self.state();
        state.deletes += 1;
        if state.hosts.remove(name).is_some() {
            tracing::info!(host = %name, "simulated host deleted");
        }
        Ok(())
    }

    async fn get_host(&self, name: &str) -> FleetResult<Option<HostRecord>> {
        let exists = self.state().hosts.contains_key(name);
        Ok(exists.then(|| self.record(name)))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> HostSpec {
        HostSpec {
            name: name.to_string(),
            workshop_id: "ws-1".to_string(),
            seats: 2,
            auth_token: "secret".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_delete() -> anyhow::Result<()> {
        let cloud = SimulatedCloud::new(Ipv4Addr::LOCALHOST);

        let record = cloud.create_host(&spec("fleet-ws-ws-1")).await?;
        assert_eq!(record.agent_ip(false), Some(Ipv4Addr::LOCALHOST));
        assert!(cloud.get_host("fleet-ws-ws-1").await?.is_some());
        assert!(cloud.create_host(&spec("fleet-ws-ws-1")).await.is_err());

        cloud.delete_host("fleet-ws-ws-1").await?;
        cloud.delete_host("fleet-ws-ws-1").await?;
        assert!(cloud.host_names().is_empty());
        assert_eq!(cloud.delete_count(), 2);
        Ok(())
    }
}
