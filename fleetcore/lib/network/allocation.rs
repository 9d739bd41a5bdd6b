use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::{
    config::{max_slots, SEAT_IP_OFFSET, TAP_NAME_PREFIX},
    FleetError, FleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The network identity of one sandbox slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// The host-local slot the allocation was derived from.
    pub slot: u32,

    /// Address of the guest.
    pub ip: Ipv4Addr,

    /// Address of the bridge, used as the guest's default route.
    pub gateway: Ipv4Addr,

    /// Netmask of the sandbox subnet.
    pub netmask: Ipv4Addr,

    /// Name of the TAP device on the host.
    pub tap_name: String,

    /// MAC address of the guest NIC.
    pub guest_mac: String,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The TAP device name of a slot.
pub fn tap_name(slot: u32) -> String {
    format!("{TAP_NAME_PREFIX}{slot}")
}

/// The guest address of a slot: `network + SEAT_IP_OFFSET + slot`.
pub fn slot_ip(cidr: &Ipv4Network, slot: u32) -> FleetResult<Ipv4Addr> {
    let slots = max_slots(cidr);
    if slot == 0 || slot > slots {
        return Err(FleetError::AddressPoolExhausted(format!(
            "{cidr} (slot {slot} outside 1..={slots})"
        )));
    }

    let base = u32::from(cidr.network());
    Ok(Ipv4Addr::from(base + SEAT_IP_OFFSET + slot))
}

/// A locally administered MAC derived from the guest address, e.g. `06:00:ac:10:00:0b`.
pub fn guest_mac(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("06:00:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}

/// Derives the full allocation of a slot.
pub fn allocate(cidr: &Ipv4Network, slot: u32) -> FleetResult<Allocation> {
    let ip = slot_ip(cidr, slot)?;
    Ok(Allocation {
        slot,
        ip,
        gateway: cidr.ip(),
        netmask: cidr.mask(),
        tap_name: tap_name(slot),
        guest_mac: guest_mac(ip),
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::config::default_bridge_cidr;

    #[test]
    fn test_slot_ip_uses_offset() -> anyhow::Result<()> {
        let cidr = default_bridge_cidr();
        assert_eq!(slot_ip(&cidr, 1)?, Ipv4Addr::new(172, 16, 0, 11));
        assert_eq!(slot_ip(&cidr, 3)?, Ipv4Addr::new(172, 16, 0, 13));
        assert_eq!(slot_ip(&cidr, 244)?, Ipv4Addr::new(172, 16, 0, 254));
        Ok(())
    }

    #[test]
    fn test_slot_ip_rejects_out_of_range_slots() {
        let cidr = default_bridge_cidr();
        assert!(slot_ip(&cidr, 0).is_err());
        // slot 245 would be the broadcast address
        assert!(slot_ip(&cidr, 245).is_err());
    }

    #[test]
    fn test_allocations_are_distinct_per_slot() -> anyhow::Result<()> {
        let cidr = default_bridge_cidr();
        let mut ips = HashSet::new();
        let mut taps = HashSet::new();
        let mut macs = HashSet::new();

        for slot in 1..=max_slots(&cidr) {
            let allocation = allocate(&cidr, slot)?;
            assert!(allocation.tap_name.len() <= 15, "tap names must fit IFNAMSIZ");
            assert!(ips.insert(allocation.ip));
            assert!(taps.insert(allocation.tap_name));
            assert!(macs.insert(allocation.guest_mac));
        }
        Ok(())
    }

    #[test]
    fn test_allocation_carries_gateway_and_mask() -> anyhow::Result<()> {
        let allocation = allocate(&default_bridge_cidr(), 2)?;
        assert_eq!(allocation.gateway, Ipv4Addr::new(172, 16, 0, 1));
        assert_eq!(allocation.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(allocation.tap_name, "fctap2");
        assert_eq!(allocation.guest_mac, "06:00:ac:10:00:0c");
        Ok(())
    }
}
