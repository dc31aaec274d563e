//! Debounce state machine turning per-cycle sightings into stable presence

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use log::{debug, info};
use mac_address::MacAddress;

use crate::messages::PresenceChange;
use crate::parser::ArpTable;
use crate::registry::{TrackedDevice, parse_mac};

/// Devices observed during one discovery cycle.
///
/// A scan covers every tracked device. A probe sweep only covers the devices
/// it actually probed, so devices outside its scope neither gain nor lose
/// confidence from it.
#[derive(Clone, Debug, Default)]
pub struct SeenSet {
    seen: HashMap<MacAddress, Option<IpAddr>>,
    scope: Option<HashSet<MacAddress>>,
}

impl SeenSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from a parsed ARP table. Rows whose hardware address does not
    /// parse are dropped; unparseable network addresses are kept as unknown.
    pub fn from_table(table: &ArpTable) -> Self {
        let mut seen = HashMap::with_capacity(table.len());
        for (mac, ip) in table {
            match parse_mac(mac) {
                Ok(mac_address) => {
                    seen.insert(mac_address, ip.parse().ok());
                }
                Err(_) => debug!("Ignoring unparseable hardware address {mac:?}"),
            }
        }
        SeenSet { seen, scope: None }
    }

    /// Result of a probe sweep: `probed` were tried, `responded` answered.
    pub fn probed(
        probed: impl IntoIterator<Item = MacAddress>,
        responded: impl IntoIterator<Item = (MacAddress, IpAddr)>,
    ) -> Self {
        SeenSet {
            seen: responded
                .into_iter()
                .map(|(mac, ip)| (mac, Some(ip)))
                .collect(),
            scope: Some(probed.into_iter().collect()),
        }
    }

    pub fn with_device(mut self, mac_address: MacAddress, address: Option<IpAddr>) -> Self {
        self.seen.insert(mac_address, address);
        self
    }

    pub fn contains(&self, mac_address: &MacAddress) -> bool {
        self.seen.contains_key(mac_address)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn covers(&self, mac_address: &MacAddress) -> bool {
        self.scope
            .as_ref()
            .is_none_or(|scope| scope.contains(mac_address))
    }
}

/// Apply one cycle to every tracked device and return the presence flips.
pub fn reconcile(
    devices: &mut HashMap<MacAddress, TrackedDevice>,
    seen: &SeenSet,
    min_departure_count: u32,
) -> Vec<PresenceChange> {
    devices
        .values_mut()
        .filter_map(|device| step(device, seen, min_departure_count))
        .collect()
}

fn step(device: &mut TrackedDevice, seen: &SeenSet, min_departure_count: u32) -> Option<PresenceChange> {
    if let Some(address) = seen.seen.get(&device.mac_address) {
        device.miss_count = 0;
        if address.is_some() {
            device.network_address = *address;
        }
        if device.present {
            return None;
        }
        device.present = true;
        info!("joined: {}", device.name);
        return Some(change(device));
    }

    if !device.present {
        device.miss_count = 0;
        return None;
    }
    if !seen.covers(&device.mac_address) {
        return None;
    }

    device.miss_count = device.miss_count.saturating_add(1);
    if device.miss_count <= min_departure_count {
        debug!(
            "{} missed {} of {} cycles",
            device.name, device.miss_count, min_departure_count
        );
        return None;
    }

    device.present = false;
    device.miss_count = 0;
    device.network_address = None;
    info!("left: {}", device.name);
    Some(change(device))
}

fn change(device: &TrackedDevice) -> PresenceChange {
    PresenceChange {
        name: device.name.clone(),
        mac_address: device.mac_address,
        present: device.present,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: u32 = 2;

    fn mac() -> MacAddress {
        parse_mac("aa:bb:cc:dd:ee:ff").unwrap()
    }

    fn ip() -> IpAddr {
        "192.168.1.10".parse().unwrap()
    }

    fn devices(present: bool) -> HashMap<MacAddress, TrackedDevice> {
        HashMap::from([(mac(), TrackedDevice::new(mac(), present))])
    }

    fn seen() -> SeenSet {
        SeenSet::empty().with_device(mac(), Some(ip()))
    }

    fn device(devices: &HashMap<MacAddress, TrackedDevice>) -> &TrackedDevice {
        &devices[&mac()]
    }

    #[test]
    fn test_never_seen_stays_offline() {
        let mut devices = devices(false);
        for _ in 0..10 {
            assert!(reconcile(&mut devices, &SeenSet::empty(), THRESHOLD).is_empty());
            assert!(!device(&devices).present);
            assert_eq!(device(&devices).miss_count, 0);
        }
    }

    #[test]
    fn test_join_emits_once() {
        let mut devices = devices(false);
        let changes = reconcile(&mut devices, &seen(), THRESHOLD);
        assert_eq!(
            changes,
            vec![PresenceChange {
                name: "aabbccddeeff".to_string(),
                mac_address: mac(),
                present: true,
            }]
        );
        assert_eq!(device(&devices).network_address, Some(ip()));

        for _ in 0..3 {
            assert!(reconcile(&mut devices, &seen(), THRESHOLD).is_empty());
        }
    }

    #[test]
    fn test_debounce_threshold() {
        let mut devices = devices(false);
        reconcile(&mut devices, &seen(), THRESHOLD);

        for expected_misses in 1..=THRESHOLD {
            assert!(reconcile(&mut devices, &SeenSet::empty(), THRESHOLD).is_empty());
            assert!(device(&devices).present);
            assert_eq!(device(&devices).miss_count, expected_misses);
        }

        let changes = reconcile(&mut devices, &SeenSet::empty(), THRESHOLD);
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].present);
        let device = device(&devices);
        assert!(!device.present);
        assert_eq!(device.miss_count, 0);
        assert_eq!(device.network_address, None);
    }

    #[test]
    fn test_zero_threshold_departs_on_first_miss() {
        let mut devices = devices(false);
        reconcile(&mut devices, &seen(), 0);
        let changes = reconcile(&mut devices, &SeenSet::empty(), 0);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn test_sighting_resets_miss_count() {
        let mut devices = devices(false);
        reconcile(&mut devices, &seen(), THRESHOLD);
        reconcile(&mut devices, &SeenSet::empty(), THRESHOLD);
        reconcile(&mut devices, &SeenSet::empty(), THRESHOLD);
        assert!(reconcile(&mut devices, &seen(), THRESHOLD).is_empty());
        assert_eq!(device(&devices).miss_count, 0);
        assert!(reconcile(&mut devices, &SeenSet::empty(), THRESHOLD).is_empty());
    }

    #[test]
    fn test_seen_without_address_keeps_last_address() {
        let mut devices = devices(false);
        reconcile(&mut devices, &seen(), THRESHOLD);
        reconcile(&mut devices, &SeenSet::empty().with_device(mac(), None), THRESHOLD);
        assert_eq!(device(&devices).network_address, Some(ip()));
    }

    #[test]
    fn test_probe_outside_scope_is_not_a_miss() {
        let mut devices = devices(true);
        let sweep = SeenSet::probed(Vec::new(), Vec::new());
        for _ in 0..5 {
            assert!(reconcile(&mut devices, &sweep, THRESHOLD).is_empty());
        }
        assert_eq!(device(&devices).miss_count, 0);
        assert!(device(&devices).present);
    }

    #[test]
    fn test_probe_in_scope_counts_misses() {
        let mut devices = devices(false);
        reconcile(&mut devices, &seen(), THRESHOLD);
        let sweep = SeenSet::probed([mac()], Vec::new());
        reconcile(&mut devices, &sweep, THRESHOLD);
        assert_eq!(device(&devices).miss_count, 1);
        let answered = SeenSet::probed([mac()], [(mac(), ip())]);
        reconcile(&mut devices, &answered, THRESHOLD);
        assert_eq!(device(&devices).miss_count, 0);
    }

    #[test]
    fn test_from_table_drops_bad_macs() {
        let table = ArpTable::from([
            ("aa:bb:cc:dd:ee:ff".to_string(), "192.168.1.10".to_string()),
            ("(incomplete)".to_string(), "192.168.1.11".to_string()),
            ("aa:bb:cc:dd:ee:01".to_string(), "not-an-ip".to_string()),
        ]);
        let seen = SeenSet::from_table(&table);
        assert_eq!(seen.len(), 2);
        assert!(seen.contains(&mac()));
    }
}
