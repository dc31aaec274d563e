//! Thread-safe registry of tracked devices

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::debug;
use mac_address::MacAddress;

use crate::error::{Error, Result};
use crate::messages::PresenceChange;
use crate::reconciler::{self, SeenSet};

/// Debounce state for one tracked hardware address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedDevice {
    pub mac_address: MacAddress,
    /// Asset name, fixed when the device is first tracked.
    pub name: String,
    pub network_address: Option<IpAddr>,
    pub present: bool,
    /// Consecutive cycles missed while present.
    pub miss_count: u32,
}

impl TrackedDevice {
    pub fn new(mac_address: MacAddress, present: bool) -> Self {
        TrackedDevice {
            name: display_name(&mac_address),
            mac_address,
            network_address: None,
            present,
            miss_count: 0,
        }
    }
}

/// Parse a hardware address written with `:` or `-` separators.
pub fn parse_mac(s: &str) -> Result<MacAddress> {
    s.trim()
        .replace('-', ":")
        .parse()
        .map_err(|_| Error::InvalidMac(s.to_string()))
}

/// Hardware address with the separators stripped, e.g. `aabbccddeeff`.
pub fn display_name(mac_address: &MacAddress) -> String {
    normalize(mac_address).replace(':', "")
}

/// Lower-case colon-separated form used as the key in parsed ARP tables.
pub fn normalize(mac_address: &MacAddress) -> String {
    mac_address.to_string().to_lowercase()
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<MacAddress, TrackedDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<MacAddress, TrackedDevice>> {
        // A panic while holding the lock leaves counters in a usable state.
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `mac_address`. Returns false if it was already tracked,
    /// in which case the existing entry is left untouched.
    pub fn track(&self, mac_address: MacAddress, present: bool) -> bool {
        let mut devices = self.lock();
        if devices.contains_key(&mac_address) {
            return false;
        }
        debug!("Tracking {mac_address} (present: {present})");
        devices.insert(mac_address, TrackedDevice::new(mac_address, present));
        true
    }

    pub fn contains(&self, mac_address: &MacAddress) -> bool {
        self.lock().contains_key(mac_address)
    }

    pub fn get(&self, mac_address: &MacAddress) -> Option<TrackedDevice> {
        self.lock().get(mac_address).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every entry, taken under the lock and released immediately.
    pub fn snapshot(&self) -> Vec<TrackedDevice> {
        self.lock().values().cloned().collect()
    }

    /// Tracked hardware addresses in a stable order.
    pub fn addresses(&self) -> Vec<MacAddress> {
        let mut addresses: Vec<MacAddress> = self.lock().keys().copied().collect();
        addresses.sort_by_key(|mac_address| mac_address.bytes());
        addresses
    }

    /// Run one debounce cycle against `seen`.
    pub fn reconcile(&self, seen: &SeenSet, min_departure_count: u32) -> Vec<PresenceChange> {
        let mut devices = self.lock();
        reconciler::reconcile(&mut devices, seen, min_departure_count)
    }
}
