//! Asset keys and the messages exchanged with the sink

use std::fmt;
use std::str::FromStr;

use mac_address::MacAddress;

/// Named assets exchanged with the sink, either published state or
/// actuation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AssetKey {
    TrackedDevices,
    RefreshVisibleDevices,
    ArpCommand,
    UsePing,
    MinDepartureCount,
    RefreshFrequency,
    VisibleDevices,
}

impl AssetKey {
    pub const ALL: [AssetKey; 7] = [
        AssetKey::TrackedDevices,
        AssetKey::RefreshVisibleDevices,
        AssetKey::ArpCommand,
        AssetKey::UsePing,
        AssetKey::MinDepartureCount,
        AssetKey::RefreshFrequency,
        AssetKey::VisibleDevices,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKey::TrackedDevices => "trackeddev",
            AssetKey::RefreshVisibleDevices => "refreshvisibledev",
            AssetKey::ArpCommand => "arpcommand",
            AssetKey::UsePing => "useping",
            AssetKey::MinDepartureCount => "mindeparturecount",
            AssetKey::RefreshFrequency => "refreshfrequency",
            AssetKey::VisibleDevices => "visibledev",
        }
    }

    /// `visibledev` is published only; everything else accepts actuations.
    pub fn is_actuator(&self) -> bool {
        !matches!(self, AssetKey::VisibleDevices)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAssetKey(pub String);

impl FromStr for AssetKey {
    type Err = UnknownAssetKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssetKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| UnknownAssetKey(s.to_string()))
    }
}

/// A value sent to one of our actuators. The payload is kept raw so the
/// manager can validate it per key.
#[derive(Clone, Debug)]
pub struct Actuation {
    pub key: AssetKey,
    pub payload: String,
}

/// Emitted by the reconciler when a tracked device's published presence flips.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceChange {
    pub name: String,
    pub mac_address: MacAddress,
    pub present: bool,
}
