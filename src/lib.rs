//! Debounced network presence tracking for a fixed set of hardware addresses.
//!
//! Devices are discovered by periodically reading the ARP table and,
//! optionally, by pinging their last known address. A device is reported
//! present as soon as it is seen and absent only after it has been missed
//! for more than `min_departure_count` consecutive cycles.

pub mod cadence;
pub mod config;
pub mod error;
pub mod manager;
pub mod messages;
pub mod mqtt;
pub mod parser;
pub mod probe;
pub mod reconciler;
pub mod registry;
pub mod scanner;
pub mod settings;
pub mod sink;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use manager::Manager;
pub use messages::{Actuation, AssetKey, PresenceChange};
pub use parser::{ArpTable, Dialect, parse};
pub use probe::{PingProber, Prober};
pub use reconciler::SeenSet;
pub use registry::{DeviceRegistry, TrackedDevice, parse_mac};
pub use scanner::{CommandRunner, ShellRunner};
pub use settings::{SettingChange, Settings};
pub use sink::PresenceSink;
