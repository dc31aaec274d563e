//! TOML configuration file model

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::parser::Dialect;
use crate::registry::parse_mac;
use crate::settings::{SettingChange, Settings};

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub tracker: Option<TrackerConfig>,
    pub devices: Option<Vec<TrackedDeviceConfig>>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    /// How long to wait after subscribing for the broker to replay retained state.
    pub retained_settle_ms: Option<u64>,
}

impl MqttConfig {
    pub fn retained_settle(&self) -> Duration {
        Duration::from_millis(self.retained_settle_ms.unwrap_or(500))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct TrackerConfig {
    pub arp_command: Option<String>,
    pub dialect: Option<Dialect>,
    pub min_departure_count: Option<u32>,
    pub refresh_frequency_seconds: Option<u64>,
    pub use_ping: Option<bool>,
    pub probe_timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TrackedDeviceConfig {
    pub address: String,
    /// Only used in log output.
    pub label: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn dialect(&self) -> Dialect {
        self.tracker
            .as_ref()
            .and_then(|tracker| tracker.dialect)
            .unwrap_or_default()
    }

    /// Initial runtime settings: platform defaults overlaid with `[tracker]`.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = Settings::for_dialect(self.dialect());
        let Some(tracker) = &self.tracker else {
            return Ok(settings);
        };

        let mut changes = Vec::new();
        if let Some(command) = &tracker.arp_command {
            changes.push(SettingChange::arp_command(command)?);
        }
        if let Some(seconds) = tracker.refresh_frequency_seconds {
            changes.push(SettingChange::refresh_frequency(seconds)?);
        }
        if let Some(count) = tracker.min_departure_count {
            changes.push(SettingChange::MinDepartureCount(count));
        }
        if let Some(enabled) = tracker.use_ping {
            changes.push(SettingChange::UsePing(enabled));
        }
        for change in changes {
            change.apply(&mut settings);
        }

        if let Some(ms) = tracker.probe_timeout_ms {
            anyhow::ensure!(ms > 0, "probe_timeout_ms must be greater than zero");
            settings.probe_timeout = Duration::from_millis(ms);
        }
        Ok(settings)
    }

    pub fn tracked_addresses(&self) -> anyhow::Result<Vec<MacAddress>> {
        self.devices
            .iter()
            .flatten()
            .map(|device| {
                parse_mac(&device.address).with_context(|| {
                    format!(
                        "device {}",
                        device.label.as_deref().unwrap_or("<unlabelled>")
                    )
                })
            })
            .collect()
    }
}
