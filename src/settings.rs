//! Runtime-adjustable tracker parameters and their validation

use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::messages::AssetKey;
use crate::parser::Dialect;

pub const DEFAULT_MIN_DEPARTURE_COUNT: u32 = 2;
pub const DEFAULT_REFRESH_FREQUENCY_SECONDS: u64 = 1;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// One day.
pub const MAX_REFRESH_FREQUENCY_SECONDS: u64 = 86_400;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub arp_command: String,
    pub min_departure_count: u32,
    pub refresh_frequency_seconds: u64,
    pub use_ping: bool,
    pub probe_timeout: Duration,
}

impl Settings {
    pub fn for_dialect(dialect: Dialect) -> Self {
        Settings {
            arp_command: dialect.default_command().to_string(),
            min_departure_count: DEFAULT_MIN_DEPARTURE_COUNT,
            refresh_frequency_seconds: DEFAULT_REFRESH_FREQUENCY_SECONDS,
            use_ping: false,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_frequency_seconds)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::for_dialect(Dialect::default())
    }
}

/// A validated change to one setting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SettingChange {
    ArpCommand(String),
    UsePing(bool),
    MinDepartureCount(u32),
    RefreshFrequency(u64),
}

impl SettingChange {
    /// Validate `value` for `key`. Keys that are not settings are rejected.
    pub fn parse(key: AssetKey, value: &Value) -> Result<Self> {
        match key {
            AssetKey::ArpCommand => {
                let command = value
                    .as_str()
                    .ok_or_else(|| Error::invalid_setting(key, format!("expected a string, got {value}")))?;
                Self::arp_command(command)
            }
            AssetKey::UsePing => value
                .as_bool()
                .map(SettingChange::UsePing)
                .ok_or_else(|| Error::invalid_setting(key, format!("expected a boolean, got {value}"))),
            AssetKey::MinDepartureCount => value
                .as_u64()
                .and_then(|count| u32::try_from(count).ok())
                .map(SettingChange::MinDepartureCount)
                .ok_or_else(|| {
                    Error::invalid_setting(key, format!("expected a non-negative integer, got {value}"))
                }),
            AssetKey::RefreshFrequency => {
                let seconds = value.as_u64().ok_or_else(|| {
                    Error::invalid_setting(key, format!("expected a positive integer, got {value}"))
                })?;
                Self::refresh_frequency(seconds)
            }
            _ => Err(Error::invalid_setting(key, "not a setting")),
        }
    }

    pub fn arp_command(command: &str) -> Result<Self> {
        let command = command.trim();
        if command.is_empty() {
            return Err(Error::invalid_setting(AssetKey::ArpCommand, "command is empty"));
        }
        Ok(SettingChange::ArpCommand(command.to_string()))
    }

    pub fn refresh_frequency(seconds: u64) -> Result<Self> {
        if seconds == 0 {
            return Err(Error::invalid_setting(AssetKey::RefreshFrequency, "must be greater than zero"));
        }
        if seconds > MAX_REFRESH_FREQUENCY_SECONDS {
            return Err(Error::invalid_setting(
                AssetKey::RefreshFrequency,
                format!("must be at most {MAX_REFRESH_FREQUENCY_SECONDS}"),
            ));
        }
        Ok(SettingChange::RefreshFrequency(seconds))
    }

    pub fn key(&self) -> AssetKey {
        match self {
            SettingChange::ArpCommand(_) => AssetKey::ArpCommand,
            SettingChange::UsePing(_) => AssetKey::UsePing,
            SettingChange::MinDepartureCount(_) => AssetKey::MinDepartureCount,
            SettingChange::RefreshFrequency(_) => AssetKey::RefreshFrequency,
        }
    }

    pub fn value(&self) -> Value {
        match self {
            SettingChange::ArpCommand(command) => Value::from(command.as_str()),
            SettingChange::UsePing(enabled) => Value::from(*enabled),
            SettingChange::MinDepartureCount(count) => Value::from(*count),
            SettingChange::RefreshFrequency(seconds) => Value::from(*seconds),
        }
    }

    /// Returns true if the settings were actually modified.
    pub fn apply(&self, settings: &mut Settings) -> bool {
        match self {
            SettingChange::ArpCommand(command) if settings.arp_command != *command => {
                settings.arp_command = command.clone();
            }
            SettingChange::UsePing(enabled) if settings.use_ping != *enabled => {
                settings.use_ping = *enabled;
            }
            SettingChange::MinDepartureCount(count) if settings.min_departure_count != *count => {
                settings.min_departure_count = *count;
            }
            SettingChange::RefreshFrequency(seconds) if settings.refresh_frequency_seconds != *seconds => {
                settings.refresh_frequency_seconds = *seconds;
            }
            _ => return false,
        }
        true
    }
}

/// Decode an actuation payload. Anything that is not valid JSON is taken
/// as bare text, so `arp -a` works as well as `"arp -a"`.
pub fn decode_payload(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.trim().to_string()))
}
