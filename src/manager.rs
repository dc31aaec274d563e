//! Supervision of the discovery loops and runtime reconfiguration

use std::sync::Arc;

use log::{debug, error, info, warn};
use mac_address::MacAddress;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::messages::{Actuation, AssetKey};
use crate::parser::{ArpTable, Dialect};
use crate::probe::{PingProber, ProbeSource, Prober};
use crate::registry::{DeviceRegistry, display_name, normalize, parse_mac};
use crate::scanner::{CommandRunner, Scanner, ShellRunner};
use crate::settings::{SettingChange, Settings, decode_payload};
use crate::sink::PresenceSink;

/// Settings read back from the sink on startup.
const PERSISTED_SETTINGS: [AssetKey; 4] = [
    AssetKey::ArpCommand,
    AssetKey::UsePing,
    AssetKey::MinDepartureCount,
    AssetKey::RefreshFrequency,
];

struct ProbeTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the registry and the discovery loops, and applies reconfiguration
/// while they run.
pub struct Manager {
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn PresenceSink>,
    runner: Arc<dyn CommandRunner>,
    prober: Arc<dyn Prober>,
    dialect: Dialect,
    settings: watch::Sender<Settings>,
    cancel: CancellationToken,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    probe_task: Mutex<Option<ProbeTask>>,
}

impl Manager {
    pub fn new(sink: Arc<dyn PresenceSink>, dialect: Dialect, settings: Settings) -> Self {
        let (settings, _) = watch::channel(settings);
        Manager {
            registry: Arc::new(DeviceRegistry::new()),
            sink,
            runner: Arc::new(ShellRunner),
            prober: Arc::new(PingProber),
            dialect,
            settings,
            cancel: CancellationToken::new(),
            scan_task: Mutex::new(None),
            probe_task: Mutex::new(None),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn Prober>) -> Self {
        self.prober = prober;
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> Settings {
        self.settings.borrow().clone()
    }

    fn scanner(&self) -> Scanner {
        Scanner::new(
            self.registry.clone(),
            self.sink.clone(),
            self.runner.clone(),
            self.dialect,
            self.settings.subscribe(),
        )
    }

    /// Apply persisted settings, load the persisted tracked list and start
    /// the discovery loops.
    pub async fn start(&self) {
        self.load_persisted_settings();

        if let Some(value) = self.sink.persisted_value(AssetKey::TrackedDevices.as_str()) {
            match parse_addresses(&value) {
                Ok(addresses) => {
                    self.track_devices(addresses).await;
                }
                Err(err) => warn!("Ignoring persisted tracked devices: {err}"),
            }
        }

        let mut scan_task = self.scan_task.lock().await;
        if scan_task.is_none() {
            info!(
                "Starting presence tracking for {} devices every {}s",
                self.registry.len(),
                self.settings.borrow().refresh_frequency_seconds
            );
            let scanner = self.scanner();
            let cancel = self.cancel.clone();
            *scan_task = Some(tokio::spawn(scanner.run(cancel)));
        }
        drop(scan_task);

        let use_ping = self.settings.borrow().use_ping;
        if use_ping {
            self.enable_probing().await;
        }
    }

    fn load_persisted_settings(&self) {
        for key in PERSISTED_SETTINGS {
            let Some(value) = self.sink.persisted_value(key.as_str()) else {
                continue;
            };
            match SettingChange::parse(key, &value) {
                Ok(change) => {
                    debug!("Restoring {key} = {value}");
                    self.settings.send_if_modified(|settings| change.apply(settings));
                }
                Err(err) => warn!("Ignoring persisted setting: {err}"),
            }
        }
    }

    /// Add devices to the registry. Already-tracked addresses are left alone.
    /// Returns the newly tracked addresses.
    pub async fn track_devices(&self, addresses: impl IntoIterator<Item = MacAddress>) -> Vec<MacAddress> {
        let mut added = Vec::new();
        for mac_address in addresses {
            if self.registry.contains(&mac_address) {
                continue;
            }
            let name = display_name(&mac_address);
            let present = self.sink.persisted_value(&name) == Some(Value::Bool(true));
            if !self.registry.track(mac_address, present) {
                continue;
            }
            info!("Tracking {name} ({mac_address})");
            if let Err(err) = self.sink.create_tracked_asset(&name, mac_address).await {
                error!("Error creating asset for {name}: {err}");
            }
            added.push(mac_address);
        }
        added
    }

    async fn handle_tracked_devices(&self, value: &Value) -> Result<()> {
        let addresses = parse_addresses(value)?;
        let added = self.track_devices(addresses).await;
        debug!("{} new devices tracked", added.len());

        let tracked: Vec<String> = self.registry.addresses().iter().map(normalize).collect();
        self.sink
            .publish(AssetKey::TrackedDevices.as_str(), Value::from(tracked))
            .await
    }

    /// Run the discovery command now and republish the visible devices.
    /// Does not count as a reconciliation cycle.
    pub async fn refresh_visible_devices(&self) -> Result<ArpTable> {
        let scanner = self.scanner();
        let table = scanner.discover().await?;
        scanner.publish_visible(&table).await?;
        Ok(table)
    }

    /// Apply a validated setting, echo it to the sink and adjust the probe
    /// loop if needed.
    pub async fn apply_setting(&self, change: SettingChange) -> Result<()> {
        let key = change.key();
        let value = change.value();
        if self.settings.send_if_modified(|settings| change.apply(settings)) {
            info!("{key} set to {value}");
        }

        if let SettingChange::UsePing(enabled) = change {
            if enabled {
                self.enable_probing().await;
            } else {
                self.disable_probing().await;
            }
        }

        self.sink.publish(key.as_str(), value).await
    }

    async fn handle_setting(&self, key: AssetKey, value: &Value) -> Result<()> {
        let change = SettingChange::parse(key, value)?;
        self.apply_setting(change).await
    }

    pub async fn set_arp_command(&self, command: &str) -> Result<()> {
        self.apply_setting(SettingChange::arp_command(command)?).await
    }

    pub async fn set_min_departure_count(&self, count: u32) -> Result<()> {
        self.apply_setting(SettingChange::MinDepartureCount(count)).await
    }

    pub async fn set_refresh_frequency(&self, seconds: u64) -> Result<()> {
        self.apply_setting(SettingChange::refresh_frequency(seconds)?).await
    }

    pub async fn set_use_ping(&self, enabled: bool) -> Result<()> {
        self.apply_setting(SettingChange::UsePing(enabled)).await
    }

    /// Handle one inbound actuation. Invalid input is logged and dropped.
    pub async fn handle_actuation(&self, actuation: &Actuation) {
        debug!("Actuation {} = {:?}", actuation.key, actuation.payload);
        let value = decode_payload(&actuation.payload);
        let result = match actuation.key {
            AssetKey::TrackedDevices => self.handle_tracked_devices(&value).await,
            AssetKey::RefreshVisibleDevices => self.refresh_visible_devices().await.map(|_| ()),
            AssetKey::VisibleDevices => {
                warn!("{} is read-only", actuation.key);
                Ok(())
            }
            key => self.handle_setting(key, &value).await,
        };

        if let Err(err) = result {
            warn!("Rejected {}: {err}", actuation.key);
        }
    }

    /// Start the probe loop. Does nothing if it is already running.
    pub async fn enable_probing(&self) {
        let mut probe_task = self.probe_task.lock().await;
        if probe_task.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        info!("Enabling reachability probing");
        let cancel = self.cancel.child_token();
        let source = ProbeSource::new(
            self.registry.clone(),
            self.sink.clone(),
            self.prober.clone(),
            self.settings.subscribe(),
        );
        let handle = tokio::spawn(source.run(cancel.clone()));
        *probe_task = Some(ProbeTask { cancel, handle });
    }

    /// Stop the probe loop and wait for it to exit.
    pub async fn disable_probing(&self) {
        let Some(task) = self.probe_task.lock().await.take() else {
            return;
        };
        info!("Disabling reachability probing");
        task.cancel.cancel();
        if let Err(err) = task.handle.await {
            error!("Probe loop ended abnormally: {err}");
        }
    }

    pub async fn is_probing(&self) -> bool {
        self.probe_task
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Process actuations until the channel closes or shutdown starts.
    pub async fn run_loop(&self, mut actuations: broadcast::Receiver<Actuation>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                msg = actuations.recv() => match msg {
                    Ok(actuation) => self.handle_actuation(&actuation).await,
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Actuation channel closed");
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Dropped {missed} actuations");
                    }
                },
            }
        }
    }

    /// Stop both loops and wait for them to finish.
    pub async fn shutdown(&self) {
        info!("Stopping presence tracking");
        self.cancel.cancel();
        self.disable_probing().await;
        let Some(handle) = self.scan_task.lock().await.take() else {
            return;
        };
        if let Err(err) = handle.await {
            error!("Scan loop ended abnormally: {err}");
        }
    }
}

fn parse_addresses(value: &Value) -> Result<Vec<MacAddress>> {
    let items = value.as_array().ok_or_else(|| {
        Error::invalid_setting(AssetKey::TrackedDevices, format!("expected an array, got {value}"))
    })?;

    let mut addresses = Vec::with_capacity(items.len());
    for item in items {
        let parsed = item
            .as_str()
            .ok_or_else(|| Error::InvalidMac(item.to_string()))
            .and_then(parse_mac);
        match parsed {
            Ok(mac_address) => addresses.push(mac_address),
            Err(err) => warn!("Skipping tracked device: {err}"),
        }
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_addresses_skips_invalid_entries() {
        let value = json!(["AA:BB:CC:DD:EE:FF", "nonsense", 42, "aa-bb-cc-dd-ee-01"]);
        let addresses = parse_addresses(&value).unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(normalize(&addresses[0]), "aa:bb:cc:dd:ee:ff");
        assert_eq!(normalize(&addresses[1]), "aa:bb:cc:dd:ee:01");
    }

    #[test]
    fn test_parse_addresses_requires_array() {
        assert!(matches!(
            parse_addresses(&json!("aa:bb:cc:dd:ee:ff")),
            Err(Error::InvalidSetting {
                key: AssetKey::TrackedDevices,
                ..
            })
        ));
    }
}
