//! Direct reachability probing of devices with a known network address

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, info, trace};
use mac_address::MacAddress;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cadence::wait_for_next_cycle;
use crate::reconciler::SeenSet;
use crate::registry::DeviceRegistry;
use crate::settings::Settings;
use crate::sink::{PresenceSink, announce_changes};

#[async_trait]
pub trait Prober: Send + Sync {
    /// True if `address` answered within `timeout`. Errors count as no answer.
    async fn probe(&self, address: IpAddr, timeout: Duration) -> bool;
}

/// Single ICMP echo through the system `ping`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingProber;

#[async_trait]
impl Prober for PingProber {
    async fn probe(&self, address: IpAddr, timeout: Duration) -> bool {
        let mut ping = ping_command(address, timeout);
        match tokio::time::timeout(timeout, ping.kill_on_drop(true).output()).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(err)) => {
                debug!("Failed to run ping for {address}: {err}");
                false
            }
            Err(_) => {
                trace!("Ping of {address} timed out after {timeout:?}");
                false
            }
        }
    }
}

fn ping_command(address: IpAddr, timeout: Duration) -> Command {
    let mut ping = Command::new("ping");
    if cfg!(windows) {
        ping.args(["-n", "1", "-w", &timeout.as_millis().to_string()]);
    } else {
        // -W takes whole seconds; the outer timeout enforces the real bound.
        ping.args(["-c", "1", "-W", "1"]);
    }
    ping.arg(address.to_string());
    ping
}

/// Probes every tracked device that has a known address.
pub struct ProbeSource {
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn PresenceSink>,
    prober: Arc<dyn Prober>,
    settings: watch::Receiver<Settings>,
}

impl ProbeSource {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn PresenceSink>,
        prober: Arc<dyn Prober>,
        settings: watch::Receiver<Settings>,
    ) -> Self {
        ProbeSource {
            registry,
            sink,
            prober,
            settings,
        }
    }

    /// Probe a snapshot of the registry; the lock is not held while waiting.
    pub async fn sweep(&self) -> SeenSet {
        let targets: Vec<(MacAddress, IpAddr)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|device| device.network_address.map(|ip| (device.mac_address, ip)))
            .collect();
        let timeout = self.settings.borrow().probe_timeout;

        let answers = join_all(targets.iter().map(|&(mac_address, ip)| async move {
            (mac_address, ip, self.prober.probe(ip, timeout).await)
        }))
        .await;

        let responded = answers
            .into_iter()
            .filter(|(_, _, answered)| *answered)
            .map(|(mac_address, ip, _)| (mac_address, ip));
        SeenSet::probed(targets.iter().map(|(mac_address, _)| *mac_address), responded)
    }

    pub async fn probe_cycle(&self) {
        let seen = self.sweep().await;
        self.apply(seen).await;
    }

    /// Reconcile one sweep and announce the flips. Never raced against
    /// cancellation: every flip recorded in the registry gets published.
    async fn apply(&self, seen: SeenSet) {
        debug!("Probe sweep got {} answers", seen.len());

        let min_departure_count = self.settings.borrow().min_departure_count;
        let changes = self.registry.reconcile(&seen, min_departure_count);
        announce_changes(self.sink.as_ref(), &changes).await;
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Probe loop started");
        loop {
            let cycle_start = Instant::now();
            let seen = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                seen = self.sweep() => seen,
            };
            self.apply(seen).await;
            if !wait_for_next_cycle("probe", cycle_start, &mut self.settings, &cancel).await {
                break;
            }
        }
        info!("Probe loop stopped");
    }
}
