//! Periodic ARP table scans

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cadence::wait_for_next_cycle;
use crate::error::{Error, Result};
use crate::messages::AssetKey;
use crate::parser::{self, ArpTable, Dialect};
use crate::reconciler::SeenSet;
use crate::registry::DeviceRegistry;
use crate::settings::Settings;
use crate::sink::{PresenceSink, announce_changes};

/// Runs the discovery command and hands back its full stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<String>;
}

/// Runs the command line through the platform shell.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<String> {
        let output = shell(command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn shell(command: &str) -> Command {
    let mut shell = if cfg!(windows) {
        let mut shell = Command::new("cmd");
        shell.arg("/C");
        shell
    } else {
        let mut shell = Command::new("sh");
        shell.arg("-c");
        shell
    };
    shell.arg(command);
    shell
}

/// Periodically reads the ARP table and feeds it to the reconciler.
pub struct Scanner {
    registry: Arc<DeviceRegistry>,
    sink: Arc<dyn PresenceSink>,
    runner: Arc<dyn CommandRunner>,
    dialect: Dialect,
    settings: watch::Receiver<Settings>,
}

impl Scanner {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        sink: Arc<dyn PresenceSink>,
        runner: Arc<dyn CommandRunner>,
        dialect: Dialect,
        settings: watch::Receiver<Settings>,
    ) -> Self {
        Scanner {
            registry,
            sink,
            runner,
            dialect,
            settings,
        }
    }

    /// Run the configured discovery command once and parse its output.
    pub async fn discover(&self) -> Result<ArpTable> {
        let command = self.settings.borrow().arp_command.clone();
        let output = self.runner.run(&command).await?;
        Ok(parser::parse(&output, self.dialect))
    }

    pub async fn publish_visible(&self, table: &ArpTable) -> Result<()> {
        let value = serde_json::to_value(table)?;
        self.sink.publish(AssetKey::VisibleDevices.as_str(), value).await
    }

    /// One scan: discover, reconcile, announce flips, publish the table.
    pub async fn scan_cycle(&self) {
        let result = self.discover().await;
        self.apply(result).await;
    }

    /// Feed one discovery result to the reconciler and the sink. Never raced
    /// against cancellation: every flip recorded in the registry gets published.
    async fn apply(&self, result: Result<ArpTable>) {
        let table = match result {
            Ok(table) => Some(table),
            Err(err) => {
                warn!("ARP scan failed, treating as nothing seen: {err}");
                None
            }
        };
        let seen = table.as_ref().map(SeenSet::from_table).unwrap_or_default();
        debug!("Scan saw {} devices", seen.len());

        let min_departure_count = self.settings.borrow().min_departure_count;
        let changes = self.registry.reconcile(&seen, min_departure_count);
        announce_changes(self.sink.as_ref(), &changes).await;

        if let Some(table) = table {
            if let Err(err) = self.publish_visible(&table).await {
                error!("Error publishing visible devices: {err}");
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Scan loop started");
        loop {
            let cycle_start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.discover() => result,
            };
            self.apply(result).await;
            if !wait_for_next_cycle("scan", cycle_start, &mut self.settings, &cancel).await {
                break;
            }
        }
        info!("Scan loop stopped");
    }
}
