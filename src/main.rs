//! `presence-rs` daemon entry point

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use log::{debug, error, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use presence_rs::mqtt::MqttClient;
use presence_rs::{AppConfig, CommandRunner as _, Manager, ShellRunner};

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(version, about = "Report device presence on the local network over MQTT")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run the discovery command once, print the visible devices as JSON and exit
    #[arg(long)]
    scan_once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone());
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&filters)
        .init();

    let config = AppConfig::load(&args.config)?;
    let settings = config.settings()?;
    let dialect = config.dialect();

    if args.scan_once {
        let output = ShellRunner.run(&settings.arp_command).await?;
        let table = presence_rs::parse(&output, dialect);
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    let addresses = config.tracked_addresses()?;
    debug!("Configured devices: {:?}", config.devices);

    let (mqtt_client, mut eventloop) = MqttClient::new(&config.mqtt);
    let (tx, rx) = broadcast::channel(32);
    let mqtt_cancel = CancellationToken::new();

    let mqtt_task = {
        let client = mqtt_client.clone();
        let cancel = mqtt_cancel.clone();
        tokio::spawn(async move { client.event_loop(&mut eventloop, tx, cancel).await })
    };

    if tokio::time::timeout(
        SUBSCRIBE_TIMEOUT,
        mqtt_client.wait_until_subscribed(config.mqtt.retained_settle()),
    )
    .await
    .is_err()
    {
        warn!("No subscription acknowledgement from MQTT broker, starting without persisted state");
    }

    let manager = Manager::new(Arc::new(mqtt_client.clone()), dialect, settings);
    manager.track_devices(addresses).await;
    manager.start().await;

    tokio::select! {
        _ = manager.run_loop(rx) => {
            warn!("Actuation loop ended");
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for shutdown signal")?;
            info!("Shutdown requested");
        }
    }

    manager.shutdown().await;

    if let Err(err) = mqtt_client.disconnect().await {
        error!("Error disconnecting from MQTT broker: {err}");
    }
    let abort = mqtt_task.abort_handle();
    if tokio::time::timeout(MQTT_SHUTDOWN_TIMEOUT, mqtt_task).await.is_err() {
        warn!("MQTT event loop did not stop in time");
        mqtt_cancel.cancel();
        abort.abort();
    }

    info!("Stopped");
    Ok(())
}
