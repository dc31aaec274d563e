//! MQTT transport for presence state and actuations

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use mac_address::MacAddress;
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use serde_derive::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::error::{Error, Result};
use crate::messages::{Actuation, AssetKey};
use crate::registry::normalize;
use crate::sink::PresenceSink;

const SET_SUFFIX: &str = "/set";
const ASSET_SUFFIX: &str = "/config";

#[derive(Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    base_topic: String,
    /// Last value seen on each state topic, keyed by asset name.
    retained: Arc<Mutex<HashMap<String, Value>>>,
    subscribed: Arc<watch::Sender<bool>>,
}

#[derive(Debug, Serialize)]
struct AssetDescriptor<'a> {
    name: &'a str,
    #[serde(rename = "id")]
    mac_address: String,
    kind: &'static str,
    description: &'static str,
}

/// What an incoming topic refers to, relative to our base topic.
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Actuation(&'a str),
    State(&'a str),
    Other,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "presence-rs".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);
        let topic_path = config.topic_path.as_deref().unwrap_or("presence");
        let (subscribed, _) = watch::channel(false);

        (
            MqttClient {
                client,
                base_topic: format!("{}/{}", topic_path, sanitize_name(&publisher_id)),
                retained: Arc::new(Mutex::new(HashMap::new())),
                subscribed: Arc::new(subscribed),
            },
            eventloop,
        )
    }

    fn state_topic(&self, key: &str) -> String {
        format!("{}/{}", self.base_topic, key)
    }

    fn asset_topic(&self, name: &str) -> String {
        format!("{}/{}{}", self.base_topic, name, ASSET_SUFFIX)
    }

    fn route<'a>(&self, topic: &'a str) -> Route<'a> {
        let Some(rest) = topic
            .strip_prefix(self.base_topic.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return Route::Other;
        };
        if let Some(key) = rest.strip_suffix(SET_SUFFIX) {
            if !key.contains('/') {
                return Route::Actuation(key);
            }
        }
        if rest.contains('/') {
            Route::Other
        } else {
            Route::State(rest)
        }
    }

    fn subscribe(&self) -> std::result::Result<(), rumqttc::ClientError> {
        // Called from inside the event loop, so it must not wait on the
        // request queue that loop is draining.
        self.client.try_subscribe_many(vec![
            SubscribeFilter::new(format!("{}/+{}", self.base_topic, SET_SUFFIX), QoS::AtLeastOnce),
            SubscribeFilter::new(format!("{}/+", self.base_topic), QoS::AtLeastOnce),
        ])
    }

    /// Wait until the broker has acknowledged our subscriptions, then give
    /// it `settle` to replay retained state.
    pub async fn wait_until_subscribed(&self, settle: Duration) {
        let mut subscribed = self.subscribed.subscribe();
        if subscribed.wait_for(|ready| *ready).await.is_ok() {
            tokio::time::sleep(settle).await;
        }
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<Actuation>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        let payload = String::from_utf8_lossy(&p.payload);
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, payload);
                        self.handle_message(&p.topic, &payload, &tx);
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                        self.subscribed.send_replace(true);
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        info!("Connected to MQTT broker");
                        if let Err(err) = self.subscribe() {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        debug!("Disconnect sent");
                        break;
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        debug!("MQTT event loop exiting");
    }

    fn handle_message(&self, topic: &str, payload: &str, tx: &broadcast::Sender<Actuation>) {
        match self.route(topic) {
            Route::Actuation(key) => match key.parse::<AssetKey>() {
                Ok(key) if key.is_actuator() => {
                    let actuation = Actuation {
                        key,
                        payload: payload.to_string(),
                    };
                    if let Err(err) = tx.send(actuation) {
                        error!("Error forwarding actuation: {:?}", err);
                    }
                }
                _ => warn!("unknown actuator: {key}"),
            },
            Route::State(key) => match serde_json::from_str::<Value>(payload) {
                Ok(value) => {
                    self.retained_cache().insert(key.to_string(), value);
                }
                Err(_) => debug!("Ignoring non-JSON state on {topic}"),
            },
            Route::Other => {}
        }
    }

    fn retained_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.retained.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn publish_json(&self, topic: String, value: &Value) -> Result<()> {
        let payload = serde_json::to_string(value)?;
        self.client
            .publish(topic.clone(), QoS::AtLeastOnce, true, payload)
            .await
            .map_err(|err| Error::publish(topic, err))
    }

    pub async fn disconnect(&self) -> std::result::Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

#[async_trait]
impl PresenceSink for MqttClient {
    async fn create_tracked_asset(&self, name: &str, mac_address: MacAddress) -> Result<()> {
        info!("Creating presence asset {name} on MQTT");
        let descriptor = AssetDescriptor {
            name,
            mac_address: normalize(&mac_address),
            kind: "boolean",
            description: "presence of device",
        };
        let value = serde_json::to_value(&descriptor)?;
        self.publish_json(self.asset_topic(name), &value).await
    }

    fn persisted_value(&self, key: &str) -> Option<Value> {
        self.retained_cache().get(key).cloned()
    }

    async fn publish(&self, key: &str, value: Value) -> Result<()> {
        debug!("Publishing {key} = {value}");
        self.publish_json(self.state_topic(key), &value).await?;
        self.retained_cache().insert(key.to_string(), value);
        Ok(())
    }
}

fn sanitize_name(name: &str) -> String {
    // Topic segment: lower-case, only alphanumerics and `-` survive
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect::<String>()
}
