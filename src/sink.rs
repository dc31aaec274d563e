//! Downstream collaborator that receives presence state

use async_trait::async_trait;
use log::error;
use mac_address::MacAddress;
use serde_json::Value;

use crate::error::Result;
use crate::messages::PresenceChange;

/// Downstream collaborator that owns assets and their persisted values.
///
/// Presence booleans are published under the device's display name; the
/// visible-device table and configuration echoes under their asset keys.
#[async_trait]
pub trait PresenceSink: Send + Sync {
    /// Register a boolean presence asset for a tracked hardware address.
    async fn create_tracked_asset(&self, name: &str, mac_address: MacAddress) -> Result<()>;

    /// Last value known for `key`, if any.
    fn persisted_value(&self, key: &str) -> Option<Value>;

    async fn publish(&self, key: &str, value: Value) -> Result<()>;
}

/// Publish each presence flip. Failures are logged, never propagated.
pub async fn announce_changes(sink: &dyn PresenceSink, changes: &[PresenceChange]) {
    for change in changes {
        if let Err(err) = sink.publish(&change.name, Value::Bool(change.present)).await {
            error!("Error announcing {} ({}): {err}", change.name, change.mac_address);
        }
    }
}
