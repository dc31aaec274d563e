//! Test doubles shared by the presence tracking contract tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mac_address::MacAddress;
use serde_json::Value;

use presence_rs::error::{Error, Result};
use presence_rs::{CommandRunner, PresenceSink, Prober, Settings, parse_mac};

pub const PHONE: &str = "aa:bb:cc:dd:ee:ff";
pub const PHONE_NAME: &str = "aabbccddeeff";
pub const PHONE_IP: &str = "192.168.1.10";

pub const LAPTOP: &str = "aa:bb:cc:dd:ee:01";
pub const LAPTOP_NAME: &str = "aabbccddee01";
pub const LAPTOP_IP: &str = "192.168.1.11";

pub fn mac(s: &str) -> MacAddress {
    parse_mac(s).unwrap()
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// `arp -a` style output listing the given (ip, mac) pairs as dynamic entries.
pub fn table_output(entries: &[(&str, &str)]) -> String {
    let mut output = String::from("Interface: 192.168.1.2 --- 0x4\n  Internet Address      Physical Address      Type\n");
    for (ip, mac) in entries {
        output.push_str(&format!("  {ip:<20}  {:<20}  dynamic\n", mac.replace(':', "-")));
    }
    output.push_str("  192.168.1.255         ff-ff-ff-ff-ff-ff     static\n");
    output
}

pub fn settings(min_departure_count: u32, refresh_frequency_seconds: u64) -> Settings {
    Settings {
        arp_command: "arp -a".to_string(),
        min_departure_count,
        refresh_frequency_seconds,
        use_ping: false,
        probe_timeout: Duration::from_millis(500),
    }
}

/// Sink that records everything published and echoes it back as persisted.
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(String, Value)>>,
    created: Mutex<Vec<String>>,
    persisted: Mutex<HashMap<String, Value>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sink that already holds `values`, as after a restart.
    pub fn with_persisted(values: impl IntoIterator<Item = (&'static str, Value)>) -> Arc<Self> {
        let sink = Self::default();
        sink.persisted
            .lock()
            .unwrap()
            .extend(values.into_iter().map(|(key, value)| (key.to_string(), value)));
        Arc::new(sink)
    }

    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().unwrap().clone()
    }

    /// Every value published under `key`, oldest first.
    pub fn values_for(&self, key: &str) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, value)| value.clone())
            .collect()
    }

    /// Presence flips announced for `name`, oldest first.
    pub fn presence_for(&self, name: &str) -> Vec<bool> {
        self.values_for(name)
            .into_iter()
            .filter_map(|value| value.as_bool())
            .collect()
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl PresenceSink for RecordingSink {
    async fn create_tracked_asset(&self, name: &str, _mac_address: MacAddress) -> Result<()> {
        self.created.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn persisted_value(&self, key: &str) -> Option<Value> {
        self.persisted.lock().unwrap().get(key).cloned()
    }

    async fn publish(&self, key: &str, value: Value) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((key.to_string(), value.clone()));
        self.persisted.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}

/// Command runner that plays back queued outputs, then repeats a fallback.
/// `None` entries simulate a command that exits with an error.
pub struct ScriptedRunner {
    queued: Mutex<VecDeque<Option<String>>>,
    fallback: Mutex<Option<String>>,
    commands: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new(queued: impl IntoIterator<Item = Option<String>>, fallback: Option<String>) -> Arc<Self> {
        Arc::new(ScriptedRunner {
            queued: Mutex::new(queued.into_iter().collect()),
            fallback: Mutex::new(fallback),
            commands: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Runner that always returns the same output.
    pub fn always(output: String) -> Arc<Self> {
        Self::new([], Some(output))
    }

    pub fn set_fallback(&self, fallback: Option<String>) {
        *self.fallback.lock().unwrap() = fallback;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().unwrap().push(command.to_string());
        let next = self
            .queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone());
        next.ok_or_else(|| Error::CommandFailed {
            command: command.to_string(),
            status: "exit status: 1".to_string(),
        })
    }
}

/// Prober that answers for a configurable set of addresses.
#[derive(Default)]
pub struct ScriptedProber {
    reachable: Mutex<HashSet<IpAddr>>,
    calls: AtomicUsize,
}

impl ScriptedProber {
    pub fn new(reachable: impl IntoIterator<Item = IpAddr>) -> Arc<Self> {
        Arc::new(ScriptedProber {
            reachable: Mutex::new(reachable.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_reachable(&self, address: IpAddr, reachable: bool) {
        let mut set = self.reachable.lock().unwrap();
        if reachable {
            set.insert(address);
        } else {
            set.remove(&address);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, address: IpAddr, _timeout: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reachable.lock().unwrap().contains(&address)
    }
}

/// Manager wired to test doubles, using the `arp -a` table dialect.
pub fn manager(
    sink: &Arc<RecordingSink>,
    runner: &Arc<ScriptedRunner>,
    prober: &Arc<ScriptedProber>,
    settings: Settings,
) -> presence_rs::Manager {
    presence_rs::Manager::new(sink.clone(), presence_rs::Dialect::Table, settings)
        .with_runner(runner.clone())
        .with_prober(prober.clone())
}
