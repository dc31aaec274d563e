//! Parsing of ARP table output into a hardware to network address map

use std::collections::HashMap;

use log::trace;
use serde_derive::Deserialize;

/// Lower-cased hardware address → network address, as printed by the command.
pub type ArpTable = HashMap<String, String>;

/// Output format of the discovery command. Chosen by configuration, never
/// sniffed from the output itself.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `arp -a` style: `<ip> <mac> <type>`, only `dynamic` rows count.
    Table,
    /// `arp-scan -l -q` style: two header lines, three footer lines.
    Scan,
}

impl Dialect {
    pub fn for_platform() -> Self {
        if cfg!(windows) {
            Dialect::Table
        } else {
            Dialect::Scan
        }
    }

    pub fn default_command(&self) -> &'static str {
        match self {
            Dialect::Table => "arp -a",
            Dialect::Scan => "sudo arp-scan -l -q",
        }
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::for_platform()
    }
}

const SCAN_HEADER_LINES: usize = 2;
const SCAN_FOOTER_LINES: usize = 3;

/// Parse the full stdout of one discovery command run.
///
/// Malformed lines are skipped. If the same hardware address shows up more
/// than once the last line wins.
pub fn parse(output: &str, dialect: Dialect) -> ArpTable {
    match dialect {
        Dialect::Table => parse_table(output),
        Dialect::Scan => parse_scan(output),
    }
}

fn parse_table(output: &str) -> ArpTable {
    let mut found = ArpTable::new();
    for line in output.lines() {
        if let [ip, mac, kind] = line.split_whitespace().collect::<Vec<_>>()[..] {
            if kind != "dynamic" {
                trace!("Skipping non-dynamic entry: {line}");
                continue;
            }
            found.insert(mac.replace('-', ":").to_lowercase(), ip.to_string());
        }
    }
    found
}

fn parse_scan(output: &str) -> ArpTable {
    let lines: Vec<&str> = output.lines().collect();
    let mut found = ArpTable::new();
    if lines.len() <= SCAN_HEADER_LINES + SCAN_FOOTER_LINES {
        return found;
    }

    for line in &lines[SCAN_HEADER_LINES..lines.len() - SCAN_FOOTER_LINES] {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(ip), Some(mac)) => {
                found.insert(mac.to_lowercase(), ip.to_string());
            }
            _ => trace!("Skipping short line: {line:?}"),
        }
    }
    found
}
