// CDP/LLDP neighbor collection
//
// Runs the per-platform neighbor commands over an established session,
// parses the output through the template engine, and turns the records into
// per-peer claims with normalized interface pairs. A table that fails to
// parse leaves that protocol empty; the device itself is kept.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crawler::CancelFlag;
use crate::error::Result;
use crate::normalize::{normalize_pair, Platform};
use crate::template::{field, Record, TemplateEngine, TRUSTED_SCORE};
use crate::transport::{DeviceSession, IDLE_TIMEOUT, READ_TIMEOUT};

/// Neighbor discovery protocol a claim came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Cdp,
    Lldp,
}

/// Peer identifiers that are really table headers or CLI noise
const JUNK_IDS: &[&str] = &["show", "invalid", "total", "entry", "device", "system"];

/// One peer as seen from a single device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeerRecord {
    pub ip: String,
    pub platform: String,
    pub connections: Vec<(String, String)>,
}

/// Collector output for a single device
#[derive(Debug, Clone, Default, Serialize)]
pub struct NeighborTable {
    pub cdp: BTreeMap<String, PeerRecord>,
    pub lldp: BTreeMap<String, PeerRecord>,
}

impl NeighborTable {
    pub fn is_empty(&self) -> bool {
        self.cdp.is_empty() && self.lldp.is_empty()
    }
}

pub struct NeighborCollector<'a> {
    engine: &'a TemplateEngine,
    cancel: &'a CancelFlag,
}

impl<'a> NeighborCollector<'a> {
    pub fn new(engine: &'a TemplateEngine, cancel: &'a CancelFlag) -> NeighborCollector<'a> {
        NeighborCollector { engine, cancel }
    }

    pub fn collect(
        &self,
        session: &mut dyn DeviceSession,
        host: &str,
        prompt: &str,
        platform: Platform,
    ) -> Result<NeighborTable> {
        let mut table = NeighborTable::default();

        match platform {
            Platform::Ios | Platform::NxosSsh => {
                self.cancel.check()?;
                table.cdp = self.run_and_parse(
                    session,
                    host,
                    prompt,
                    "show cdp neighbors detail",
                    "show_cdp_neighbors_detail",
                    Protocol::Cdp,
                    platform,
                )?;
                self.cancel.check()?;
                let lldp_filter = match platform {
                    Platform::NxosSsh => "cisco_nxos_show_lldp_neighbors_detail",
                    _ => "cisco_ios_show_lldp_neighbors_detail",
                };
                table.lldp = self.run_and_parse(
                    session,
                    host,
                    prompt,
                    "show lldp neighbors detail",
                    lldp_filter,
                    Protocol::Lldp,
                    platform,
                )?;
            }
            Platform::Eos => {
                self.cancel.check()?;
                table.lldp = self.run_and_parse(
                    session,
                    host,
                    prompt,
                    "show lldp neighbors detail",
                    "arista_eos_show_lldp_neighbors_detail",
                    Protocol::Lldp,
                    platform,
                )?;
            }
            Platform::Junos => {
                self.cancel.check()?;
                table.lldp = self.run_and_parse(
                    session,
                    host,
                    prompt,
                    "show lldp neighbors detail",
                    "juniper_junos_show_lldp_neighbors_detail",
                    Protocol::Lldp,
                    platform,
                )?;
            }
            Platform::Procurve => {
                self.cancel.check()?;
                table.lldp = self.run_and_parse(
                    session,
                    host,
                    prompt,
                    "show lldp info remote-device detail",
                    "hp_procurve_show_lldp_info_remote_detail",
                    Protocol::Lldp,
                    platform,
                )?;
            }
            // Unknown devices are never used as a neighbor source
            Platform::Unknown => {}
        }

        info!(
            host,
            cdp = table.cdp.len(),
            lldp = table.lldp.len(),
            "neighbor collection finished"
        );
        Ok(table)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_and_parse(
        &self,
        session: &mut dyn DeviceSession,
        host: &str,
        prompt: &str,
        command: &str,
        filter: &str,
        protocol: Protocol,
        local_platform: Platform,
    ) -> Result<BTreeMap<String, PeerRecord>> {
        session.send_line(command)?;
        let output = session.read_until_idle(prompt, READ_TIMEOUT, IDLE_TIMEOUT)?;

        let Some(best) = self.engine.find_best_template(&output, Some(filter)) else {
            warn!(host, command, "no template scored on neighbor output");
            return Ok(BTreeMap::new());
        };
        if best.score <= TRUSTED_SCORE {
            warn!(
                host,
                command,
                template = %best.template,
                score = best.score,
                "neighbor parse below trust threshold"
            );
            return Ok(BTreeMap::new());
        }
        debug!(host, template = %best.template, score = best.score, "neighbor template");
        Ok(peer_records(&best.records, protocol, local_platform))
    }
}

/// Convert parsed records into the per-peer claim map
fn peer_records(
    records: &[Record],
    protocol: Protocol,
    local_platform: Platform,
) -> BTreeMap<String, PeerRecord> {
    let mut peers: BTreeMap<String, PeerRecord> = BTreeMap::new();

    for record in records {
        let Some(peer_id) = peer_identifier(record) else {
            continue;
        };

        let ip = peer_ip(record);
        let hint = peer_platform_hint(record, protocol);
        let hint_label = match hint {
            Platform::Unknown => String::new(),
            p => p.as_str().to_string(),
        };

        let local = field(record, "LOCAL_INTERFACE").trim();
        let remote_raw = {
            let ni = field(record, "NEIGHBOR_INTERFACE");
            if !ni.is_empty() {
                ni
            } else {
                let pid = field(record, "NEIGHBOR_PORT_ID");
                if !pid.is_empty() {
                    pid
                } else {
                    field(record, "PORT_ID")
                }
            }
        }
        .trim();

        let entry = peers.entry(peer_id).or_default();
        if entry.ip.is_empty() {
            entry.ip = ip;
        }
        if entry.platform.is_empty() {
            entry.platform = hint_label;
        }
        if !local.is_empty() && !remote_raw.is_empty() {
            let pair = normalize_pair(local, remote_raw, Some(local_platform), Some(hint));
            if !entry.connections.contains(&pair) {
                entry.connections.push(pair);
            }
        }
    }
    peers
}

/// Identifier precedence: first label of NEIGHBOR_NAME, else CHASSIS_ID with
/// separators stripped and lowercased. Junk and single-character ids drop
/// the record.
fn peer_identifier(record: &Record) -> Option<String> {
    let mut id = field(record, "NEIGHBOR_NAME")
        .split('.')
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    if id.is_empty() {
        id = field(record, "CHASSIS_ID")
            .chars()
            .filter(|c| !matches!(c, ':' | '.') && !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
    }
    if id.len() <= 1 {
        return None;
    }
    let lower = id.to_lowercase();
    if JUNK_IDS.contains(&lower.as_str()) {
        return None;
    }
    if !id.chars().any(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(id)
}

/// IP precedence: MGMT_ADDRESS, INTERFACE_IP, MANAGEMENT_IP. Link-local
/// IPv6 is never stored but does not disqualify the record.
fn peer_ip(record: &Record) -> String {
    for key in ["MGMT_ADDRESS", "INTERFACE_IP", "MANAGEMENT_IP"] {
        let value = field(record, key).trim();
        if value.is_empty() {
            continue;
        }
        if value.to_lowercase().starts_with("fe80:") {
            continue;
        }
        return value.to_string();
    }
    String::new()
}

/// Map PLATFORM / NEIGHBOR_DESCRIPTION substrings to a platform hint
pub fn platform_from_description(description: &str) -> Platform {
    let d = description.to_lowercase();
    if d.contains("arista") || d.contains("eos") {
        Platform::Eos
    } else if d.contains("nx-os") || d.contains("nexus") {
        Platform::NxosSsh
    } else if d.contains("cisco") || d.contains("ios") {
        Platform::Ios
    } else if d.contains("junos") || d.contains("juniper") {
        Platform::Junos
    } else if d.contains("aruba") || d.contains("hp") || d.contains("procurve") {
        Platform::Procurve
    } else {
        Platform::Unknown
    }
}

fn peer_platform_hint(record: &Record, protocol: Protocol) -> Platform {
    let (primary, secondary) = match protocol {
        Protocol::Cdp => ("PLATFORM", "NEIGHBOR_DESCRIPTION"),
        Protocol::Lldp => ("NEIGHBOR_DESCRIPTION", "PLATFORM"),
    };
    let source = {
        let p = field(record, primary);
        if p.is_empty() {
            field(record, secondary)
        } else {
            p
        }
    };
    if source.is_empty() {
        Platform::Unknown
    } else {
        platform_from_description(source)
    }
}
