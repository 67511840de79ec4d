// Topology assembly
//
// Pure transformation from the crawler's accumulated device records to the
// final adjacency map: canonicalize hostnames, merge duplicates, keep only
// bidirectionally confirmed links between discovered devices, synthesize
// leaf entries for peers that were never crawled, and enrich peer platform
// labels from the top-level records.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crawler::Device;
use crate::normalize::normalize_interface;

/// Reduce a hostname to its canonical form: first dot label, first
/// whitespace token, trimmed and lowercased
pub fn canonical_hostname(name: &str) -> String {
    name.split('.')
        .next()
        .unwrap_or("")
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDetails {
    pub ip: String,
    pub platform: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub ip: String,
    pub platform: String,
    pub connections: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologyNode {
    pub node_details: NodeDetails,
    pub peers: BTreeMap<String, PeerInfo>,
}

/// Final adjacency map keyed by canonical hostname
pub type TopologyMap = BTreeMap<String, TopologyNode>;

#[derive(Debug)]
pub struct AssembledTopology {
    pub map: TopologyMap,
    pub dropped_links: usize,
}

/// Assemble the final map from crawler output. Pure function of its inputs:
/// running it twice over the same device list yields an identical map.
pub fn assemble(devices: &[Device], exclude: &[String]) -> AssembledTopology {
    let transformed = transform(devices);
    let mut map = merge_canonical(transformed);
    let dropped_links = confirm_links(&mut map, devices);
    synthesize_leaves(&mut map, exclude);
    enrich_peers(&mut map);
    if dropped_links > 0 {
        info!(dropped_links, "dropped unconfirmed links");
    }
    AssembledTopology { map, dropped_links }
}

fn field_missing(value: &str) -> bool {
    value.is_empty() || value == "unknown"
}

/// Step 1: flatten Device records into map nodes, interfaces normalized and
/// one connection entry per local port per peer
fn transform(devices: &[Device]) -> BTreeMap<String, TopologyNode> {
    let mut out = BTreeMap::new();
    for device in devices {
        let mut node = TopologyNode {
            node_details: NodeDetails {
                ip: device.ip.clone(),
                platform: device.platform.clone(),
            },
            peers: BTreeMap::new(),
        };
        for (peer_id, connections) in &device.connections {
            let mut info = PeerInfo::default();
            let mut used_locals: HashSet<String> = HashSet::new();
            for conn in connections {
                if info.ip.is_empty() {
                    if let Some(ip) = &conn.neighbor_ip {
                        info.ip = ip.clone();
                    }
                }
                if field_missing(&info.platform) {
                    if let Some(platform) = &conn.neighbor_platform {
                        if !field_missing(platform) {
                            info.platform = platform.clone();
                        }
                    }
                }
                let local = normalize_interface(&conn.local_port, None);
                let remote = normalize_interface(&conn.remote_port, None);
                if local.is_empty() || remote.is_empty() {
                    continue;
                }
                if used_locals.contains(&local) {
                    continue;
                }
                used_locals.insert(local.clone());
                info.connections.push((local, remote));
            }
            node.peers.insert(peer_id.clone(), info);
        }
        out.insert(device.hostname.clone(), node);
    }
    out
}

/// Step 2: fold nodes and peers onto canonical hostnames
fn merge_canonical(transformed: BTreeMap<String, TopologyNode>) -> TopologyMap {
    let mut map = TopologyMap::new();
    for (original, node) in transformed {
        let canon = canonical_hostname(&original);
        if canon.is_empty() {
            continue;
        }
        let entry = map.entry(canon).or_default();
        merge_details(&mut entry.node_details, &node.node_details);
        for (peer_original, peer) in node.peers {
            let peer_canon = canonical_hostname(&peer_original);
            if peer_canon.is_empty() {
                continue;
            }
            let merged = entry.peers.entry(peer_canon).or_default();
            if field_missing(&merged.ip) && !peer.ip.is_empty() {
                merged.ip = peer.ip.clone();
            }
            if field_missing(&merged.platform) && !field_missing(&peer.platform) {
                merged.platform = peer.platform.clone();
            }
            let mut used_locals: HashSet<String> =
                merged.connections.iter().map(|(l, _)| l.clone()).collect();
            for pair in peer.connections {
                if used_locals.contains(&pair.0) {
                    continue;
                }
                used_locals.insert(pair.0.clone());
                merged.connections.push(pair);
            }
            merged.connections.sort();
            merged.connections.dedup();
        }
    }
    map
}

fn merge_details(existing: &mut NodeDetails, incoming: &NodeDetails) {
    if field_missing(&existing.ip) && !incoming.ip.is_empty() {
        existing.ip = incoming.ip.clone();
    }
    if field_missing(&existing.platform) && !incoming.platform.is_empty() {
        existing.platform = incoming.platform.clone();
    }
}

/// Step 3: a link toward a discovered device survives only when the peer
/// claims the reverse; claims toward undiscovered leaves are trusted
fn confirm_links(map: &mut TopologyMap, devices: &[Device]) -> usize {
    let discovered: HashSet<String> = devices
        .iter()
        .map(|d| canonical_hostname(&d.hostname))
        .collect();
    let snapshot = map.clone();
    let mut dropped = 0;

    for (host, node) in map.iter_mut() {
        let mut emptied: Vec<String> = Vec::new();
        for (peer, info) in node.peers.iter_mut() {
            if !discovered.contains(peer) {
                continue;
            }
            let had_connections = !info.connections.is_empty();
            info.connections.retain(|(local, remote)| {
                let confirmed = snapshot
                    .get(peer)
                    .and_then(|p| p.peers.get(host))
                    .map(|back| {
                        back.connections
                            .iter()
                            .any(|(bl, br)| bl == remote && br == local)
                    })
                    .unwrap_or(false);
                if !confirmed {
                    debug!(%host, %peer, %local, %remote, "dropping unconfirmed link");
                    dropped += 1;
                }
                confirmed
            });
            if had_connections && info.connections.is_empty() {
                emptied.push(peer.clone());
            }
        }
        for peer in emptied {
            node.peers.remove(&peer);
        }
    }
    dropped
}

/// Step 4a: every referenced, non-excluded peer appears as a top-level
/// entry; undiscovered ones get synthesized with best-effort details
fn synthesize_leaves(map: &mut TopologyMap, exclude: &[String]) {
    let mut leaves: BTreeMap<String, NodeDetails> = BTreeMap::new();
    for node in map.values() {
        for (peer, info) in &node.peers {
            if map.contains_key(peer) {
                continue;
            }
            if exclude.iter().any(|e| !e.is_empty() && peer.contains(e.as_str())) {
                continue;
            }
            let entry = leaves.entry(peer.clone()).or_default();
            if entry.ip.is_empty() && !info.ip.is_empty() {
                entry.ip = info.ip.clone();
            }
            if entry.platform.is_empty() && !field_missing(&info.platform) {
                entry.platform = info.platform.clone();
            }
        }
    }
    for (name, details) in leaves {
        map.entry(name).or_insert_with(|| TopologyNode {
            node_details: details,
            peers: BTreeMap::new(),
        });
    }
}

/// Step 4b: peers with a missing-ish platform take the label of the
/// matching top-level node; `ios`/`eos` read as "not a vendor label" and
/// end up blank either way
fn enrich_peers(map: &mut TopologyMap) {
    let top_platforms: HashMap<String, String> = map
        .iter()
        .map(|(name, node)| (name.clone(), node.node_details.platform.clone()))
        .collect();

    for node in map.values_mut() {
        for (peer_name, peer) in node.peers.iter_mut() {
            let label = peer.platform.to_lowercase();
            if peer.platform.is_empty() || label == "ios" || label == "eos" {
                if let Some(top) = top_platforms.get(peer_name) {
                    peer.platform = top.clone();
                }
            }
            let label = peer.platform.to_lowercase();
            if label == "ios" || label == "eos" {
                peer.platform = String::new();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Protocol;
    use crate::crawler::Connection;

    fn claim(
        local: &str,
        remote: &str,
        ip: Option<&str>,
        platform: Option<&str>,
    ) -> Connection {
        Connection {
            local_port: local.to_string(),
            remote_port: remote.to_string(),
            protocol: Protocol::Cdp,
            neighbor_ip: ip.map(str::to_string),
            neighbor_platform: platform.map(str::to_string),
        }
    }

    fn device(
        hostname: &str,
        ip: &str,
        platform: &str,
        claims: &[(&str, Connection)],
    ) -> Device {
        let mut connections: BTreeMap<String, Vec<Connection>> = BTreeMap::new();
        for (peer, conn) in claims {
            connections
                .entry(peer.to_string())
                .or_default()
                .push(conn.clone());
        }
        Device {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            platform: platform.to_string(),
            serial: String::new(),
            connections,
        }
    }

    #[test]
    fn test_canonical_hostname() {
        assert_eq!(canonical_hostname("SW01.corp.example"), "sw01");
        assert_eq!(canonical_hostname("sw01 extra-text"), "sw01");
        assert_eq!(canonical_hostname("  Edge-1.Example.COM  "), "edge-1");
        // Canonicalizing a canonical hostname is a no-op
        assert_eq!(canonical_hostname("sw01"), "sw01");
    }

    #[test]
    fn test_bidirectional_link_confirmed() {
        let a = device(
            "switch-a",
            "10.0.0.1",
            "ios",
            &[(
                "switch-b",
                claim("Gi0/1", "Et1", Some("10.0.0.2"), Some("eos")),
            )],
        );
        let b = device(
            "switch-b",
            "10.0.0.2",
            "eos",
            &[(
                "switch-a",
                claim("Et1", "Gi0/1", Some("10.0.0.1"), Some("ios")),
            )],
        );
        let result = assemble(&[a, b], &[]);
        assert_eq!(result.dropped_links, 0);

        let a = &result.map["switch-a"];
        assert_eq!(
            a.peers["switch-b"].connections,
            vec![("GigabitEthernet0/1".to_string(), "Ethernet1".to_string())]
        );
        let b = &result.map["switch-b"];
        assert_eq!(
            b.peers["switch-a"].connections,
            vec![("Ethernet1".to_string(), "GigabitEthernet0/1".to_string())]
        );
    }

    #[test]
    fn test_unconfirmed_link_dropped() {
        let a = device(
            "switch-a",
            "10.0.0.1",
            "ios",
            &[("switch-b", claim("Gi0/2", "Gi0/2", None, None))],
        );
        // B was discovered but claims nothing toward A
        let b = device("switch-b", "10.0.0.2", "ios", &[]);
        let result = assemble(&[a, b], &[]);

        assert_eq!(result.dropped_links, 1);
        assert!(!result.map["switch-a"].peers.contains_key("switch-b"));
        assert!(!result.map["switch-b"].peers.contains_key("switch-a"));
        // Both devices stay as top-level nodes
        assert!(result.map.contains_key("switch-a"));
        assert!(result.map.contains_key("switch-b"));
    }

    #[test]
    fn test_leaf_peer_retained_and_synthesized() {
        let a = device(
            "switch-a",
            "10.0.0.1",
            "ios",
            &[(
                "leaf.example.com",
                claim("Gi0/3", "xe-0/0/1", Some("10.0.0.9"), Some("junos")),
            )],
        );
        let result = assemble(&[a], &[]);

        let leaf = &result.map["leaf"];
        assert_eq!(leaf.node_details.ip, "10.0.0.9");
        assert_eq!(leaf.node_details.platform, "junos");
        assert!(leaf.peers.is_empty());

        let a = &result.map["switch-a"];
        assert_eq!(
            a.peers["leaf"].connections,
            vec![("GigabitEthernet0/3".to_string(), "xe-0/0/1".to_string())]
        );
        assert_eq!(a.peers["leaf"].platform, "junos");
    }

    #[test]
    fn test_fqdn_duplicate_merged() {
        // The same device reported under its FQDN and its short name
        let fqdn = device(
            "sw01.corp.example",
            "10.0.0.4",
            "ios",
            &[("peer-x", claim("Gi0/1", "Gi0/9", None, None))],
        );
        let short = device(
            "sw01",
            "",
            "",
            &[("peer-x", claim("Gi0/2", "Gi0/10", None, None))],
        );
        let result = assemble(&[fqdn, short], &[]);

        assert!(result.map.contains_key("sw01"));
        assert!(!result.map.contains_key("sw01.corp.example"));
        let node = &result.map["sw01"];
        // Merge kept the non-empty details and unioned the connections
        assert_eq!(node.node_details.ip, "10.0.0.4");
        assert_eq!(node.peers["peer-x"].connections.len(), 2);
    }

    #[test]
    fn test_excluded_peer_not_top_level() {
        let a = device(
            "switch-a",
            "10.0.0.1",
            "ios",
            &[(
                "desk-phone-12",
                claim("Gi0/10", "Port 1", Some("10.0.0.50"), None),
            )],
        );
        let result = assemble(&[a], &["phone".to_string(), "ap-".to_string()]);

        let a = &result.map["switch-a"];
        assert!(a.peers.contains_key("desk-phone-12"));
        assert!(!result.map.contains_key("desk-phone-12"));
    }

    #[test]
    fn test_peer_platform_quirk_blanks_ios_eos() {
        let a = device(
            "switch-a",
            "10.0.0.1",
            "ios",
            &[(
                "switch-b",
                claim("Gi0/1", "Et1", Some("10.0.0.2"), Some("eos")),
            )],
        );
        let b = device(
            "switch-b",
            "10.0.0.2",
            "eos",
            &[(
                "switch-a",
                claim("Et1", "Gi0/1", Some("10.0.0.1"), Some("ios")),
            )],
        );
        let result = assemble(&[a, b], &[]);
        // ios/eos read as "not a vendor label" and are blanked after
        // enrichment from the matching top-level entry
        assert_eq!(result.map["switch-a"].peers["switch-b"].platform, "");
        assert_eq!(result.map["switch-b"].peers["switch-a"].platform, "");
        // Top-level labels stay intact
        assert_eq!(result.map["switch-a"].node_details.platform, "ios");
        assert_eq!(result.map["switch-b"].node_details.platform, "eos");
    }

    #[test]
    fn test_peer_enriched_from_top_level() {
        let a = device(
            "switch-a",
            "10.0.0.1",
            "ios",
            &[("r9", claim("Gi0/5", "ge-0/0/5", Some("10.0.0.9"), None))],
        );
        let r9 = device(
            "r9",
            "10.0.0.9",
            "junos",
            &[("switch-a", claim("ge-0/0/5", "Gi0/5", Some("10.0.0.1"), None))],
        );
        let result = assemble(&[a, r9], &[]);
        assert_eq!(result.map["switch-a"].peers["r9"].platform, "junos");
    }

    #[test]
    fn test_local_port_unique_per_peer() {
        let a = device(
            "switch-a",
            "10.0.0.1",
            "ios",
            &[
                ("switch-b", claim("Gi0/1", "Et1", None, None)),
                ("switch-b", claim("Gi0/1", "Et2", None, None)),
            ],
        );
        let result = assemble(&[a], &[]);
        assert_eq!(result.map["switch-a"].peers["switch-b"].connections.len(), 1);
    }

    #[test]
    fn test_assembler_is_idempotent() {
        let devices = vec![
            device(
                "switch-a",
                "10.0.0.1",
                "ios",
                &[(
                    "switch-b",
                    claim("Gi0/1", "Et1", Some("10.0.0.2"), Some("eos")),
                )],
            ),
            device(
                "switch-b",
                "10.0.0.2",
                "eos",
                &[(
                    "switch-a",
                    claim("Et1", "Gi0/1", Some("10.0.0.1"), Some("ios")),
                )],
            ),
        ];
        let first = assemble(&devices, &[]);
        let second = assemble(&devices, &[]);
        assert_eq!(first.map, second.map);
    }

    #[test]
    fn test_every_peer_is_top_level() {
        let devices = vec![
            device(
                "a",
                "10.0.0.1",
                "ios",
                &[
                    ("b.corp", claim("Gi0/1", "Gi0/2", Some("10.0.0.2"), None)),
                    ("c", claim("Gi0/3", "Et1", None, Some("eos"))),
                ],
            ),
            device(
                "b",
                "10.0.0.2",
                "ios",
                &[("a", claim("Gi0/2", "Gi0/1", Some("10.0.0.1"), None))],
            ),
        ];
        let result = assemble(&devices, &[]);
        for node in result.map.values() {
            for peer in node.peers.keys() {
                assert!(result.map.contains_key(peer), "peer {peer} missing top-level");
            }
        }
    }
}
