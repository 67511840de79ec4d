// Vendor identifier normalization
// Canonicalizes short vendor interface forms into their full names and
// carries the platform label vocabulary shared by the rest of the pipeline.
// The normalizer is pure: no state, no side effects.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Platform label attached to a fingerprinted device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Ios,
    NxosSsh,
    Eos,
    Junos,
    Procurve,
    Unknown,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::NxosSsh => "nxos_ssh",
            Platform::Eos => "eos",
            Platform::Junos => "junos",
            Platform::Procurve => "procurve",
            Platform::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Platform {
        match label {
            "ios" => Platform::Ios,
            "nxos_ssh" => Platform::NxosSsh,
            "eos" => Platform::Eos,
            "junos" => Platform::Junos,
            "procurve" => Platform::Procurve,
            _ => Platform::Unknown,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full interface prefixes that are already canonical; an input starting
/// with one of these is returned untouched
const CANONICAL_PREFIXES: &[&str] = &[
    "GigabitEthernet",
    "TenGigabitEthernet",
    "FortyGigabitEthernet",
    "HundredGigE",
    "FastEthernet",
    "Ethernet",
    "Port-channel",
    "port-channel",
    "Port-Channel",
    "Vlan",
    "Loopback",
    "loopback",
    "Management",
    "mgmt",
];

// Juniper media names keep their native lowercase-dashed shape, sub-unit
// included. The dashed forms and irb are unambiguous and always pass
// through; the short bare forms only when the hint says junos.
static JUNIPER_DASHED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:ge|xe|et)-\d+/\d+/\d+(?:\.\d+)?$").unwrap());
static JUNIPER_BARE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:ae|fxp|em|me|lo)\d+(?:\.\d+)?$").unwrap());
static JUNIPER_IRB: Lazy<Regex> = Lazy::new(|| Regex::new(r"^irb(?:\.\d+)?$").unwrap());

enum Rule {
    /// Fixed canonical prefix
    Plain(&'static str),
    /// Prefix whose casing depends on the vendor hint
    PortChannel,
    Loopback,
    Management,
}

static PREFIX_RULES: Lazy<Vec<(Regex, Rule)>> = Lazy::new(|| {
    let rule = |alts: &str| Regex::new(&format!(r"(?i)^(?:{})(\d.*)$", alts)).unwrap();
    vec![
        (rule("GigabitEthernet|Gi"), Rule::Plain("GigabitEthernet")),
        (rule("TenGigabitEthernet|Te"), Rule::Plain("TenGigabitEthernet")),
        (
            rule("FortyGigabitEthernet|Fo"),
            Rule::Plain("FortyGigabitEthernet"),
        ),
        (rule("HundredGigE|Hu"), Rule::Plain("HundredGigE")),
        (rule("FastEthernet|Fa"), Rule::Plain("FastEthernet")),
        (rule("Ethernet|Eth|Et"), Rule::Plain("Ethernet")),
        (rule("Port-channel|Po"), Rule::PortChannel),
        (rule("Vlan|Vl"), Rule::Plain("Vlan")),
        (rule("Loopback|Lo"), Rule::Loopback),
        (rule("Management|mgmt|Mg|Ma"), Rule::Management),
    ]
});

/// Canonicalize a vendor interface name, keeping the trailing
/// numeric/slotted suffix intact. Unrecognized names come back verbatim.
pub fn normalize_interface(raw: &str, vendor: Option<Platform>) -> String {
    let name = raw.trim();
    if name.is_empty() || name == "unknown" {
        return name.to_string();
    }

    // Already in full form
    if CANONICAL_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return name.to_string();
    }

    if JUNIPER_DASHED.is_match(name) || JUNIPER_IRB.is_match(name) {
        return name.to_string();
    }
    if vendor == Some(Platform::Junos) && JUNIPER_BARE.is_match(name) {
        return name.to_string();
    }

    for (pattern, rule) in PREFIX_RULES.iter() {
        if let Some(caps) = pattern.captures(name) {
            let suffix = &caps[1];
            let prefix = match rule {
                Rule::Plain(p) => *p,
                Rule::PortChannel => match vendor {
                    Some(Platform::NxosSsh) => "port-channel",
                    Some(Platform::Eos) => "Port-Channel",
                    _ => "Port-channel",
                },
                Rule::Loopback => match vendor {
                    Some(Platform::NxosSsh) => "loopback",
                    _ => "Loopback",
                },
                Rule::Management => match vendor {
                    Some(Platform::NxosSsh) => "mgmt",
                    _ => "Management",
                },
            };
            return format!("{}{}", prefix, suffix);
        }
    }

    name.to_string()
}

/// Normalize both ends of a connection pair
pub fn normalize_pair(
    local: &str,
    remote: &str,
    local_vendor: Option<Platform>,
    remote_vendor: Option<Platform>,
) -> (String, String) {
    (
        normalize_interface(local, local_vendor),
        normalize_interface(remote, remote_vendor),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_forms_expand() {
        assert_eq!(
            normalize_interface("Gi1/0/1", Some(Platform::Ios)),
            "GigabitEthernet1/0/1"
        );
        assert_eq!(
            normalize_interface("Te1/1/4", Some(Platform::Ios)),
            "TenGigabitEthernet1/1/4"
        );
        assert_eq!(normalize_interface("Fa0/24", None), "FastEthernet0/24");
        assert_eq!(normalize_interface("Fo1/1/1", None), "FortyGigabitEthernet1/1/1");
        assert_eq!(normalize_interface("Hu1/0/49", None), "HundredGigE1/0/49");
        assert_eq!(normalize_interface("Eth1/1", Some(Platform::NxosSsh)), "Ethernet1/1");
        assert_eq!(normalize_interface("Et1", Some(Platform::Eos)), "Ethernet1");
        assert_eq!(normalize_interface("Vl100", None), "Vlan100");
    }

    #[test]
    fn test_case_insensitive_prefix() {
        assert_eq!(normalize_interface("gi0/1", None), "GigabitEthernet0/1");
        assert_eq!(normalize_interface("ETH1/2", Some(Platform::NxosSsh)), "Ethernet1/2");
    }

    #[test]
    fn test_port_channel_vendor_casing() {
        assert_eq!(normalize_interface("Po10", Some(Platform::Ios)), "Port-channel10");
        assert_eq!(
            normalize_interface("Po10", Some(Platform::NxosSsh)),
            "port-channel10"
        );
        assert_eq!(normalize_interface("Po10", Some(Platform::Eos)), "Port-Channel10");
        assert_eq!(normalize_interface("Po10", None), "Port-channel10");
    }

    #[test]
    fn test_loopback_and_management_casing() {
        assert_eq!(normalize_interface("Lo0", Some(Platform::Ios)), "Loopback0");
        assert_eq!(normalize_interface("Lo0", Some(Platform::NxosSsh)), "loopback0");
        assert_eq!(normalize_interface("Mg1", Some(Platform::Eos)), "Management1");
        assert_eq!(normalize_interface("Mg0", Some(Platform::NxosSsh)), "mgmt0");
    }

    #[test]
    fn test_juniper_forms_untouched() {
        assert_eq!(normalize_interface("ge-0/0/1", Some(Platform::Junos)), "ge-0/0/1");
        assert_eq!(normalize_interface("xe-0/1/0.100", None), "xe-0/1/0.100");
        assert_eq!(normalize_interface("et-0/0/0", None), "et-0/0/0");
        assert_eq!(normalize_interface("ae0", Some(Platform::Junos)), "ae0");
        assert_eq!(normalize_interface("lo0", Some(Platform::Junos)), "lo0");
        assert_eq!(normalize_interface("irb.200", Some(Platform::Junos)), "irb.200");
        assert_eq!(normalize_interface("fxp0", None), "fxp0");
    }

    #[test]
    fn test_canonical_is_noop() {
        for name in [
            "GigabitEthernet1/0/1",
            "TenGigabitEthernet2/0/3",
            "Ethernet49/1",
            "Port-channel5",
            "port-channel5",
            "Port-Channel5",
            "Vlan100",
            "loopback0",
            "mgmt0",
        ] {
            assert_eq!(normalize_interface(name, None), name);
        }
    }

    #[test]
    fn test_unrecognized_verbatim() {
        assert_eq!(normalize_interface("Serial0/0/0", None), "Serial0/0/0");
        assert_eq!(normalize_interface("Tunnel1", None), "Tunnel1");
        assert_eq!(normalize_interface("", None), "");
        assert_eq!(normalize_interface("unknown", None), "unknown");
    }

    #[test]
    fn test_normalize_pair() {
        let (l, r) = normalize_pair("Gi0/1", "Et1", Some(Platform::Ios), Some(Platform::Eos));
        assert_eq!(l, "GigabitEthernet0/1");
        assert_eq!(r, "Ethernet1");
    }

    #[test]
    fn test_platform_labels() {
        assert_eq!(Platform::NxosSsh.as_str(), "nxos_ssh");
        assert_eq!(Platform::from_label("eos"), Platform::Eos);
        assert_eq!(Platform::from_label("weird"), Platform::Unknown);
    }
}
