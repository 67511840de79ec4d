// Device fingerprinting
//
// Three-phase probe against a fresh interactive shell:
//   PROMPT_DETECT -> PAGING_DISABLE -> VERSION_CLASSIFY
// Any phase failure is terminal for the device except a version parse that
// still yields a usable hostname, which demotes the device to
// platform=unknown instead of failing it.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::crawler::CancelFlag;
use crate::error::{DiscoveryError, Result};
use crate::normalize::Platform;
use crate::template::{field, field_list, BestMatch, TemplateEngine};
use crate::transport::{DeviceSession, IDLE_TIMEOUT, READ_TIMEOUT};

/// Pause between paging commands; some devices drop input sent back-to-back
const PAGING_PACE: Duration = Duration::from_millis(500);

/// Vendor paging command sets, tried in priority order
const PAGING_COMMANDS: &[(&str, &[&str])] = &[
    ("cisco", &["terminal length 0", "terminal width 511"]),
    ("arista", &["terminal length 0", "terminal width 32767"]),
    ("juniper", &["set cli screen-length 0", "set cli screen-width 511"]),
    ("huawei", &["screen-length 0 temporary"]),
    ("hp", &["screen-length disable"]),
    ("paloalto", &["set cli pager off"]),
    ("fortinet", &["config system console", "set output standard", "end"]),
    ("asa", &["terminal pager 0"]),
    ("dell", &["terminal length 0"]),
];

/// CLI rejection markers; any hit aborts the vendor set being tried
static ERROR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)% ?(error|invalid|bad|unknown|incomplete|unrecognized)").unwrap()
});

/// Uptime broken into calendar components; absent parts stay zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Uptime {
    pub years: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Memory {
    pub total: u64,
    pub free: u64,
}

/// Platform-agnostic shape of a classified device
#[derive(Debug, Clone, Serialize)]
pub struct Fingerprint {
    pub hostname: String,
    pub platform: Platform,
    pub vendor: Option<String>,
    pub prompt: String,
    pub image: String,
    pub version: String,
    pub model: String,
    pub uptime: Uptime,
    pub boot_reason: String,
    pub serials: Vec<String>,
    pub macs: Vec<String>,
    pub memory: Memory,
}

impl Fingerprint {
    fn bare(prompt: &str, hostname: String, platform: Platform) -> Fingerprint {
        Fingerprint {
            hostname,
            platform,
            vendor: None,
            prompt: prompt.to_string(),
            image: String::new(),
            version: String::new(),
            model: String::new(),
            uptime: Uptime::default(),
            boot_reason: String::new(),
            serials: Vec::new(),
            macs: Vec::new(),
            memory: Memory::default(),
        }
    }
}

pub struct Fingerprinter<'a> {
    engine: &'a TemplateEngine,
    blacklist: &'a [String],
    cancel: &'a CancelFlag,
}

impl<'a> Fingerprinter<'a> {
    pub fn new(
        engine: &'a TemplateEngine,
        blacklist: &'a [String],
        cancel: &'a CancelFlag,
    ) -> Fingerprinter<'a> {
        Fingerprinter {
            engine,
            blacklist,
            cancel,
        }
    }

    pub fn run(&self, session: &mut dyn DeviceSession, host: &str) -> Result<Fingerprint> {
        self.cancel.check()?;
        let prompt = self.detect_prompt(session, host)?;
        info!(host, prompt = %prompt, "detected prompt");

        if let Some(banned) = self
            .blacklist
            .iter()
            .find(|b| !b.is_empty() && prompt.contains(b.as_str()))
        {
            debug!(host, pattern = %banned, "prompt hit deny pattern");
            return Err(DiscoveryError::Blacklisted {
                host: host.to_string(),
                prompt,
            });
        }

        self.cancel.check()?;
        let vendor = self.disable_paging(session, host, &prompt)?;
        debug!(host, vendor = %vendor, "paging disabled");

        self.cancel.check()?;
        let mut fingerprint = self.classify_version(session, host, &prompt)?;
        fingerprint.vendor = Some(vendor);
        Ok(fingerprint)
    }

    /// Phase 1: send a bare newline and scan the echoed lines in reverse for
    /// a trailing prompt character
    fn detect_prompt(&self, session: &mut dyn DeviceSession, host: &str) -> Result<String> {
        session.send_line("")?;
        let output = session.read_until_idle("", IDLE_TIMEOUT, Duration::from_secs(1))?;
        for line in output.lines().rev() {
            let token = line.trim();
            if token.is_empty() {
                continue;
            }
            if token.ends_with('#') || token.ends_with('>') || token.ends_with('$') {
                return Ok(token.to_string());
            }
        }
        Err(DiscoveryError::PromptUndetected {
            host: host.to_string(),
        })
    }

    /// Phase 2: walk the vendor command sets until one completes cleanly.
    /// A vendor whose name appears in the prompt goes first.
    fn disable_paging(
        &self,
        session: &mut dyn DeviceSession,
        host: &str,
        prompt: &str,
    ) -> Result<String> {
        let prompt_lower = prompt.to_lowercase();
        let mut order: Vec<&(&str, &[&str])> = PAGING_COMMANDS.iter().collect();
        if let Some(pos) = order.iter().position(|(v, _)| prompt_lower.contains(*v)) {
            let preferred = order.remove(pos);
            order.insert(0, preferred);
        }

        'vendors: for (vendor, commands) in order {
            self.cancel.check()?;
            debug!(host, vendor, "trying paging commands");
            for command in commands.iter() {
                session.send_line(command)?;
                let output =
                    session.read_until_idle(prompt, Duration::from_secs(10), IDLE_TIMEOUT)?;
                if ERROR_PATTERN.is_match(&output) {
                    continue 'vendors;
                }
                std::thread::sleep(PAGING_PACE);
            }
            return Ok(vendor.to_string());
        }
        Err(DiscoveryError::PagingFailed {
            host: host.to_string(),
        })
    }

    /// Phase 3: collect `show version`, pick a template by marker substring,
    /// and normalize the winning record
    fn classify_version(
        &self,
        session: &mut dyn DeviceSession,
        host: &str,
        prompt: &str,
    ) -> Result<Fingerprint> {
        session.send_line("show version")?;
        let output = session.read_until_idle(prompt, READ_TIMEOUT, IDLE_TIMEOUT)?;
        let lower = output.to_lowercase();

        let filter = if lower.contains("eos") || lower.contains("arista") {
            Some("arista_eos_show_version")
        } else if lower.contains("nexus") || lower.contains("nx-os") {
            Some("cisco_nxos_show_version")
        } else if lower.contains("cisco ios") {
            Some("cisco_ios_show_version")
        } else if lower.contains("junos") {
            Some("juniper_junos_show_version")
        } else {
            None
        };
        debug!(host, ?filter, "version classification filter");

        let Some(best) = self.engine.find_best_template(&output, filter) else {
            // A prompt-derived hostname still lets the device enter the map
            if let Some(hostname) = hostname_from_prompt(prompt) {
                warn!(host, "version parse failed, keeping device as unknown");
                return Ok(Fingerprint::bare(prompt, hostname, Platform::Unknown));
            }
            return Err(DiscoveryError::VersionParseFailed {
                host: host.to_string(),
            });
        };
        debug!(host, template = %best.template, score = best.score, "version template");

        let mut fingerprint = normalize_version(&best, prompt);

        // An IOS parse on a Nexus box reports the hostname as the kernel
        // name; retry once against the NX-OS template before giving up
        if best.template.contains("cisco_ios")
            && (fingerprint.hostname == "Kernel" || fingerprint.hostname == "Unknown")
        {
            debug!(host, "possible Nexus detected as IOS, retrying as NX-OS");
            let retry = self
                .engine
                .find_best_template(&output, Some("cisco_nxos_show_version"))
                .map(|b| normalize_version(&b, prompt));
            match retry {
                Some(fp)
                    if !fp.hostname.is_empty()
                        && fp.hostname != "Kernel"
                        && fp.hostname != "Unknown" =>
                {
                    fingerprint = fp;
                }
                _ => {
                    fingerprint.platform = Platform::Unknown;
                    fingerprint.hostname = format!("nx-{}", host.replace('.', "_"));
                }
            }
        }

        Ok(fingerprint)
    }
}

/// Derive a hostname from a detected prompt token, e.g. `switch01#` or
/// `admin@r1>`. Returns None when nothing usable remains.
pub fn hostname_from_prompt(prompt: &str) -> Option<String> {
    let stripped = prompt
        .trim()
        .trim_end_matches(['#', '>', '$'])
        .trim()
        .to_string();
    let name = match stripped.rsplit_once('@') {
        Some((_, host)) => host.to_string(),
        None => stripped,
    };
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn platform_from_template(template: &str) -> Platform {
    if template.contains("arista_eos") {
        Platform::Eos
    } else if template.contains("cisco_nxos") {
        Platform::NxosSsh
    } else if template.contains("cisco_ios") {
        Platform::Ios
    } else if template.contains("juniper_junos") {
        Platform::Junos
    } else if template.contains("hp_procurve") {
        Platform::Procurve
    } else {
        Platform::Unknown
    }
}

/// Flatten the winning parse into the platform-agnostic fingerprint shape
fn normalize_version(best: &BestMatch, prompt: &str) -> Fingerprint {
    let platform = platform_from_template(&best.template);
    let empty = crate::template::Record::new();
    let rec = best.records.first().unwrap_or(&empty);

    let mut fp = Fingerprint::bare(prompt, String::new(), platform);
    match platform {
        Platform::Ios => {
            fp.hostname = field(rec, "HOSTNAME").to_string();
            fp.image = field(rec, "RUNNING_IMAGE").to_string();
            fp.version = field(rec, "VERSION").to_string();
            fp.model = field_list(rec, "HARDWARE").first().cloned().unwrap_or_default();
            fp.uptime = parse_uptime(field(rec, "UPTIME"));
            fp.boot_reason = field(rec, "RELOAD_REASON").to_string();
            fp.serials = field_list(rec, "SERIAL");
            fp.macs = field_list(rec, "MAC_ADDRESS");
        }
        Platform::NxosSsh => {
            fp.hostname = field(rec, "HOSTNAME").to_string();
            fp.image = field(rec, "BOOT_IMAGE").to_string();
            fp.version = field(rec, "OS").to_string();
            fp.model = field(rec, "PLATFORM").to_string();
            fp.uptime = parse_uptime(field(rec, "UPTIME"));
            fp.boot_reason = field(rec, "LAST_REBOOT_REASON").to_string();
            fp.serials = field_list(rec, "SERIAL");
            fp.memory.total = field(rec, "MEMORY").parse().unwrap_or(0);
        }
        Platform::Eos => {
            fp.image = field(rec, "IMAGE").to_string();
            fp.version = field(rec, "VERSION").to_string();
            fp.model = field(rec, "MODEL").to_string();
            fp.uptime = parse_uptime(field(rec, "UPTIME"));
            fp.serials = field_list(rec, "SERIAL_NUMBER");
            fp.macs = field_list(rec, "SYS_MAC");
            fp.memory.total = field(rec, "TOTAL_MEMORY").parse().unwrap_or(0);
            fp.memory.free = field(rec, "FREE_MEMORY").parse().unwrap_or(0);
        }
        Platform::Junos => {
            fp.hostname = field(rec, "HOSTNAME").to_string();
            fp.version = field(rec, "JUNOS_VERSION").to_string();
            fp.model = field(rec, "MODEL").to_string();
        }
        Platform::Procurve | Platform::Unknown => {}
    }

    if fp.hostname.is_empty() {
        if let Some(h) = hostname_from_prompt(prompt) {
            fp.hostname = h;
        }
    }
    fp
}

static UPTIME_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+)\s+(year|week|day|hour|minute)").unwrap());

/// Parse a free-form uptime string like
/// `1 year, 2 weeks, 3 days, 4 hours and 5 minutes`
pub fn parse_uptime(raw: &str) -> Uptime {
    let mut uptime = Uptime::default();
    for caps in UPTIME_PART.captures_iter(raw) {
        let count: u32 = caps[1].parse().unwrap_or(0);
        match caps[2].to_lowercase().as_str() {
            "year" => uptime.years = count,
            "week" => uptime.weeks = count,
            "day" => uptime.days = count,
            "hour" => uptime.hours = count,
            "minute" => uptime.minutes = count,
            _ => {}
        }
    }
    uptime
}
