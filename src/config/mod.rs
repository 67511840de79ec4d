// Discovery run configuration
//
// Precedence, lowest to highest: built-in defaults, SC_* environment
// variables, YAML file, command-line flags. Validation failures map to the
// CLI's configuration-error exit code.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crawler::{DEFAULT_MAX_DEVICES, DEFAULT_MAX_WORKERS};
use crate::error::{DiscoveryError, ErrorContext, Result};

/// Graph layout requested for downstream renderers; forwarded with the
/// output, never interpreted by the discovery core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Kk,
    Rt,
    Circular,
    Multipartite,
}

impl FromStr for Layout {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Layout> {
        match s.to_lowercase().as_str() {
            "kk" => Ok(Layout::Kk),
            "rt" => Ok(Layout::Rt),
            "circular" => Ok(Layout::Circular),
            "multipartite" => Ok(Layout::Multipartite),
            other => Err(DiscoveryError::Config {
                field: "layout".to_string(),
                reason: format!("unknown layout '{}'", other),
            }),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_timeout() -> u64 {
    30
}

fn default_max_devices() -> usize {
    DEFAULT_MAX_DEVICES
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_map_name() -> String {
    "network_map".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub seed_ip: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub alternate_username: String,
    #[serde(default)]
    pub alternate_password: String,
    #[serde(default)]
    pub domain_name: String,
    /// Comma-separated substrings; matching peers are never crawled
    #[serde(default)]
    pub exclude: String,
    /// Comma-separated prompt deny substrings
    #[serde(default)]
    pub blacklist: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory of .textfsm files overriding the embedded template store
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_map_name")]
    pub map_name: String,
    #[serde(default)]
    pub layout: Layout,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub save_debug_info: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> DiscoveryConfig {
        DiscoveryConfig {
            seed_ip: String::new(),
            username: String::new(),
            password: String::new(),
            alternate_username: String::new(),
            alternate_password: String::new(),
            domain_name: String::new(),
            exclude: String::new(),
            blacklist: String::new(),
            output_dir: default_output_dir(),
            templates_dir: None,
            timeout: default_timeout(),
            max_devices: default_max_devices(),
            max_workers: default_max_workers(),
            map_name: default_map_name(),
            layout: Layout::default(),
            verbose: false,
            save_debug_info: false,
        }
    }
}

impl DiscoveryConfig {
    /// Defaults with credentials pulled from SC_* environment variables
    pub fn from_env() -> DiscoveryConfig {
        let var = |name: &str| std::env::var(name).unwrap_or_default();
        DiscoveryConfig {
            username: var("SC_USERNAME"),
            password: var("SC_PASSWORD"),
            alternate_username: var("SC_ALT_USERNAME"),
            alternate_password: var("SC_ALT_PASSWORD"),
            ..DiscoveryConfig::default()
        }
    }

    /// Overlay values from a YAML file. Empty fields in the file keep the
    /// current values; `verbose: true` also turns on the debug dumps, as
    /// the original CLI aliased them.
    pub fn apply_yaml(&mut self, path: &Path) -> Result<()> {
        let text =
            std::fs::read_to_string(path).with_path_context(&path.display().to_string())?;
        let overlay: DiscoveryConfig =
            serde_yaml::from_str(&text).map_err(|e| DiscoveryError::Config {
                field: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let keep_mine = DiscoveryConfig::default();
        if !overlay.seed_ip.is_empty() {
            self.seed_ip = overlay.seed_ip;
        }
        if !overlay.username.is_empty() {
            self.username = overlay.username;
        }
        if !overlay.password.is_empty() {
            self.password = overlay.password;
        }
        if !overlay.alternate_username.is_empty() {
            self.alternate_username = overlay.alternate_username;
        }
        if !overlay.alternate_password.is_empty() {
            self.alternate_password = overlay.alternate_password;
        }
        if !overlay.domain_name.is_empty() {
            self.domain_name = overlay.domain_name;
        }
        if !overlay.exclude.is_empty() {
            self.exclude = overlay.exclude;
        }
        if !overlay.blacklist.is_empty() {
            self.blacklist = overlay.blacklist;
        }
        if overlay.output_dir != keep_mine.output_dir {
            self.output_dir = overlay.output_dir;
        }
        if overlay.templates_dir.is_some() {
            self.templates_dir = overlay.templates_dir;
        }
        if overlay.timeout != keep_mine.timeout {
            self.timeout = overlay.timeout;
        }
        if overlay.max_devices != keep_mine.max_devices {
            self.max_devices = overlay.max_devices;
        }
        if overlay.max_workers != keep_mine.max_workers {
            self.max_workers = overlay.max_workers;
        }
        if overlay.map_name != keep_mine.map_name {
            self.map_name = overlay.map_name;
        }
        if overlay.layout != keep_mine.layout {
            self.layout = overlay.layout;
        }
        if overlay.verbose {
            self.verbose = true;
            self.save_debug_info = true;
        }
        if overlay.save_debug_info {
            self.save_debug_info = true;
        }
        Ok(())
    }

    /// Reject configurations the run cannot start from
    pub fn validate(&self) -> Result<()> {
        let fail = |field: &str, reason: &str| {
            Err(DiscoveryError::Config {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.seed_ip.trim().is_empty() {
            return fail("seed_ip", "a seed address or hostname is required");
        }
        if self.username.is_empty() {
            return fail(
                "username",
                "provide --username or the SC_USERNAME environment variable",
            );
        }
        if self.password.is_empty() {
            return fail(
                "password",
                "provide --password or the SC_PASSWORD environment variable",
            );
        }
        if !self.alternate_username.is_empty() && self.alternate_password.is_empty() {
            return fail(
                "alternate_password",
                "alternate_password is required when alternate_username is set",
            );
        }
        if self.max_devices == 0 {
            return fail("max_devices", "must be at least 1");
        }
        Ok(())
    }

    pub fn timeout_per_device(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn exclude_list(&self) -> Vec<String> {
        split_csv(&self.exclude)
    }

    pub fn blacklist_list(&self) -> Vec<String> {
        split_csv(&self.blacklist)
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
