// Error types for the discovery pipeline
// Every per-device failure is modeled as a returned kind; transport-library
// errors are mapped at the worker boundary and never cross workers

use thiserror::Error;

/// Error kinds for discovery operations
/// Each variant carries the context needed to report the offending address
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// TCP probe failed; the host never gets a session
    #[error("Host {host} is unreachable on port {port}")]
    Unreachable { host: String, port: u16 },

    /// SSH handshake rejected the credentials
    #[error("Authentication failed for {host}: {reason}")]
    AuthFailure { host: String, reason: String },

    /// Mid-session I/O failure on an established channel
    #[error("Transport error on {host}: {reason}")]
    Transport { host: String, reason: String },

    /// Phase 1 read out without a recognizable prompt
    #[error("No prompt detected on {host}")]
    PromptUndetected { host: String },

    /// Phase 2 exhausted every vendor command set
    #[error("No paging command set accepted by {host}")]
    PagingFailed { host: String },

    /// Phase 3 produced no scoring template
    #[error("Version output from {host} matched no template")]
    VersionParseFailed { host: String },

    /// Neighbor output produced no scoring template
    #[error("Neighbor output from {host} matched no template")]
    NeighborParseFailed { host: String },

    /// Detected prompt matched the operator deny pattern
    #[error("Prompt '{prompt}' on {host} matches the deny pattern")]
    Blacklisted { host: String, prompt: String },

    /// Cooperative shutdown observed mid-device
    #[error("Discovery cancelled")]
    Cancelled,

    /// Per-device wall clock exceeded
    #[error("Device {host} exceeded its {seconds}s time budget")]
    DeviceTimeout { host: String, seconds: u64 },

    /// Configuration errors (missing credentials, unreadable YAML)
    #[error("Invalid configuration: {field} - {reason}")]
    Config { field: String, reason: String },

    /// A template that cannot be compiled; it is excluded, not fatal
    #[error("Template '{name}' is malformed: {reason}")]
    Template { name: String, reason: String },

    /// File I/O errors while persisting output
    #[error("File operation failed: {path} - {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization failures on the topology document
    #[error("Failed to serialize {what}: {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DiscoveryError {
    /// Whether this failure is authentication-shaped, i.e. worth retrying
    /// once with alternate credentials
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, DiscoveryError::AuthFailure { .. })
    }

    /// Short kind label used in verbose failure listings
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryError::Unreachable { .. } => "unreachable",
            DiscoveryError::AuthFailure { .. } => "auth_failure",
            DiscoveryError::Transport { .. } => "transport_error",
            DiscoveryError::PromptUndetected { .. } => "prompt_undetected",
            DiscoveryError::PagingFailed { .. } => "paging_failed",
            DiscoveryError::VersionParseFailed { .. } => "version_parse_failed",
            DiscoveryError::NeighborParseFailed { .. } => "neighbor_parse_failed",
            DiscoveryError::Blacklisted { .. } => "blacklisted",
            DiscoveryError::Cancelled => "cancelled",
            DiscoveryError::DeviceTimeout { .. } => "device_timeout",
            DiscoveryError::Config { .. } => "config_error",
            DiscoveryError::Template { .. } => "template_error",
            DiscoveryError::Io { .. } => "io_error",
            DiscoveryError::Serialization { .. } => "serialization_error",
        }
    }
}

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Error context extension trait for mapping transport-library errors
/// to discovery kinds at the worker boundary
pub trait ErrorContext<T> {
    fn with_transport_context(self, host: &str) -> Result<T>;
    fn with_path_context(self, path: &str) -> Result<T>;
}

impl<T> ErrorContext<T> for std::result::Result<T, std::io::Error> {
    fn with_transport_context(self, host: &str) -> Result<T> {
        self.map_err(|e| DiscoveryError::Transport {
            host: host.to_string(),
            reason: e.to_string(),
        })
    }

    fn with_path_context(self, path: &str) -> Result<T> {
        self.map_err(|e| DiscoveryError::Io {
            path: path.to_string(),
            source: e,
        })
    }
}
