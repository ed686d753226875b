//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from the TOML
//! config file; every section carries usable defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firewall::ToolPaths;

/// Root configuration for the envelope service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Access-token verification settings.
    pub token: TokenConfig,

    /// Firewall management and session settings.
    pub envelope: AccessConfig,

    /// Transmit-rate controller settings.
    pub txcontroller: TxConfig,

    /// Paths to the packet-filter utilities.
    pub iptables: ToolPaths,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address for the envelope access API.
    pub listen_address: String,

    /// TLS certificate path. Served only when both cert and key are set.
    pub cert: String,

    /// TLS private key path.
    pub key: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8880".to_string(),
            cert: String::new(),
            key: String::new(),
        }
    }
}

/// Access-token verification settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Paths to serialized public JWK descriptors. Multiple keys with
    /// distinct kids support signer key rotation.
    pub verify_keys: Vec<PathBuf>,

    /// Whether requests to enforced paths must carry an access token.
    pub required: bool,

    /// The JWT issuer used to verify access tokens.
    pub issuer: String,

    /// The machine name expected in access token audience claims.
    pub machine: String,

    /// The subject (service name) expected in access token claims.
    pub subject: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            verify_keys: Vec::new(),
            required: true,
            issuer: "locate.measurementlab.net".to_string(),
            machine: String::new(),
            subject: String::new(),
        }
    }
}

/// Firewall management and session settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccessConfig {
    /// The public network interface device that the envelope manages.
    /// All other interfaces are allowed wholesale.
    pub device: String,

    /// Maximum number of concurrent client grants.
    pub max_clients: usize,

    /// Minimum session duration floor in seconds. Valid token
    /// expirations extend individual sessions beyond it.
    pub timeout_secs: u64,
}

impl AccessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            device: "eth0".to_string(),
            max_clients: 1,
            timeout_secs: 60,
        }
    }
}

/// Transmit-rate controller settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TxConfig {
    /// Calculate bytes transmitted from this device. Empty disables the
    /// rate controller entirely.
    pub device: String,

    /// The max rate (in bits/s) beyond which new clients are rejected.
    /// Zero disables the rate gate.
    pub max_rate: u64,

    /// Root of the proc filesystem; overridable for tests.
    pub proc_path: PathBuf,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            max_rate: 0,
            proc_path: "/proc".into(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
