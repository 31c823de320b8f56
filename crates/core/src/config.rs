//! Configuration management for Loomnet.

use crate::error::CoreResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub radar: RadarConfig,
    #[serde(default)]
    pub hook: HookConfig,
    pub transport: TransportConfig,
}

/// Identity and storage settings for this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address family the daemon runs on ("ipv4" or "ipv6")
    pub family: String,
    /// Path of the sqlite map snapshot loaded at boot and saved at shutdown
    pub map_db: String,
    /// Emit JSON log lines instead of the human-readable format
    #[serde(default)]
    pub log_json: bool,
}

/// Radar discovery tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadarConfig {
    /// Probes broadcast per discovery cycle
    pub scans: u8,
    /// Real-time window, in seconds, during which replies are accepted
    pub wait_secs: u64,
    /// Minimum latency change, in milliseconds, treated as a real change
    /// rather than jitter
    pub rtt_delta_ms: u32,
    /// Seconds between periodic discovery cycles
    pub interval_secs: u64,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            scans: 10,
            wait_secs: 10,
            rtt_delta_ms: 1,
            interval_secs: 60,
        }
    }
}

/// Join-procedure tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Discovery rounds run in hooking mode before deciding we are alone
    pub scan_rounds: u8,
    /// Timeout, in seconds, for each map-fetch round trip
    pub fetch_timeout_secs: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            scan_rounds: 3,
            fetch_timeout_secs: 10,
        }
    }
}

/// Transport collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// UDP port the daemon listens on
    pub listen_port: u16,
    /// Local broadcast address probes are sent to
    pub broadcast_addr: String,
}

impl Config {
    /// Load a configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Built-in defaults, useful for tests and first-run setups.
    pub fn default_config() -> Self {
        Self {
            node: NodeConfig {
                family: "ipv4".to_string(),
                map_db: "loomnet_maps.db".to_string(),
                log_json: false,
            },
            radar: RadarConfig::default(),
            hook: HookConfig::default(),
            transport: TransportConfig {
                listen_port: 269,
                broadcast_addr: "255.255.255.255:269".to_string(),
            },
        }
    }
}
