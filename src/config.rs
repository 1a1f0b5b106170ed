//! Agent configuration
//!
//! Settings come from an optional TOML file and are then overridden by
//! command line flags (see `main.rs`). Every section has defaults, so an
//! empty file is a valid configuration once a node name is known.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Well-known STUN endpoints, tried in order
pub const DEFAULT_STUN_SERVERS: [&str; 2] = ["stun.qq.com:3478", "stun.miwifi.com:3478"];

/// Local UDP port probes are sent from, matching the IPsec NAT-T port
pub const DEFAULT_NAT_LOCAL_PORT: u16 = 4500;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Name of the Kubernetes node this agent runs on
    pub node_name: String,
    pub tunnel: TunnelConfig,
    pub nat: NatConfig,
    pub engine: EngineConfig,
    pub api: ApiConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Registered route driver kind
    pub route_driver: String,
    /// Registered VPN driver kind
    pub vpn_driver: String,
    /// Also route each node's private IP through the tunnel
    pub forward_node_ip: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            route_driver: "noop".to_string(),
            vpn_driver: "noop".to_string(),
            forward_node_ip: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct NatConfig {
    pub stun_servers: Vec<String>,
    pub local_port: u16,
    /// Per-server probe timeout
    pub timeout_secs: u64,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            local_port: DEFAULT_NAT_LOCAL_PORT,
            timeout_secs: 3,
        }
    }
}

impl NatConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent queue workers
    pub workers: usize,
    /// Failed passes requeued before an item is dropped
    pub max_retries: u32,
    /// Deadline for a single reconcile pass, 0 disables it
    pub reconcile_timeout_secs: u64,
    pub requeue_base_delay_ms: u64,
    pub requeue_max_delay_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: 15,
            reconcile_timeout_secs: 120,
            requeue_base_delay_ms: 5,
            requeue_max_delay_secs: 1000,
        }
    }
}

impl EngineConfig {
    pub fn reconcile_timeout(&self) -> Option<Duration> {
        (self.reconcile_timeout_secs > 0).then(|| Duration::from_secs(self.reconcile_timeout_secs))
    }

    pub fn requeue_base_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_base_delay_ms)
    }

    pub fn requeue_max_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_max_delay_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:10265".to_string(),
        }
    }
}

impl Config {
    /// Parse a configuration document
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::ConfigError(format!("invalid config: {e}")))
    }

    /// Load a configuration file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&raw)
    }

    /// Check the invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(Error::ConfigError("node name must not be empty".to_string()));
        }
        if self.engine.workers == 0 {
            return Err(Error::ConfigError(
                "engine.workers must be at least 1".to_string(),
            ));
        }
        if self.nat.stun_servers.is_empty() {
            return Err(Error::ConfigError(
                "nat.stun_servers must list at least one server".to_string(),
            ));
        }
        if self.tunnel.route_driver.is_empty() || self.tunnel.vpn_driver.is_empty() {
            return Err(Error::ConfigError(
                "tunnel.route_driver and tunnel.vpn_driver must be set".to_string(),
            ));
        }
        Ok(())
    }
}
