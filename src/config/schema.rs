//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the upstream balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BalancerConfig {
    /// Upstream group definitions.
    pub upstreams: Vec<UpstreamConfig>,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Peer selection algorithm for an upstream group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMethod {
    /// Smooth weighted round robin.
    #[default]
    RoundRobin,
    /// Client address affinity, falling back to round robin.
    IpHash,
}

impl BalanceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceMethod::RoundRobin => "round_robin",
            BalanceMethod::IpHash => "ip_hash",
        }
    }
}

/// A named group of peers sharing one balancing method.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Group identifier for logging/metrics.
    pub name: String,

    /// Selection algorithm.
    #[serde(default)]
    pub method: BalanceMethod,

    /// Peers in selection order. Order matters for `ip_hash`.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeerConfig {
    /// Peer address (e.g., "127.0.0.1:3000").
    pub address: String,

    /// Display name. Defaults to the address.
    #[serde(default)]
    pub name: Option<String>,

    /// Relative share of traffic (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Failures within `fail_timeout_secs` before the peer is skipped.
    /// Zero disables failure accounting.
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Failure window in seconds.
    #[serde(default = "default_fail_timeout_secs")]
    pub fail_timeout_secs: u64,

    /// Administratively disabled.
    #[serde(default)]
    pub down: bool,
}

impl PeerConfig {
    /// Peer with default weight and health settings.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            weight: default_weight(),
            max_fails: default_max_fails(),
            fail_timeout_secs: default_fail_timeout_secs(),
            down: false,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    pub fn fail_timeout(&self) -> Duration {
        Duration::from_secs(self.fail_timeout_secs)
    }
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout_secs() -> u64 {
    10
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Pretty output for terminals, JSON for log shipping.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
