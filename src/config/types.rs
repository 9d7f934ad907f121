//! Configuration types

use crate::protocol::SERVER_PORT;
use crate::telemetry::LogConfig;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration (natpmpd.toml). Every field has a default.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// LAN interface whose address the listener binds
    pub listen_interface: String,
    /// Explicit bind address, overrides `listen_interface`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<Ipv4Addr>,
    pub listen_port: u16,

    /// WAN interface reported by Info requests
    pub external_interface: String,
    /// Fixed address reported by Info requests, overrides the interface lookup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_address: Option<Ipv4Addr>,

    pub nat_table: String,
    pub nat_chain: String,
    pub filter_table: String,
    pub filter_chain: String,

    /// External ports clients may request
    pub allowed_ports: Vec<PortRange>,
    pub max_mappings_per_ip: usize,
    /// Lifetime suggested by the probe client (seconds)
    pub default_lifetime: u32,
    /// Granted lifetimes are clamped to this (seconds)
    pub max_lifetime: u32,

    /// Expiry sweep interval (seconds)
    pub cleanup_interval: u64,
    /// Directory holding mappings.json
    pub state_dir: PathBuf,
    /// Hard timeout for each firewall command (seconds)
    pub command_timeout: u64,
    /// Record firewall changes in memory instead of calling nft
    pub dry_run: bool,

    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_interface: "br-lan".to_string(),
            listen_address: None,
            listen_port: SERVER_PORT,
            external_interface: "eth0".to_string(),
            external_address: None,
            nat_table: "nat".to_string(),
            nat_chain: "NATPMP".to_string(),
            filter_table: "filter".to_string(),
            filter_chain: "NATPMP".to_string(),
            allowed_ports: vec![PortRange {
                start: 1024,
                end: 65535,
            }],
            max_mappings_per_ip: 100,
            default_lifetime: 3600,
            max_lifetime: 86400,
            cleanup_interval: 60,
            state_dir: PathBuf::from("/var/lib/natpmp-server"),
            command_timeout: 5,
            dry_run: false,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Whether an external port falls inside any allowed range
    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.iter().any(|r| r.contains(port))
    }

    /// Clamp a requested lifetime to the configured maximum
    pub fn clamp_lifetime(&self, requested: u32) -> u32 {
        requested.min(self.max_lifetime)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }
}

/// Inclusive external port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}
