//! Port mappings granted to LAN clients
//!
//! A mapping is identified by its 4-tuple (internal address, internal port,
//! external port, transport). The store guarantees at most one live mapping
//! per tuple.

pub mod store;

pub use store::MappingStore;

use crate::protocol::Transport;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Identity of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MappingKey {
    pub internal_address: Ipv4Addr,
    pub internal_port: u16,
    pub external_port: u16,
    pub transport: Transport,
}

impl MappingKey {
    pub fn new(
        internal_address: Ipv4Addr,
        internal_port: u16,
        external_port: u16,
        transport: Transport,
    ) -> Self {
        Self {
            internal_address,
            internal_port,
            external_port,
            transport,
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} :{} -> {}:{}",
            self.transport, self.external_port, self.internal_address, self.internal_port
        )
    }
}

/// One granted port forward. Field names follow the on-disk state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    #[serde(rename = "internal_ip")]
    pub internal_address: Ipv4Addr,
    pub internal_port: u16,
    pub external_port: u16,
    #[serde(rename = "protocol")]
    pub transport: Transport,
    /// Lifetime in seconds as last granted
    #[serde(rename = "lifetime")]
    pub lifetime_secs: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Kernel rule handle, 0 = unknown
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rule_handle: u64,
}

fn is_zero(handle: &u64) -> bool {
    *handle == 0
}

impl Mapping {
    /// Create a fresh mapping with no rule handle yet
    pub fn new(key: MappingKey, lifetime_secs: u32, now: DateTime<Utc>) -> Self {
        Self {
            internal_address: key.internal_address,
            internal_port: key.internal_port,
            external_port: key.external_port,
            transport: key.transport,
            lifetime_secs,
            created_at: now,
            expires_at: expiry(now, lifetime_secs),
            rule_handle: 0,
        }
    }

    pub fn key(&self) -> MappingKey {
        MappingKey::new(
            self.internal_address,
            self.internal_port,
            self.external_port,
            self.transport,
        )
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Grant a new lifetime starting at `now`
    pub fn refresh(&mut self, lifetime_secs: u32, now: DateTime<Utc>) {
        self.lifetime_secs = lifetime_secs;
        self.expires_at = expiry(now, lifetime_secs);
    }
}

fn expiry(now: DateTime<Utc>, lifetime_secs: u32) -> DateTime<Utc> {
    now + TimeDelta::seconds(i64::from(lifetime_secs))
}
