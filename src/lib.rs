//! natpmpd - NAT-PMP responder
//!
//! Answers RFC 6886 requests from LAN clients and keeps one nftables
//! destination-NAT rule per granted mapping. Mappings are persisted so they
//! survive a restart and are reaped when their lifetime runs out.

pub mod client;
pub mod config;
pub mod error;
pub mod firewall;
pub mod mapping;
pub mod protocol;
pub mod server;
pub mod telemetry;

pub use error::{Error, Result};
