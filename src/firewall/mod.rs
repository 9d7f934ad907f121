//! Firewall synchronisation backends
//!
//! The Firewall is the only component that touches kernel rules. Each live
//! mapping owns exactly one destination-NAT rule in the managed chain,
//! referenced through the kernel-assigned handle stored on the mapping.
//!
//! Backends:
//! - nft: shells out to the nftables CLI
//! - memory: records rule operations in process (tests, dry runs)

mod memory;
mod nft;

pub use memory::{MemoryFirewall, RuleOp};
pub use nft::{parse_rules, NftFirewall};

use crate::mapping::Mapping;
use crate::protocol::Transport;
use crate::Result;
use std::future::Future;

/// One rule as listed from the managed NAT chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub handle: u64,
    /// Rule text without the handle comment
    pub expression: String,
}

impl RuleEntry {
    /// Whether this rule forwards exactly as `mapping` requires.
    ///
    /// Compared token by token, so port 80 never matches a rule for 8080.
    pub fn matches(&self, mapping: &Mapping) -> bool {
        contains_tokens(&self.expression, &rule_expression(mapping))
    }

    /// Transport the rule matches on, if recognisable
    pub fn transport(&self) -> Option<Transport> {
        self.expression
            .split_whitespace()
            .next()
            .and_then(|t| t.parse().ok())
    }
}

/// Semantic content of the DNAT rule for a mapping
pub fn rule_expression(mapping: &Mapping) -> String {
    format!(
        "{} dport {} dnat to {}:{}",
        mapping.transport, mapping.external_port, mapping.internal_address, mapping.internal_port
    )
}

fn contains_tokens(haystack: &str, needle: &str) -> bool {
    let haystack: Vec<&str> = haystack.split_whitespace().collect();
    let needle: Vec<&str> = needle.split_whitespace().collect();
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle.as_slice())
}

/// Kernel packet-filter backend
///
/// Every operation is bounded in time; a timeout surfaces as an error.
pub trait Firewall: Send + Sync + 'static {
    /// Idempotently create the NAT (prerouting) and filter (forward) chains
    fn ensure_tables_and_chains(&self) -> impl Future<Output = Result<()>> + Send;

    /// Install the DNAT rule for `mapping`, returning it with the rule handle
    /// populated when the handle could be determined (0 otherwise).
    fn add_mapping(&self, mapping: Mapping) -> impl Future<Output = Result<Mapping>> + Send;

    /// Delete the rule for `mapping`, by handle when known, else by content
    fn remove_mapping(&self, mapping: &Mapping) -> impl Future<Output = Result<()>> + Send;

    /// List the rules currently in the managed NAT chain
    fn list_rules(&self) -> impl Future<Output = Result<Vec<RuleEntry>>> + Send;

    /// Delete every rule in the managed NAT chain, returning how many went
    fn cleanup_all(&self) -> impl Future<Output = Result<usize>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappingKey;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    fn mapping(internal_port: u16, external_port: u16) -> Mapping {
        Mapping::new(
            MappingKey::new(
                Ipv4Addr::new(192, 168, 1, 10),
                internal_port,
                external_port,
                Transport::Tcp,
            ),
            60,
            Utc::now(),
        )
    }

    #[test]
    fn test_rule_expression() {
        assert_eq!(
            rule_expression(&mapping(22, 2222)),
            "tcp dport 2222 dnat to 192.168.1.10:22"
        );
    }

    #[test]
    fn test_rule_matches_exact_ports_only() {
        let rule = RuleEntry {
            handle: 7,
            expression: "tcp dport 80 dnat to 192.168.1.10:8080".to_string(),
        };
        assert!(rule.matches(&mapping(8080, 80)));
        assert!(!rule.matches(&mapping(80, 80)));
        assert!(!rule.matches(&mapping(8080, 8080)));
        assert_eq!(rule.transport(), Some(Transport::Tcp));
    }
}
