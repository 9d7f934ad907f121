//! Against the real nft binary, in a throwaway table

use natpmpd::config::Config;
use natpmpd::firewall::{Firewall, NftFirewall};
use natpmpd::mapping::{Mapping, MappingKey};
use natpmpd::protocol::Transport;
use natpmpd::telemetry::MetricsRegistry;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;

const TABLE: &str = "natpmpd_test";

fn delete_table() {
    let _ = Command::new("nft")
        .args(["delete", "table", "ip", TABLE])
        .status();
}

#[tokio::test]
#[ignore] // Requires root and nft
async fn test_nft_rule_lifecycle() {
    delete_table();
    let config = Config {
        nat_table: TABLE.to_string(),
        filter_table: TABLE.to_string(),
        filter_chain: "NATPMP_FWD".to_string(),
        ..Config::default()
    };
    let firewall = NftFirewall::new(&config, Arc::new(MetricsRegistry::new()));

    firewall.ensure_tables_and_chains().await.unwrap();
    // Idempotent
    firewall.ensure_tables_and_chains().await.unwrap();

    let key = MappingKey::new(Ipv4Addr::new(192, 168, 77, 10), 22, 2222, Transport::Tcp);
    let installed = firewall
        .add_mapping(Mapping::new(key, 60, chrono::Utc::now()))
        .await
        .unwrap();
    assert_ne!(installed.rule_handle, 0);

    let rules = firewall.list_rules().await.unwrap();
    assert_eq!(rules.len(), 1);
    assert!(rules[0].matches(&installed));

    // Remove by content
    let mut unknown_handle = installed.clone();
    unknown_handle.rule_handle = 0;
    firewall.remove_mapping(&unknown_handle).await.unwrap();
    assert!(firewall.list_rules().await.unwrap().is_empty());

    firewall
        .add_mapping(Mapping::new(key, 60, chrono::Utc::now()))
        .await
        .unwrap();
    assert_eq!(firewall.cleanup_all().await.unwrap(), 1);

    delete_table();
}
