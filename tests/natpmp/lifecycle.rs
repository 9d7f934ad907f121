//! Expiry, restart and shutdown behaviour

use super::harness::{config, eventually, map_request, result_code, TestClient, TestDaemon};
use natpmpd::config::Config;
use natpmpd::firewall::MemoryFirewall;
use natpmpd::mapping::MappingKey;
use natpmpd::protocol::Transport;
use std::net::Ipv4Addr;
use std::time::Duration;

#[tokio::test]
async fn test_mapping_expires() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(Config {
        cleanup_interval: 1,
        ..config(dir.path())
    })
    .await;
    let client = TestClient::new().await;

    let short = client
        .exchange(daemon.address, &map_request(Transport::Udp, 5000, 5000, 1))
        .await;
    assert_eq!(result_code(&short), 0);
    let long = client
        .exchange(daemon.address, &map_request(Transport::Udp, 5001, 5001, 3600))
        .await;
    assert_eq!(result_code(&long), 0);

    let store = daemon.store.clone();
    let expired = eventually(Duration::from_secs(5), move || {
        let store = store.clone();
        async move { store.len().await == 1 }
    })
    .await;
    assert!(expired, "short mapping was not reaped");

    let key = MappingKey::new(Ipv4Addr::LOCALHOST, 5001, 5001, Transport::Udp);
    assert!(daemon.store.find(&key).await.is_some());
    assert_eq!(daemon.firewall.rule_count(), 1);
    assert_eq!(daemon.metrics.mappings_expired.get("udp", ""), 1);

    daemon.stop().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let first = TestDaemon::start(config(dir.path())).await;
    let client = TestClient::new().await;
    let response = client
        .exchange(first.address, &map_request(Transport::Tcp, 22, 2222, 3600))
        .await;
    assert_eq!(result_code(&response), 0);
    first.stop().await;

    let content = std::fs::read_to_string(dir.path().join("mappings.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&content).unwrap();
    let saved = &state["mappings"][0];
    assert_eq!(saved["internal_ip"], "127.0.0.1");
    assert_eq!(saved["external_port"], 2222);
    assert_eq!(saved["protocol"], "tcp");

    // A fresh kernel: the rule must be re-installed from the state file
    let second = TestDaemon::start_with(config(dir.path()), MemoryFirewall::new()).await;
    assert_eq!(second.store.len().await, 1);
    assert_eq!(second.firewall.rule_count(), 1);

    let key = MappingKey::new(Ipv4Addr::LOCALHOST, 22, 2222, Transport::Tcp);
    let restored = second.store.find(&key).await.unwrap();
    assert_eq!(restored.rule_handle, second.firewall.rules()[0].handle);

    // And it can be deleted like any other mapping
    let client = TestClient::new().await;
    let deleted = client
        .exchange(second.address, &map_request(Transport::Tcp, 22, 2222, 0))
        .await;
    assert_eq!(result_code(&deleted), 0);
    assert_eq!(second.firewall.rule_count(), 0);

    second.stop().await;
}

#[tokio::test]
async fn test_expired_state_not_restored() {
    let dir = tempfile::tempdir().unwrap();

    let first = TestDaemon::start(config(dir.path())).await;
    let client = TestClient::new().await;
    client
        .exchange(first.address, &map_request(Transport::Udp, 6000, 6000, 1))
        .await;
    first.stop().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let second = TestDaemon::start(config(dir.path())).await;
    assert!(second.store.is_empty().await);
    assert_eq!(second.firewall.rule_count(), 0);
    second.stop().await;
}

#[tokio::test]
async fn test_shutdown_removes_rules() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(config(dir.path())).await;
    let client = TestClient::new().await;

    for port in [7000, 7001] {
        client
            .exchange(daemon.address, &map_request(Transport::Udp, port, port, 600))
            .await;
    }
    assert_eq!(daemon.firewall.rule_count(), 2);

    let firewall = daemon.firewall.clone();
    let store = daemon.store.clone();
    let metrics = daemon.metrics.clone();
    daemon.stop().await;

    assert_eq!(firewall.rule_count(), 0);
    assert_eq!(store.len().await, 2);
    assert_eq!(metrics.mappings_deleted.get("udp", "shutdown"), 2);
}
