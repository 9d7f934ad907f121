//! Request handling over UDP

use super::harness::{config, eventually, map_request, result_code, TestClient, TestDaemon};
use natpmpd::client::Client;
use natpmpd::config::{Config, PortRange};
use natpmpd::mapping::MappingKey;
use natpmpd::protocol::{Request, Response, Transport};
use std::net::Ipv4Addr;
use std::time::Duration;

#[tokio::test]
async fn test_udp_map_request() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(config(dir.path())).await;
    let client = TestClient::new().await;

    let request = [0, 1, 0, 0, 0x1F, 0x90, 0x1F, 0x90, 0, 0, 0x0E, 0x10];
    let response = client.exchange(daemon.address, &request).await;

    assert_eq!(response.len(), 16);
    assert_eq!(response[0], 0);
    assert_eq!(response[1], 129);
    assert_eq!(result_code(&response), 0);
    assert_eq!(u16::from_be_bytes([response[8], response[9]]), 8080);
    assert_eq!(u16::from_be_bytes([response[10], response[11]]), 8080);
    let lifetime = u32::from_be_bytes([response[12], response[13], response[14], response[15]]);
    assert!(lifetime > 0 && lifetime <= 3600);

    let key = MappingKey::new(Ipv4Addr::LOCALHOST, 8080, 8080, Transport::Udp);
    let mapping = daemon.store.find(&key).await.expect("mapping stored");
    assert_ne!(mapping.rule_handle, 0);
    assert_eq!(daemon.firewall.rule_count(), 1);
    assert_eq!(
        daemon.firewall.rules()[0].expression,
        "udp dport 8080 dnat to 127.0.0.1:8080"
    );

    daemon.stop().await;
}

#[tokio::test]
async fn test_tcp_delete_request() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(config(dir.path())).await;
    let client = TestClient::new().await;

    let created = client
        .exchange(daemon.address, &map_request(Transport::Tcp, 22, 2222, 3600))
        .await;
    assert_eq!(result_code(&created), 0);

    let request = [0, 2, 0, 0, 0x00, 0x16, 0x08, 0xAE, 0, 0, 0, 0];
    let response = client.exchange(daemon.address, &request).await;

    assert_eq!(response.len(), 16);
    assert_eq!(response[1], 130);
    assert_eq!(result_code(&response), 0);
    assert_eq!(&response[8..12], &[0x00, 0x16, 0x08, 0xAE]);
    assert_eq!(&response[12..16], &[0, 0, 0, 0]);
    assert!(daemon.store.is_empty().await);
    assert_eq!(daemon.firewall.rule_count(), 0);

    // Deleting again is refused
    let again = client.exchange(daemon.address, &request).await;
    assert_eq!(again.len(), 8);
    assert_eq!(again[1], 130);
    assert_eq!(result_code(&again), 2);

    daemon.stop().await;
}

#[tokio::test]
async fn test_protocol_errors() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(config(dir.path())).await;
    let client = TestClient::new().await;

    let version = client.exchange(daemon.address, &[2, 0]).await;
    assert_eq!(version.len(), 8);
    assert_eq!(version[1], 128);
    assert_eq!(result_code(&version), 1);

    let opcode = client.exchange(daemon.address, &[0, 7]).await;
    assert_eq!(opcode[1], 0x87);
    assert_eq!(result_code(&opcode), 5);

    let truncated = client.exchange(daemon.address, &[0, 1, 0, 0, 0x1F, 0x90]).await;
    assert_eq!(truncated[1], 129);
    assert_eq!(result_code(&truncated), 3);

    // A single byte is dropped without an answer
    client.send(daemon.address, &[0]).await;
    assert!(client.recv().await.is_none());

    // Every response carries the epoch
    let now = chrono::Utc::now().timestamp() as u32;
    let epoch = u32::from_be_bytes([version[4], version[5], version[6], version[7]]);
    assert!(now.abs_diff(epoch) <= 5);

    assert!(daemon.store.is_empty().await);
    daemon.stop().await;
}

#[tokio::test]
async fn test_info_via_client() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(config(dir.path())).await;

    let client = Client::connect(daemon.address).await.unwrap();
    match client.request(&Request::Info).await.unwrap() {
        Response::Info {
            external_address, ..
        } => assert_eq!(external_address, Ipv4Addr::new(203, 0, 113, 7)),
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(daemon.metrics.requests.get("info", "success"), 1);

    daemon.stop().await;
}

#[tokio::test]
async fn test_port_outside_allowed_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(Config {
        allowed_ports: vec![PortRange { start: 10000, end: 10100 }],
        ..config(dir.path())
    })
    .await;
    let client = TestClient::new().await;

    let refused = client
        .exchange(daemon.address, &map_request(Transport::Udp, 80, 80, 60))
        .await;
    assert_eq!(result_code(&refused), 2);

    let granted = client
        .exchange(daemon.address, &map_request(Transport::Udp, 80, 10050, 60))
        .await;
    assert_eq!(result_code(&granted), 0);
    assert_eq!(daemon.firewall.rule_count(), 1);

    daemon.stop().await;
}

#[tokio::test]
async fn test_admission_ceiling_under_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(Config {
        max_mappings_per_ip: 4,
        ..config(dir.path())
    })
    .await;
    let client = TestClient::new().await;

    for port in 20000..20012 {
        client
            .send(daemon.address, &map_request(Transport::Tcp, port, port, 600))
            .await;
    }
    let mut codes = Vec::new();
    for _ in 0..12 {
        let response = client.recv().await.expect("missing reply");
        codes.push(result_code(&response));
    }

    assert_eq!(codes.iter().filter(|&&c| c == 0).count(), 4);
    assert_eq!(codes.iter().filter(|&&c| c == 4).count(), 8);
    assert_eq!(daemon.store.count_by_address(Ipv4Addr::LOCALHOST).await, 4);
    assert_eq!(daemon.firewall.rule_count(), 4);

    daemon.stop().await;
}

#[tokio::test]
async fn test_store_and_firewall_agree() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(config(dir.path())).await;
    let client = TestClient::new().await;

    for port in [30000, 30001, 30002] {
        client
            .exchange(daemon.address, &map_request(Transport::Udp, port, port, 600))
            .await;
    }
    client
        .exchange(daemon.address, &map_request(Transport::Udp, 30001, 30001, 0))
        .await;
    // Refresh does not add a rule
    client
        .exchange(daemon.address, &map_request(Transport::Udp, 30000, 30000, 1200))
        .await;

    let mappings = daemon.store.snapshot().await;
    let rules = daemon.firewall.rules();
    assert_eq!(mappings.len(), 2);
    assert_eq!(rules.len(), 2);
    for mapping in &mappings {
        assert!(rules.iter().any(|r| r.handle == mapping.rule_handle && r.matches(mapping)));
    }

    daemon.stop().await;
}

#[tokio::test]
async fn test_firewall_failure_answers_out_of_resources() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(config(dir.path())).await;
    let client = TestClient::new().await;

    daemon.firewall.set_fail_adds(true);
    let response = client
        .exchange(daemon.address, &map_request(Transport::Tcp, 8443, 8443, 60))
        .await;
    assert_eq!(response.len(), 8);
    assert_eq!(result_code(&response), 4);
    assert!(daemon.store.is_empty().await);

    daemon.firewall.set_fail_adds(false);
    let response = client
        .exchange(daemon.address, &map_request(Transport::Tcp, 8443, 8443, 60))
        .await;
    assert_eq!(result_code(&response), 0);

    daemon.firewall.set_fail_removes(true);
    let response = client
        .exchange(daemon.address, &map_request(Transport::Tcp, 8443, 8443, 0))
        .await;
    assert_eq!(result_code(&response), 4);
    assert_eq!(daemon.store.len().await, 1);
    assert_eq!(daemon.firewall.rule_count(), 1);

    daemon.firewall.set_fail_removes(false);
    daemon.stop().await;
}

#[tokio::test]
async fn test_metrics_follow_requests() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = TestDaemon::start(config(dir.path())).await;
    let client = TestClient::new().await;

    client
        .exchange(daemon.address, &map_request(Transport::Udp, 40000, 40000, 600))
        .await;
    client
        .exchange(daemon.address, &map_request(Transport::Tcp, 40001, 40001, 600))
        .await;

    let metrics = daemon.metrics.clone();
    let published = eventually(Duration::from_secs(2), move || {
        let metrics = metrics.clone();
        async move {
            metrics.active_mappings(Transport::Udp) == 1
                && metrics.active_mappings(Transport::Tcp) == 1
        }
    })
    .await;
    assert!(published);
    assert_eq!(daemon.metrics.mappings_created.get("udp", ""), 1);
    assert!(daemon.metrics.render().contains("natpmp_requests_total"));

    daemon.stop().await;
}
