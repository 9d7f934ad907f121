//! In-process daemon and raw UDP client for the integration tests

use natpmpd::config::Config;
use natpmpd::firewall::MemoryFirewall;
use natpmpd::mapping::MappingStore;
use natpmpd::protocol::{MapRequest, Request, Transport};
use natpmpd::server::Daemon;
use natpmpd::telemetry::MetricsRegistry;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Daemon on 127.0.0.1 with an ephemeral port and an in-memory firewall
pub fn config(state_dir: &Path) -> Config {
    Config {
        listen_address: Some(Ipv4Addr::LOCALHOST),
        listen_port: 0,
        external_address: Some(Ipv4Addr::new(203, 0, 113, 7)),
        state_dir: state_dir.to_path_buf(),
        ..Config::default()
    }
}

pub struct TestDaemon {
    pub address: SocketAddr,
    pub store: Arc<MappingStore>,
    pub firewall: Arc<MemoryFirewall>,
    pub metrics: Arc<MetricsRegistry>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<natpmpd::Result<()>>,
}

impl TestDaemon {
    pub async fn start(config: Config) -> Self {
        Self::start_with(config, MemoryFirewall::new()).await
    }

    pub async fn start_with(config: Config, firewall: MemoryFirewall) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        let daemon = Daemon::start(config, firewall, metrics.clone())
            .await
            .expect("daemon failed to start");

        let address = daemon.local_addr().expect("no local address");
        let store = daemon.store().clone();
        let firewall = daemon.firewall().clone();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(daemon.run(rx));

        Self {
            address,
            store,
            firewall,
            metrics,
            shutdown,
            task,
        }
    }

    /// Request shutdown and wait for the daemon to finish cleaning up
    pub async fn stop(self) {
        self.shutdown.send(true).expect("daemon already gone");
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("daemon did not stop")
            .expect("daemon task panicked")
            .expect("daemon returned an error");
    }
}

pub struct TestClient {
    socket: UdpSocket,
}

impl TestClient {
    pub async fn new() -> Self {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind client socket");
        Self { socket }
    }

    pub async fn send(&self, to: SocketAddr, data: &[u8]) {
        self.socket.send_to(data, to).await.expect("send");
    }

    pub async fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = [0u8; 64];
        match tokio::time::timeout(REPLY_TIMEOUT, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            _ => None,
        }
    }

    /// Send and wait for the single reply
    pub async fn exchange(&self, to: SocketAddr, data: &[u8]) -> Vec<u8> {
        self.send(to, data).await;
        self.recv().await.expect("no reply from daemon")
    }
}

pub fn map_request(transport: Transport, internal: u16, external: u16, lifetime: u32) -> Vec<u8> {
    Request::Map(MapRequest {
        transport,
        internal_port: internal,
        external_port: external,
        lifetime,
    })
    .to_bytes()
}

/// Result code field of a response
pub fn result_code(response: &[u8]) -> u16 {
    u16::from_be_bytes([response[2], response[3]])
}

/// Poll `condition` until it holds or `within` elapses
pub async fn eventually<F, Fut>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    condition().await
}
