//! NAT-PMP daemon
//!
//! Lifecycle:
//! 1. load persisted mappings (dropping expired ones)
//! 2. bootstrap the firewall chains, fatal on failure
//! 3. bind the listener, fatal on failure
//! 4. re-install rules for the loaded mappings
//! 5. serve requests while the reaper sweeps expired mappings
//! 6. on shutdown, drain in-flight requests and remove every rule; the
//!    state file is kept so the next start restores the mappings

pub mod admission;
mod handler;
pub mod netif;
mod reaper;

pub use admission::AdmissionGate;
pub use handler::{epoch, RequestHandler};
pub use reaper::{ExpiryReaper, SweepReport};

use crate::config::Config;
use crate::firewall::{Firewall, RuleEntry};
use crate::mapping::MappingStore;
use crate::telemetry::{run_snapshot_publisher, MetricsRegistry};
use crate::Result;
use chrono::Utc;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Largest datagram read; NAT-PMP requests are at most 12 bytes
const MAX_DATAGRAM: usize = 1100;

/// UDP front end: one task per datagram
pub struct NatPmpServer<F> {
    socket: Arc<UdpSocket>,
    handler: Arc<RequestHandler<F>>,
}

impl<F: Firewall> NatPmpServer<F> {
    pub async fn bind(address: SocketAddr, handler: Arc<RequestHandler<F>>) -> Result<Self> {
        let socket = UdpSocket::bind(address).await?;
        Ok(Self {
            socket: Arc::new(socket),
            handler,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Answer datagrams until `shutdown` turns true or its sender drops.
    ///
    /// Requests already being handled are finished before this returns.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("Receive error: {}", e);
                            continue;
                        }
                    };
                    let data = buf[..len].to_vec();
                    let handler = self.handler.clone();
                    let socket = self.socket.clone();
                    in_flight.spawn(async move {
                        if let Some(response) = handler.handle(&data, peer).await {
                            if let Err(e) = socket.send_to(&response, peer).await {
                                warn!("Failed to answer {}: {}", peer, e);
                            }
                        }
                    });
                }
                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = joined {
                        error!("Request task failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Listener stopped, draining {} requests", in_flight.len());
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Request task failed: {}", e);
            }
        }
        Ok(())
    }
}

/// Address the listener binds
pub fn listen_address(config: &Config) -> SocketAddr {
    let ip = config
        .listen_address
        .or_else(|| netif::interface_ipv4(&config.listen_interface))
        .unwrap_or_else(|| {
            warn!(
                "{} has no IPv4 address, listening on all addresses",
                config.listen_interface
            );
            Ipv4Addr::UNSPECIFIED
        });
    SocketAddr::V4(SocketAddrV4::new(ip, config.listen_port))
}

/// A started daemon: state loaded, chains ready, listener bound
pub struct Daemon<F> {
    config: Arc<Config>,
    store: Arc<MappingStore>,
    firewall: Arc<F>,
    metrics: Arc<MetricsRegistry>,
    server: NatPmpServer<F>,
}

impl<F: Firewall> Daemon<F> {
    pub async fn start(config: Config, firewall: F, metrics: Arc<MetricsRegistry>) -> Result<Self> {
        let config = Arc::new(config);
        let firewall = Arc::new(firewall);
        let store = Arc::new(MappingStore::new(&config.state_dir, metrics.clone()));

        match store.load(Utc::now()).await {
            Ok(count) => info!("Loaded {} mappings from {}", count, store.path().display()),
            Err(e) => warn!(
                "Failed to load state from {}, starting empty: {}",
                store.path().display(),
                e
            ),
        }

        firewall.ensure_tables_and_chains().await?;

        let handler = Arc::new(RequestHandler::new(
            config.clone(),
            store.clone(),
            firewall.clone(),
            metrics.clone(),
        ));
        let server = NatPmpServer::bind(listen_address(&config), handler).await?;

        let restored = restore_rules(&store, firewall.as_ref()).await;
        if restored > 0 {
            info!("Restored {} forwarding rules", restored);
        }
        info!("NAT-PMP server listening on {}", server.local_addr()?);

        Ok(Self {
            config,
            store,
            firewall,
            metrics,
            server,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    pub fn firewall(&self) -> &Arc<F> {
        &self.firewall
    }

    /// Serve until `shutdown`, then remove every installed rule
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let reaper = ExpiryReaper::new(
            self.store.clone(),
            self.firewall.clone(),
            self.metrics.clone(),
            self.config.cleanup_interval(),
        );
        let reaper = tokio::spawn(reaper.run(shutdown.clone()));
        let publisher = tokio::spawn(run_snapshot_publisher(
            self.store.subscribe(),
            self.metrics.clone(),
            self.config.allowed_ports.clone(),
        ));

        let served = self.server.serve(shutdown).await;

        if let Err(e) = reaper.await {
            error!("Expiry reaper failed: {}", e);
        }
        info!("Shutting down, removing forwarding rules");
        let removed = remove_all_rules(&self.store, self.firewall.as_ref(), &self.metrics).await;
        info!("Removed {} forwarding rules", removed);
        publisher.abort();

        served
    }
}

/// Install rules for every stored mapping, adopting rules already present
async fn restore_rules<F: Firewall>(store: &MappingStore, firewall: &F) -> usize {
    let existing: Vec<RuleEntry> = match firewall.list_rules().await {
        Ok(rules) => rules,
        Err(e) => {
            warn!("Could not list existing rules: {}", e);
            Vec::new()
        }
    };

    let mut restored = 0;
    for mapping in store.snapshot().await {
        let key = mapping.key();
        let handle = match existing.iter().find(|rule| rule.matches(&mapping)) {
            Some(rule) => {
                debug!("Rule for {} already installed (handle {})", key, rule.handle);
                rule.handle
            }
            None => match firewall.add_mapping(mapping).await {
                Ok(installed) => installed.rule_handle,
                Err(e) => {
                    warn!("Failed to restore rule for {}: {}", key, e);
                    continue;
                }
            },
        };
        restored += 1;
        if let Err(e) = store.set_handle(&key, handle).await {
            warn!("Failed to record rule handle for {}: {}", key, e);
        }
    }
    restored
}

/// Remove the rule of every stored mapping, keeping the mappings themselves
async fn remove_all_rules<F: Firewall>(
    store: &MappingStore,
    firewall: &F,
    metrics: &MetricsRegistry,
) -> usize {
    let mut removed = 0;
    for mapping in store.snapshot().await {
        match firewall.remove_mapping(&mapping).await {
            Ok(()) => {
                removed += 1;
                metrics.mapping_deleted(mapping.transport, "shutdown");
            }
            Err(e) => warn!("Failed to remove rule for {} on shutdown: {}", mapping.key(), e),
        }
    }
    removed
}
