//! NAT-PMP request handling
//!
//! Turns one datagram into at most one response datagram. Map requests are
//! reconciled against the store and the firewall:
//!
//! - create: firewall rule first, then the store; a store failure removes
//!   the rule again
//! - delete: store first, then the firewall; a firewall failure puts the
//!   mapping back into the store
//! - refresh: store only, the rule content does not change

use super::admission::AdmissionGate;
use super::netif;
use crate::config::Config;
use crate::firewall::Firewall;
use crate::mapping::{Mapping, MappingKey, MappingStore};
use crate::protocol::{DecodeError, MapRequest, Opcode, Request, Response, ResultCode};
use crate::telemetry::MetricsRegistry;
use crate::Error;
use chrono::{DateTime, Utc};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Why a map request was refused
#[derive(Debug)]
enum Rejection {
    /// Client is at its mapping ceiling
    Limit,
    /// Port outside the allowed ranges, delete of an unknown mapping,
    /// or a client we cannot map
    NotAuthorized,
    State(Error),
    Firewall(Error),
}

impl Rejection {
    fn result_code(&self) -> ResultCode {
        match self {
            Rejection::NotAuthorized => ResultCode::NotAuthorized,
            Rejection::Limit | Rejection::State(_) | Rejection::Firewall(_) => {
                ResultCode::OutOfResources
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Rejection::Limit => "error_limit",
            Rejection::NotAuthorized => "error_refused",
            Rejection::State(_) => "error_state",
            Rejection::Firewall(_) => "error_nft",
        }
    }
}

fn decode_label(error: &DecodeError) -> &'static str {
    match error {
        DecodeError::UnsupportedVersion { .. } => "error_version",
        DecodeError::UnsupportedOpcode { .. } => "error_opcode",
        _ => "error_network",
    }
}

/// Seconds since the Unix epoch, as carried in every response
pub fn epoch(now: DateTime<Utc>) -> u32 {
    now.timestamp() as u32
}

pub struct RequestHandler<F> {
    config: Arc<Config>,
    store: Arc<MappingStore>,
    firewall: Arc<F>,
    metrics: Arc<MetricsRegistry>,
    admission: AdmissionGate,
}

impl<F: Firewall> RequestHandler<F> {
    pub fn new(
        config: Arc<Config>,
        store: Arc<MappingStore>,
        firewall: Arc<F>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            firewall,
            metrics,
            admission: AdmissionGate::new(),
        }
    }

    /// Handle one datagram from `client`, returning the response to send.
    ///
    /// `None` means the datagram is dropped without an answer.
    pub async fn handle(&self, data: &[u8], client: SocketAddr) -> Option<Vec<u8>> {
        let started = Instant::now();
        let now = Utc::now();

        let request = match Request::parse(data) {
            Ok(request) => request,
            Err(e) => return self.reject_undecodable(&e, client, now),
        };

        let opcode = request.opcode();
        let (response, label) = match request {
            Request::Info => (self.info(now), "success"),
            Request::Map(map) => match self.map(map, client, now).await {
                Ok(response) => (response, "success"),
                Err(rejection) => {
                    match &rejection {
                        Rejection::State(e) | Rejection::Firewall(e) => {
                            error!("{} request from {} failed: {}", opcode.label(), client, e)
                        }
                        Rejection::Limit | Rejection::NotAuthorized => debug!(
                            "Refused {} request from {}: {:?}",
                            opcode.label(),
                            client,
                            rejection
                        ),
                    }
                    let response = Response::Error {
                        opcode: opcode as u8,
                        result: rejection.result_code(),
                        epoch: epoch(now),
                    };
                    (response, rejection.label())
                }
            },
        };

        self.metrics.record_request(opcode.label(), label);
        self.metrics
            .observe_request_duration(opcode, started.elapsed());
        Some(response.to_bytes())
    }

    fn reject_undecodable(
        &self,
        error: &DecodeError,
        client: SocketAddr,
        now: DateTime<Utc>,
    ) -> Option<Vec<u8>> {
        let (Some(result), Some(opcode)) = (error.result_code(), error.opcode()) else {
            debug!("Dropping datagram from {}: {}", client, error);
            self.metrics.record_request("unknown", "dropped");
            return None;
        };

        debug!("Rejecting datagram from {}: {}", client, error);
        let request_type = Opcode::from_u8(opcode).map_or("unknown", |op| op.label());
        self.metrics.record_request(request_type, decode_label(error));
        Some(
            Response::Error {
                opcode,
                result,
                epoch: epoch(now),
            }
            .to_bytes(),
        )
    }

    fn info(&self, now: DateTime<Utc>) -> Response {
        let external_address = self
            .config
            .external_address
            .or_else(|| netif::interface_ipv4(&self.config.external_interface))
            .unwrap_or_else(|| {
                debug!(
                    "{} has no IPv4 address, answering {}",
                    self.config.external_interface,
                    Ipv4Addr::UNSPECIFIED
                );
                Ipv4Addr::UNSPECIFIED
            });

        Response::Info {
            epoch: epoch(now),
            external_address,
        }
    }

    async fn map(
        &self,
        request: MapRequest,
        client: SocketAddr,
        now: DateTime<Utc>,
    ) -> Result<Response, Rejection> {
        let address = match client.ip() {
            IpAddr::V4(address) => address,
            IpAddr::V6(address) => address.to_ipv4_mapped().ok_or(Rejection::NotAuthorized)?,
        };

        let lifetime = self.config.clamp_lifetime(request.lifetime);
        let external_port = match request.external_port {
            0 => request.internal_port,
            port => port,
        };
        let key = MappingKey::new(address, request.internal_port, external_port, request.transport);

        let _permit = self.admission.acquire(address).await;
        // Applies to every map request, refresh and delete included
        if self.store.count_by_address(address).await >= self.config.max_mappings_per_ip {
            return Err(Rejection::Limit);
        }
        if !self.config.is_port_allowed(external_port) {
            return Err(Rejection::NotAuthorized);
        }

        let existing = self.store.find(&key).await;

        let granted = match (existing, lifetime) {
            (Some(mapping), 0) => {
                self.delete(mapping).await?;
                0
            }
            (Some(_), lifetime) => {
                self.store
                    .update(&key, lifetime, now)
                    .await
                    .map_err(Rejection::State)?;
                debug!("Refreshed mapping {} for {}s", key, lifetime);
                lifetime
            }
            (None, 0) => return Err(Rejection::NotAuthorized),
            (None, lifetime) => {
                self.create(key, lifetime, now).await?;
                lifetime
            }
        };

        Ok(Response::Map {
            transport: key.transport,
            epoch: epoch(now),
            internal_port: key.internal_port,
            external_port: key.external_port,
            lifetime: granted,
        })
    }

    async fn create(
        &self,
        key: MappingKey,
        lifetime: u32,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        let installed = self
            .firewall
            .add_mapping(Mapping::new(key, lifetime, now))
            .await
            .map_err(Rejection::Firewall)?;

        if let Err(e) = self.store.add(installed.clone()).await {
            warn!("Could not record mapping {}, removing its rule: {}", key, e);
            if matches!(e, Error::Persist { .. }) {
                // Memory kept the entry although the file did not
                if let Err(e) = self.store.remove(&key).await {
                    debug!("Discarding unpersisted mapping {}: {}", key, e);
                }
            }
            if let Err(rollback) = self.firewall.remove_mapping(&installed).await {
                error!("Rule for {} left orphaned: {}", key, rollback);
            }
            return Err(Rejection::State(e));
        }

        self.metrics.mapping_created(key.transport);
        info!("Port mapping created: {} for {}s", key, lifetime);
        Ok(())
    }

    async fn delete(&self, mapping: Mapping) -> Result<(), Rejection> {
        let key = mapping.key();

        if let Err(e) = self.store.remove(&key).await {
            if matches!(e, Error::Persist { .. }) {
                // The rule is untouched, so memory must keep tracking it
                if let Err(e) = self.store.add(mapping).await {
                    debug!("Restoring mapping {} after failed delete: {}", key, e);
                }
            }
            return Err(Rejection::State(e));
        }

        if let Err(e) = self.firewall.remove_mapping(&mapping).await {
            if let Err(restore) = self.store.add(mapping).await {
                error!("Mapping {} lost while its rule remains: {}", key, restore);
            }
            return Err(Rejection::Firewall(e));
        }

        self.metrics.mapping_deleted(key.transport, "deleted");
        info!("Port mapping removed: {}", key);
        Ok(())
    }
}
