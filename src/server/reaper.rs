//! Expiry reaper
//!
//! Periodically drops expired mappings from the store and removes their
//! rules. A rule that fails to go is logged and left behind; the mapping is
//! already gone from the store and the sweep moves on.

use crate::firewall::Firewall;
use crate::mapping::MappingStore;
use crate::telemetry::MetricsRegistry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Result of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub firewall_failures: usize,
}

pub struct ExpiryReaper<F> {
    store: Arc<MappingStore>,
    firewall: Arc<F>,
    metrics: Arc<MetricsRegistry>,
    interval: Duration,
}

impl<F: Firewall> ExpiryReaper<F> {
    pub fn new(
        store: Arc<MappingStore>,
        firewall: Arc<F>,
        metrics: Arc<MetricsRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            firewall,
            metrics,
            interval,
        }
    }

    /// Remove everything expired at `now`
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let expired = self.store.remove_expired(now).await;
        let mut report = SweepReport {
            expired: expired.len(),
            ..SweepReport::default()
        };

        for mapping in &expired {
            info!("Port mapping expired: {}", mapping.key());
            self.metrics.mapping_deleted(mapping.transport, "expired");
            if let Err(e) = self.firewall.remove_mapping(mapping).await {
                warn!("Failed to remove rule for expired {}: {}", mapping.key(), e);
                report.firewall_failures += 1;
            }
        }
        report
    }

    /// Sweep every interval until `shutdown` turns true or its sender drops
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(Utc::now()).await;
                    if report.expired > 0 {
                        debug!("Expiry sweep: {:?}", report);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Expiry reaper stopped");
    }
}
