//! Telemetry module for logging and metrics.
//!
//! Provides:
//! - Logging configuration and initialization
//! - The metrics registry the core reports into
//! - The snapshot publisher that keeps mapping gauges current

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig};
pub use metrics::{Counter, Histogram, LabeledCounter, MetricsRegistry, SnapshotGauges};

use crate::config::PortRange;
use crate::mapping::store::Snapshot;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Applies every store snapshot to the gauges until the store is dropped.
///
/// Snapshots are published after a mutation commits, so the gauges always
/// trail the store and never observe a half-applied change.
pub async fn run_snapshot_publisher(
    mut snapshots: watch::Receiver<Snapshot>,
    metrics: Arc<MetricsRegistry>,
    ranges: Vec<PortRange>,
) {
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        metrics.apply_snapshot(&snapshot, &ranges);
        debug!("Applied mapping snapshot ({} active)", snapshot.len());

        if snapshots.changed().await.is_err() {
            break;
        }
    }
}
