//! Metrics collection for the NAT-PMP responder.
//!
//! Thread-safe counters updated on the request path, plus gauges that are
//! recomputed from store snapshots. `render` produces the Prometheus text
//! exposition format.

use crate::config::PortRange;
use crate::mapping::Mapping;
use crate::protocol::{Opcode, Transport};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counter family keyed by up to two static label values.
#[derive(Debug)]
pub struct LabeledCounter {
    labels: [&'static str; 2],
    values: RwLock<BTreeMap<(&'static str, &'static str), u64>>,
}

impl LabeledCounter {
    pub fn new(first: &'static str, second: &'static str) -> Self {
        Self {
            labels: [first, second],
            values: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn inc(&self, first: &'static str, second: &'static str) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        *values.entry((first, second)).or_insert(0) += 1;
    }

    pub fn get(&self, first: &'static str, second: &'static str) -> u64 {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(&(first, second)).copied().unwrap_or(0)
    }

    /// Sum over every second label
    pub fn total(&self, first: &'static str) -> u64 {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values
            .iter()
            .filter(|((f, _), _)| *f == first)
            .map(|(_, v)| *v)
            .sum()
    }

    fn render(&self, out: &mut String, name: &str, help: &str) {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} counter", name);
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        for ((first, second), value) in values.iter() {
            if self.labels[1].is_empty() {
                let _ = writeln!(out, "{}{{{}=\"{}\"}} {}", name, self.labels[0], first, value);
            } else {
                let _ = writeln!(
                    out,
                    "{}{{{}=\"{}\",{}=\"{}\"}} {}",
                    name, self.labels[0], first, self.labels[1], second, value
                );
            }
        }
    }
}

/// Default Prometheus latency buckets, in seconds.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; DURATION_BUCKETS.len()],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        for (bound, bucket) in DURATION_BUCKETS.iter().zip(&self.buckets) {
            if secs <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String, name: &str, label: &str) {
        for (bound, bucket) in DURATION_BUCKETS.iter().zip(&self.buckets) {
            let _ = writeln!(
                out,
                "{}_bucket{{request_type=\"{}\",le=\"{}\"}} {}",
                name,
                label,
                bound,
                bucket.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(
            out,
            "{}_bucket{{request_type=\"{}\",le=\"+Inf\"}} {}",
            name,
            label,
            self.count()
        );
        let _ = writeln!(
            out,
            "{}_sum{{request_type=\"{}\"}} {}",
            name,
            label,
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );
        let _ = writeln!(out, "{}_count{{request_type=\"{}\"}} {}", name, label, self.count());
    }
}

/// Gauges derived from the latest store snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotGauges {
    /// Active mappings per transport
    pub active: BTreeMap<Transport, u64>,
    /// Active mappings per client address
    pub per_client: BTreeMap<Ipv4Addr, u64>,
    /// Active mappings whose external port falls in each allowed range
    pub port_range_usage: Vec<(PortRange, u64)>,
}

impl SnapshotGauges {
    pub fn from_mappings(mappings: &[Mapping], ranges: &[PortRange]) -> Self {
        let mut gauges = SnapshotGauges {
            active: Transport::ALL.iter().map(|t| (*t, 0)).collect(),
            per_client: BTreeMap::new(),
            port_range_usage: ranges.iter().map(|r| (*r, 0)).collect(),
        };
        for mapping in mappings {
            *gauges.active.entry(mapping.transport).or_insert(0) += 1;
            *gauges.per_client.entry(mapping.internal_address).or_insert(0) += 1;
            for (range, used) in gauges.port_range_usage.iter_mut() {
                if range.contains(mapping.external_port) {
                    *used += 1;
                }
            }
        }
        gauges
    }
}

/// Telemetry sink for the responder.
#[derive(Debug)]
pub struct MetricsRegistry {
    /// Requests by (request type, result)
    pub requests: LabeledCounter,
    /// Mappings created by transport
    pub mappings_created: LabeledCounter,
    /// Mappings expired by transport
    pub mappings_expired: LabeledCounter,
    /// Mappings deleted by (transport, reason)
    pub mappings_deleted: LabeledCounter,
    /// State file operations by (operation, status)
    pub state_operations: LabeledCounter,
    /// Firewall operations by (operation, status)
    pub firewall_operations: LabeledCounter,
    /// Number of snapshots applied to the gauges
    pub snapshots_applied: Counter,

    request_duration: [Histogram; 3],
    gauges: RwLock<SnapshotGauges>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn status(ok: bool) -> &'static str {
    if ok { "success" } else { "error" }
}

impl MetricsRegistry {
    /// Creates a new metrics registry.
    pub fn new() -> Self {
        Self {
            requests: LabeledCounter::new("type", "result"),
            mappings_created: LabeledCounter::new("protocol", ""),
            mappings_expired: LabeledCounter::new("protocol", ""),
            mappings_deleted: LabeledCounter::new("protocol", "reason"),
            state_operations: LabeledCounter::new("operation", "status"),
            firewall_operations: LabeledCounter::new("operation", "status"),
            snapshots_applied: Counter::new(),
            request_duration: Default::default(),
            gauges: RwLock::new(SnapshotGauges::default()),
        }
    }

    /// Records one answered (or dropped) request.
    pub fn record_request(&self, request_type: &'static str, result: &'static str) {
        self.requests.inc(request_type, result);
    }

    /// Records handling latency for a decoded request.
    pub fn observe_request_duration(&self, opcode: Opcode, elapsed: Duration) {
        self.request_duration[opcode as usize].observe(elapsed);
    }

    pub fn request_duration(&self, opcode: Opcode) -> &Histogram {
        &self.request_duration[opcode as usize]
    }

    pub fn record_state(&self, operation: &'static str, ok: bool) {
        self.state_operations.inc(operation, status(ok));
    }

    pub fn record_firewall(&self, operation: &'static str, ok: bool) {
        self.firewall_operations.inc(operation, status(ok));
    }

    pub fn mapping_created(&self, transport: Transport) {
        self.mappings_created.inc(transport.as_str(), "");
    }

    /// Records a removal; `reason` is one of deleted, expired, shutdown.
    pub fn mapping_deleted(&self, transport: Transport, reason: &'static str) {
        if reason == "expired" {
            self.mappings_expired.inc(transport.as_str(), "");
        }
        self.mappings_deleted.inc(transport.as_str(), reason);
    }

    /// Replaces the snapshot gauges.
    pub fn apply_snapshot(&self, mappings: &[Mapping], ranges: &[PortRange]) {
        let gauges = SnapshotGauges::from_mappings(mappings, ranges);
        *self.gauges.write().unwrap_or_else(PoisonError::into_inner) = gauges;
        self.snapshots_applied.inc();
    }

    pub fn gauges(&self) -> SnapshotGauges {
        self.gauges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active_mappings(&self, transport: Transport) -> u64 {
        let gauges = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
        gauges.active.get(&transport).copied().unwrap_or(0)
    }

    /// Renders every metric in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.requests
            .render(&mut out, "natpmp_requests_total", "Total NAT-PMP requests");
        self.mappings_created.render(
            &mut out,
            "natpmp_mappings_created_total",
            "Total port mappings created",
        );
        self.mappings_expired.render(
            &mut out,
            "natpmp_mappings_expired_total",
            "Total port mappings expired",
        );
        self.mappings_deleted.render(
            &mut out,
            "natpmp_mappings_deleted_total",
            "Total port mappings deleted",
        );
        self.state_operations.render(
            &mut out,
            "natpmp_state_operations_total",
            "State file operations",
        );
        self.firewall_operations.render(
            &mut out,
            "natpmp_nftables_operations_total",
            "Firewall rule operations",
        );

        let gauges = self.gauges();
        let _ = writeln!(out, "# HELP natpmp_active_mappings Active port mappings");
        let _ = writeln!(out, "# TYPE natpmp_active_mappings gauge");
        for (transport, count) in &gauges.active {
            let _ = writeln!(out, "natpmp_active_mappings{{protocol=\"{}\"}} {}", transport, count);
        }
        let _ = writeln!(out, "# HELP natpmp_client_mappings Active mappings per client");
        let _ = writeln!(out, "# TYPE natpmp_client_mappings gauge");
        for (client, count) in &gauges.per_client {
            let _ = writeln!(out, "natpmp_client_mappings{{client_ip=\"{}\"}} {}", client, count);
        }
        let _ = writeln!(out, "# HELP natpmp_port_range_usage Mappings per allowed port range");
        let _ = writeln!(out, "# TYPE natpmp_port_range_usage gauge");
        for (range, count) in &gauges.port_range_usage {
            let _ = writeln!(
                out,
                "natpmp_port_range_usage{{range=\"{}-{}\"}} {}",
                range.start, range.end, count
            );
        }

        let name = "natpmp_request_duration_seconds";
        let _ = writeln!(out, "# HELP {} NAT-PMP request handling latency", name);
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for opcode in [Opcode::Info, Opcode::MapUdp, Opcode::MapTcp] {
            self.request_duration(opcode)
                .render(&mut out, name, opcode.label());
        }
        out
    }
}
