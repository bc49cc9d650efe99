//! Node metrics
//!
//! Prometheus-compatible counters, gauges and a latency histogram for the
//! write path, the WAL and consensus. Rendered by the status API at `/metrics`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// A simple histogram implementation for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Create a new histogram with default latency buckets
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    /// Create a histogram with custom bucket boundaries
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        let buckets = (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            boundaries: boundaries.to_vec(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in the histogram
    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .boundaries
            .iter()
            .position(|&boundary| value <= boundary)
            .unwrap_or(self.boundaries.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // stored as microseconds
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with the +Inf bucket
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);

        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }

        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));

        result
    }

    pub fn sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Process-wide metrics registry
#[derive(Debug)]
pub struct MetricsRegistry {
    // write path
    pub writes_total: Counter,
    pub writes_partial: Counter,
    pub points_written: Counter,
    pub forwards_total: Counter,
    pub forward_failures: Counter,
    pub queries_total: Counter,
    pub queries_partial: Counter,
    pub write_latency: Histogram,

    // WAL
    pub wal_appends: Counter,
    pub wal_bytes_appended: Counter,
    pub wal_commits: Counter,
    pub wal_segments_removed: Counter,
    pub wal_entries_recovered: Counter,

    // consensus
    pub raft_term: Gauge,
    pub raft_commit_index: Gauge,
    pub raft_applied_index: Gauge,
    pub raft_elections: Counter,
    pub raft_proposals: Counter,
    pub raft_proposal_failures: Counter,

    // cluster shape
    pub cluster_servers: Gauge,
    pub cluster_shards: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            writes_total: Counter::new(),
            writes_partial: Counter::new(),
            points_written: Counter::new(),
            forwards_total: Counter::new(),
            forward_failures: Counter::new(),
            queries_total: Counter::new(),
            queries_partial: Counter::new(),
            write_latency: Histogram::new(),
            wal_appends: Counter::new(),
            wal_bytes_appended: Counter::new(),
            wal_commits: Counter::new(),
            wal_segments_removed: Counter::new(),
            wal_entries_recovered: Counter::new(),
            raft_term: Gauge::new(),
            raft_commit_index: Gauge::new(),
            raft_applied_index: Gauge::new(),
            raft_elections: Counter::new(),
            raft_proposals: Counter::new(),
            raft_proposal_failures: Counter::new(),
            cluster_servers: Gauge::new(),
            cluster_shards: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    /// Record a coordinated write
    pub fn record_write(&self, duration: Duration, points: usize, complete: bool) {
        self.writes_total.inc();
        self.points_written.add(points as u64);
        self.write_latency.observe(duration.as_secs_f64() * 1000.0);
        if !complete {
            self.writes_partial.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, u64); 16] = [
            ("writes_total", "Coordinated writes", self.writes_total.get()),
            ("writes_partial_total", "Writes not acknowledged by every owner", self.writes_partial.get()),
            ("points_written_total", "Points accepted", self.points_written.get()),
            ("forwards_total", "Shard writes forwarded to peers", self.forwards_total.get()),
            ("forward_failures_total", "Forwarded shard writes that failed", self.forward_failures.get()),
            ("queries_total", "Coordinated queries", self.queries_total.get()),
            ("queries_partial_total", "Queries missing at least one shard", self.queries_partial.get()),
            ("wal_appends_total", "WAL entries appended", self.wal_appends.get()),
            ("wal_bytes_appended_total", "WAL bytes appended", self.wal_bytes_appended.get()),
            ("wal_commits_total", "WAL entries marked applied", self.wal_commits.get()),
            ("wal_segments_removed_total", "WAL segments deleted by compaction", self.wal_segments_removed.get()),
            ("wal_entries_recovered_total", "WAL entries replayed at startup", self.wal_entries_recovered.get()),
            ("raft_elections_total", "Elections started by this node", self.raft_elections.get()),
            ("raft_proposals_total", "Consensus proposals", self.raft_proposals.get()),
            ("raft_proposal_failures_total", "Consensus proposals that failed", self.raft_proposal_failures.get()),
            ("uptime_seconds", "Node uptime in seconds", self.uptime_seconds()),
        ];
        for (name, help, value) in counters {
            let kind = if name == "uptime_seconds" { "gauge" } else { "counter" };
            let _ = writeln!(out, "# HELP chronodb_{} {}", name, help);
            let _ = writeln!(out, "# TYPE chronodb_{} {}", name, kind);
            let _ = writeln!(out, "chronodb_{} {}", name, value);
        }

        let gauges: [(&str, &str, u64); 5] = [
            ("raft_term", "Current raft term", self.raft_term.get()),
            ("raft_commit_index", "Highest committed raft index", self.raft_commit_index.get()),
            ("raft_applied_index", "Highest applied raft index", self.raft_applied_index.get()),
            ("cluster_servers", "Servers in the cluster configuration", self.cluster_servers.get()),
            ("cluster_shards", "Shards in the cluster configuration", self.cluster_shards.get()),
        ];
        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP chronodb_{} {}", name, help);
            let _ = writeln!(out, "# TYPE chronodb_{} gauge", name);
            let _ = writeln!(out, "chronodb_{} {}", name, value);
        }

        out.push_str("# HELP chronodb_write_duration_ms Coordinated write duration in milliseconds\n");
        out.push_str("# TYPE chronodb_write_duration_ms histogram\n");
        for (le, count) in self.write_latency.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "chronodb_write_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "chronodb_write_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "chronodb_write_duration_ms_sum {}", self.write_latency.sum());
        let _ = writeln!(out, "chronodb_write_duration_ms_count {}", self.write_latency.count());

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
