pub mod console;
pub mod exporter;

use std::time::Duration;

pub use self::console::ConsoleSink;
pub use self::exporter::{Exporter, PrometheusSink};

/// HDR histogram for precise latency percentiles.
///
/// Sinks are driven from a single funnel task, so no locking here.
pub struct LatencyHistogram {
    inner: hdrhistogram::Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        // 1µs to 10min with 3 significant figures; reference completions can take minutes
        let inner = hdrhistogram::Histogram::new_with_bounds(1_000, 600_000_000_000, 3)
            .expect("Failed to create HDR histogram");
        Self { inner }
    }

    pub fn record(&mut self, latency: Duration) {
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        // clamp to minimum 1µs, saturate at the upper bound
        self.inner.saturating_record(ns.max(1_000));
    }

    pub fn count(&self) -> u64 {
        self.inner.len()
    }

    pub fn percentile_ns(&self, percentile: f64) -> u64 {
        self.inner.value_at_percentile(percentile)
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }

    /// Snapshot of the interesting percentiles
    pub fn exact_percentiles(&self) -> ExactPercentiles {
        let hist = &self.inner;
        ExactPercentiles {
            min_ns: hist.min(),
            max_ns: hist.max(),
            mean_ns: hist.mean(),
            p50_ns: hist.value_at_percentile(50.0),
            p95_ns: hist.value_at_percentile(95.0),
            p99_ns: hist.value_at_percentile(99.0),
            p999_ns: hist.value_at_percentile(99.9),
            count: hist.len(),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExactPercentiles {
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    pub p999_ns: u64,
    pub count: u64,
}

/// Format a count with suffixes
pub fn format_count(count: u64) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1_000_000_000.0)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1_000.0)
    } else {
        format!("{}", count)
    }
}

/// Format latency in nanoseconds to a human-readable string
pub fn format_latency_ns(ns: u64) -> String {
    if ns >= 1_000_000_000 {
        format!("{:.2}s", ns as f64 / 1_000_000_000.0)
    } else if ns >= 1_000_000 {
        format!("{:.2}ms", ns as f64 / 1_000_000.0)
    } else if ns >= 1_000 {
        format!("{:.2}µs", ns as f64 / 1_000.0)
    } else {
        format!("{}ns", ns)
    }
}

/// Format bytes to human-readable string
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000_000 {
        format!("{:.2} GB", bytes as f64 / 1_000_000_000.0)
    } else if bytes >= 1_000_000 {
        format!("{:.2} MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.2} KB", bytes as f64 / 1_000.0)
    } else {
        format!("{} B", bytes)
    }
}
