//! Metrics Collection for GTunnel Relay
//!
//! Atomic counters, a latency ring buffer, and a Prometheus-compatible
//! /metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Transient fetch failure that triggers another attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCause {
    TooLarge,
    OverQuota,
    Closed,
}

/// Relay-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Carrier exchanges answered, including error envelopes
    exchanges: AtomicU64,
    /// Inner status code counts
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    /// Transient fetch failures by cause
    retry_too_large: AtomicU64,
    retry_over_quota: AtomicU64,
    retry_closed: AtomicU64,
    /// Relayed body bytes
    bytes_out: AtomicU64,
    /// Bytes saved by recompression
    bytes_saved: AtomicU64,
    latencies: Mutex<LatencyHistogram>,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    pos: usize,
    count: u64,
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum += latency_us;
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                exchanges: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                retry_too_large: AtomicU64::new(0),
                retry_over_quota: AtomicU64::new(0),
                retry_closed: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                bytes_saved: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
            }),
        }
    }

    /// Record a completed exchange by its inner status
    pub async fn record_exchange(&self, status: u16, latency_us: u64, bytes_out: u64) {
        self.inner.exchanges.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);

        let counter = match status / 100 {
            2 => Some(&self.inner.status_2xx),
            3 => Some(&self.inner.status_3xx),
            4 => Some(&self.inner.status_4xx),
            5 => Some(&self.inner.status_5xx),
            _ => None,
        };
        if let Some(counter) = counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }

        self.inner.latencies.lock().await.record(latency_us);
    }

    pub fn record_retry(&self, cause: RetryCause) {
        let counter = match cause {
            RetryCause::TooLarge => &self.inner.retry_too_large,
            RetryCause::OverQuota => &self.inner.retry_over_quota,
            RetryCause::Closed => &self.inner.retry_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recompression(&self, saved: u64) {
        self.inner.bytes_saved.fetch_add(saved, Ordering::Relaxed);
    }

    pub fn exchanges(&self) -> u64 {
        self.inner.exchanges.load(Ordering::Relaxed)
    }

    pub fn retries(&self, cause: RetryCause) -> u64 {
        match cause {
            RetryCause::TooLarge => self.inner.retry_too_large.load(Ordering::Relaxed),
            RetryCause::OverQuota => self.inner.retry_over_quota.load(Ordering::Relaxed),
            RetryCause::Closed => self.inner.retry_closed.load(Ordering::Relaxed),
        }
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        format!(
r#"# HELP gtunnel_exchanges_total Carrier exchanges answered
# TYPE gtunnel_exchanges_total counter
gtunnel_exchanges_total {}

# HELP gtunnel_exchanges_by_status Exchanges by inner HTTP status class
# TYPE gtunnel_exchanges_by_status counter
gtunnel_exchanges_by_status{{status="2xx"}} {}
gtunnel_exchanges_by_status{{status="3xx"}} {}
gtunnel_exchanges_by_status{{status="4xx"}} {}
gtunnel_exchanges_by_status{{status="5xx"}} {}

# HELP gtunnel_fetch_retries_total Transient fetch failures by cause
# TYPE gtunnel_fetch_retries_total counter
gtunnel_fetch_retries_total{{cause="too_large"}} {}
gtunnel_fetch_retries_total{{cause="over_quota"}} {}
gtunnel_fetch_retries_total{{cause="closed"}} {}

# HELP gtunnel_bytes_total Relayed body bytes
# TYPE gtunnel_bytes_total counter
gtunnel_bytes_total{{kind="out"}} {}
gtunnel_bytes_total{{kind="saved"}} {}

# HELP gtunnel_latency_us Exchange latency in microseconds
# TYPE gtunnel_latency_us summary
gtunnel_latency_us{{quantile="0.5"}} {}
gtunnel_latency_us{{quantile="0.95"}} {}
gtunnel_latency_us{{quantile="0.99"}} {}
gtunnel_latency_us_avg {}
"#,
            self.inner.exchanges.load(Ordering::Relaxed),
            self.inner.status_2xx.load(Ordering::Relaxed),
            self.inner.status_3xx.load(Ordering::Relaxed),
            self.inner.status_4xx.load(Ordering::Relaxed),
            self.inner.status_5xx.load(Ordering::Relaxed),
            self.inner.retry_too_large.load(Ordering::Relaxed),
            self.inner.retry_over_quota.load(Ordering::Relaxed),
            self.inner.retry_closed.load(Ordering::Relaxed),
            self.inner.bytes_out.load(Ordering::Relaxed),
            self.inner.bytes_saved.load(Ordering::Relaxed),
            p50, p95, p99, avg,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
