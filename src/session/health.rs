//! Session health tracking
//!
//! Counts health-check and operation outcomes for the current session and
//! keeps a bounded window of ping latencies for percentiles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

/// Latency samples kept for percentiles
const LATENCY_WINDOW: usize = 256;

/// Consecutive failures before the session is reported unhealthy
const UNHEALTHY_AFTER: u64 = 3;

/// Health counters for one session manager
pub struct HealthMonitor {
    healthy: AtomicBool,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
    last_success: RwLock<Option<DateTime<Utc>>>,
    last_failure: RwLock<Option<DateTime<Utc>>>,
    latencies: RwLock<LatencyWindow>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    /// Create a monitor that starts healthy
    #[must_use]
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            consecutive_failures: AtomicU64::new(0),
            last_success: RwLock::new(None),
            last_failure: RwLock::new(None),
            latencies: RwLock::new(LatencyWindow::new(LATENCY_WINDOW)),
        }
    }

    /// Record a successful check with its round trip
    pub fn record_success(&self, latency: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.last_success.write() = Some(Utc::now());
        self.latencies.write().record(latency);

        if !self.healthy.swap(true, Ordering::Relaxed) {
            info!("Session recovered");
        }
    }

    /// Record a failed check
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self.last_failure.write() = Some(Utc::now());

        if consecutive >= UNHEALTHY_AFTER && self.healthy.swap(false, Ordering::Relaxed) {
            warn!(consecutive_failures = consecutive, "Session marked unhealthy");
        }
    }

    /// Healthy until `UNHEALTHY_AFTER` consecutive failures
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Consecutive failures so far
    #[must_use]
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Snapshot
    #[must_use]
    pub fn metrics(&self) -> HealthMetrics {
        let latencies = self.latencies.read();
        HealthMetrics {
            healthy: self.is_healthy(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures(),
            last_success: *self.last_success.read(),
            last_failure: *self.last_failure.read(),
            latency_p50_ms: latencies.percentile_ms(0.50),
            latency_p95_ms: latencies.percentile_ms(0.95),
            latency_p99_ms: latencies.percentile_ms(0.99),
        }
    }

    /// Start over, e.g. for a fresh session
    pub fn reset(&self) {
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.last_success.write() = None;
        *self.last_failure.write() = None;
        self.latencies.write().clear();
        self.healthy.store(true, Ordering::Relaxed);
    }
}

/// Health counters snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    /// Current verdict
    pub healthy: bool,
    /// Successful checks
    pub successes: u64,
    /// Failed checks
    pub failures: u64,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// Time of the last success
    pub last_success: Option<DateTime<Utc>>,
    /// Time of the last failure
    pub last_failure: Option<DateTime<Utc>>,
    /// Median round trip
    pub latency_p50_ms: Option<u64>,
    /// 95th percentile round trip
    pub latency_p95_ms: Option<u64>,
    /// 99th percentile round trip
    pub latency_p99_ms: Option<u64>,
}

/// Sliding window of latency samples (milliseconds)
struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples
            .push_back(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn percentile_ms(&self, p: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let index = ((sorted.len() as f64) * p).floor() as usize;
        Some(sorted[index.min(sorted.len() - 1)])
    }

    fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_after_three_consecutive_failures() {
        let monitor = HealthMonitor::new();
        monitor.record_failure();
        monitor.record_failure();
        assert!(monitor.is_healthy());
        monitor.record_failure();
        assert!(!monitor.is_healthy());

        monitor.record_success(Duration::from_millis(5));
        assert!(monitor.is_healthy());
        assert_eq!(monitor.consecutive_failures(), 0);
    }

    #[test]
    fn percentiles_over_window() {
        let mut window = LatencyWindow::new(5);
        for ms in 1..=10 {
            window.record(Duration::from_millis(ms * 10));
        }
        assert_eq!(window.samples.len(), 5);
        assert_eq!(window.percentile_ms(0.50), Some(80));
        assert_eq!(window.percentile_ms(0.99), Some(100));
    }

    #[test]
    fn metrics_and_reset() {
        let monitor = HealthMonitor::new();
        monitor.record_success(Duration::from_millis(20));
        monitor.record_failure();
        let metrics = monitor.metrics();
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 1);
        assert!(metrics.last_success.is_some());
        assert_eq!(metrics.latency_p50_ms, Some(20));

        monitor.reset();
        let metrics = monitor.metrics();
        assert_eq!(metrics.successes, 0);
        assert!(metrics.latency_p50_ms.is_none());
    }
}
