//! Atomic counters for admission and commit outcomes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::budget::DenyReason;

/// Monotonic event count.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Holds currently outstanding, with the high-water mark since start.
///
/// Never drops below zero: a close without a matching open is ignored.
#[derive(Debug, Default)]
pub struct InFlightGauge {
    current: AtomicU64,
    peak: AtomicU64,
}

impl InFlightGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        let now = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
    }

    pub fn close(&self) {
        let _ = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }
}

/// Upper bounds (ms) of the commit latency buckets; one overflow bucket follows.
const LATENCY_BOUNDS_MS: [f64; 9] = [1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 1000.0];

/// Store round-trip latency of commits in fixed buckets.
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BOUNDS_MS.len() + 1],
    total_us: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, latency_ms: f64) {
        let idx = LATENCY_BOUNDS_MS
            .iter()
            .position(|&bound| latency_ms <= bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.total_us
            .fetch_add((latency_ms.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    pub fn mean_ms(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.total_us.load(Ordering::Relaxed) as f64 / 1000.0 / n as f64,
        }
    }

    /// Upper bound of the bucket holding the `q` quantile. `None` when nothing
    /// was observed or the quantile falls in the overflow bucket.
    pub fn quantile_bound_ms(&self, q: f64) -> Option<f64> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        let rank = ((count as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                return LATENCY_BOUNDS_MS.get(idx).copied();
            }
        }
        None
    }
}

/// Ledger metrics registry, shared by the admission path and the recorder.
#[derive(Debug)]
pub struct LedgerMetrics {
    pub admitted: Counter,
    pub denied_at_limit: Counter,
    pub denied_would_exceed: Counter,
    pub denied_not_allowed: Counter,
    pub commits_applied: Counter,
    pub committed_cents: Counter,
    pub commits_duplicate: Counter,
    /// Commits refused because the period had already closed. Spend that
    /// happened but is not billed.
    pub commits_rejected: Counter,
    /// Commits that never reached the store after retries.
    pub commits_lost: Counter,
    pub limits_crossed: Counter,
    pub reservations_released: Counter,
    pub reservations_expired: Counter,
    pub store_errors: Counter,
    pub open_reservations: InFlightGauge,
    pub commit_latency_ms: LatencyHistogram,
}

impl Default for LedgerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerMetrics {
    pub fn new() -> Self {
        Self {
            admitted: Counter::new(),
            denied_at_limit: Counter::new(),
            denied_would_exceed: Counter::new(),
            denied_not_allowed: Counter::new(),
            commits_applied: Counter::new(),
            committed_cents: Counter::new(),
            commits_duplicate: Counter::new(),
            commits_rejected: Counter::new(),
            commits_lost: Counter::new(),
            limits_crossed: Counter::new(),
            reservations_released: Counter::new(),
            reservations_expired: Counter::new(),
            store_errors: Counter::new(),
            open_reservations: InFlightGauge::new(),
            commit_latency_ms: LatencyHistogram::new(),
        }
    }

    pub fn record_admitted(&self, holds_reservation: bool) {
        self.admitted.inc();
        if holds_reservation {
            self.open_reservations.open();
        }
    }

    pub fn record_denied(&self, reason: DenyReason) {
        match reason {
            DenyReason::AlreadyAtLimit => self.denied_at_limit.inc(),
            DenyReason::WouldExceed => self.denied_would_exceed.inc(),
        }
    }

    pub fn record_applied(&self, cost_cents: u64, crossed_limit: bool, latency_ms: f64) {
        self.commits_applied.inc();
        self.committed_cents.add(cost_cents);
        if crossed_limit {
            self.limits_crossed.inc();
        }
        self.commit_latency_ms.observe(latency_ms);
    }

    pub fn record_released(&self) {
        self.reservations_released.inc();
    }

    /// A held reservation left the admitted state (settled, failed or dropped).
    pub fn record_closed(&self) {
        self.open_reservations.close();
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary::from_registry(self)
    }
}

/// Point-in-time snapshot of [`LedgerMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub admitted: u64,
    pub denied: u64,
    pub denied_at_limit: u64,
    pub denied_would_exceed: u64,
    pub denied_not_allowed: u64,
    pub commits_applied: u64,
    pub committed_cents: u64,
    pub commits_duplicate: u64,
    pub commits_rejected: u64,
    pub commits_lost: u64,
    pub limits_crossed: u64,
    pub reservations_released: u64,
    pub reservations_expired: u64,
    pub store_errors: u64,
    pub open_reservations: u64,
    pub peak_open_reservations: u64,
    pub avg_commit_latency_ms: f64,
    pub p95_commit_latency_ms: Option<f64>,
}

impl MetricsSummary {
    pub fn from_registry(registry: &LedgerMetrics) -> Self {
        let denied_at_limit = registry.denied_at_limit.get();
        let denied_would_exceed = registry.denied_would_exceed.get();
        let denied_not_allowed = registry.denied_not_allowed.get();

        Self {
            admitted: registry.admitted.get(),
            denied: denied_at_limit + denied_would_exceed + denied_not_allowed,
            denied_at_limit,
            denied_would_exceed,
            denied_not_allowed,
            commits_applied: registry.commits_applied.get(),
            committed_cents: registry.committed_cents.get(),
            commits_duplicate: registry.commits_duplicate.get(),
            commits_rejected: registry.commits_rejected.get(),
            commits_lost: registry.commits_lost.get(),
            limits_crossed: registry.limits_crossed.get(),
            reservations_released: registry.reservations_released.get(),
            reservations_expired: registry.reservations_expired.get(),
            store_errors: registry.store_errors.get(),
            open_reservations: registry.open_reservations.current(),
            peak_open_reservations: registry.open_reservations.peak(),
            avg_commit_latency_ms: registry.commit_latency_ms.mean_ms(),
            p95_commit_latency_ms: registry.commit_latency_ms.quantile_bound_ms(0.95),
        }
    }

    /// Spend that happened but was not billed.
    pub fn unbilled_commits(&self) -> u64 {
        self.commits_rejected + self.commits_lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        assert_eq!(counter.get(), 0);
        counter.inc();
        counter.add(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_in_flight_gauge_tracks_peak() {
        let gauge = InFlightGauge::new();
        gauge.open();
        gauge.open();
        gauge.close();
        gauge.open();
        assert_eq!(gauge.current(), 2);
        assert_eq!(gauge.peak(), 2);

        gauge.close();
        gauge.close();
        gauge.close();
        assert_eq!(gauge.current(), 0);
    }

    #[test]
    fn test_latency_quantiles() {
        let hist = LatencyHistogram::new();
        assert_eq!(hist.quantile_bound_ms(0.95), None);

        for _ in 0..19 {
            hist.observe(0.8);
        }
        hist.observe(40.0);
        assert_eq!(hist.count(), 20);
        assert_eq!(hist.quantile_bound_ms(0.95), Some(1.0));
        assert_eq!(hist.quantile_bound_ms(1.0), Some(50.0));
        assert!((hist.mean_ms() - 2.76).abs() < 0.01);

        hist.observe(5_000.0);
        assert_eq!(hist.quantile_bound_ms(1.0), None);
    }

    #[test]
    fn test_ledger_metrics_summary() {
        let metrics = LedgerMetrics::new();
        metrics.record_admitted(true);
        metrics.record_denied(DenyReason::WouldExceed);
        metrics.record_denied(DenyReason::AlreadyAtLimit);
        metrics.record_applied(80, false, 2.0);
        metrics.record_applied(120, true, 4.0);
        metrics.record_released();
        metrics.record_closed();
        metrics.commits_rejected.inc();

        let summary = metrics.summary();
        assert_eq!(summary.admitted, 1);
        assert_eq!(summary.denied, 2);
        assert_eq!(summary.committed_cents, 200);
        assert_eq!(summary.limits_crossed, 1);
        assert_eq!(summary.open_reservations, 0);
        assert_eq!(summary.unbilled_commits(), 1);
        assert!((summary.avg_commit_latency_ms - 3.0).abs() < 0.01);
        assert_eq!(summary.peak_open_reservations, 1);
        assert_eq!(summary.p95_commit_latency_ms, Some(5.0));
    }
}
