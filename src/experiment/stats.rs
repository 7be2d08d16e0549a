//! Rolling per-backend performance windows
//!
//! Samples land in per-minute buckets held in a bounded deque. Each bucket
//! keeps counts plus an incrementally updated latency mean (Welford form),
//! so no raw sample is retained and no full re-scan happens on update. The
//! merged view across buckets is a count-weighted combination, which equals
//! a recomputation over the raw samples up to floating-point error.
//!
//! Within a window, counts only grow; buckets leave only through `prune`,
//! which the controller calls from its periodic tick.

use serde::Serialize;
use std::collections::VecDeque;

/// Bounded ring of recent success latencies for the percentile estimate
const RECENT_LATENCY_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    Success,
    Failure,
    Cancelled,
}

impl SampleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MinuteBucket {
    minute: u64,
    count: u64,
    successes: u64,
    failures: u64,
    cancellations: u64,
    /// Mean latency over this bucket's successes, milliseconds
    latency_mean_ms: f64,
    latency_count: u64,
}

impl MinuteBucket {
    fn new(minute: u64) -> Self {
        Self {
            minute,
            count: 0,
            successes: 0,
            failures: 0,
            cancellations: 0,
            latency_mean_ms: 0.0,
            latency_count: 0,
        }
    }

    fn record(&mut self, outcome: SampleOutcome, duration_ms: u64) {
        self.count += 1;
        match outcome {
            SampleOutcome::Success => {
                self.successes += 1;
                self.latency_count += 1;
                let x = duration_ms as f64;
                self.latency_mean_ms += (x - self.latency_mean_ms) / self.latency_count as f64;
            }
            SampleOutcome::Failure => self.failures += 1,
            SampleOutcome::Cancelled => self.cancellations += 1,
        }
    }
}

/// Merged view over a backend's current window
///
/// Rates are computed over decided samples (successes plus failures);
/// cancellations appear in `count` but sway neither rate. Latency figures
/// cover successes only, so timeout-bound failures cannot mask a healthy
/// latency profile.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendAggregate {
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancellations: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
}

impl BackendAggregate {
    /// Samples that resolved to success or failure
    pub fn decided(&self) -> u64 {
        self.successes + self.failures
    }
}

#[derive(Debug)]
pub(crate) struct BackendWindow {
    window_seconds: u64,
    buckets: VecDeque<MinuteBucket>,
    recent_latencies: VecDeque<f64>,
}

impl BackendWindow {
    pub fn new(window_seconds: u64) -> Self {
        Self {
            window_seconds,
            buckets: VecDeque::new(),
            recent_latencies: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now_epoch_secs: u64, outcome: SampleOutcome, duration_ms: u64) {
        let minute = now_epoch_secs / 60;
        let needs_new = self
            .buckets
            .back()
            .map(|b| b.minute != minute)
            .unwrap_or(true);
        if needs_new {
            self.buckets.push_back(MinuteBucket::new(minute));
        }
        if let Some(bucket) = self.buckets.back_mut() {
            bucket.record(outcome, duration_ms);
        }

        if outcome == SampleOutcome::Success {
            if self.recent_latencies.len() == RECENT_LATENCY_CAP {
                self.recent_latencies.pop_front();
            }
            self.recent_latencies.push_back(duration_ms as f64);
        }
    }

    /// Drop buckets that fell out of the retention window
    pub fn prune(&mut self, now_epoch_secs: u64) {
        let cutoff_minute = now_epoch_secs.saturating_sub(self.window_seconds) / 60;
        while let Some(front) = self.buckets.front() {
            if front.minute < cutoff_minute {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn aggregate(&self) -> BackendAggregate {
        let mut aggregate = BackendAggregate::default();
        let mut latency_weight = 0u64;
        let mut latency_sum = 0.0f64;

        for bucket in &self.buckets {
            aggregate.count += bucket.count;
            aggregate.successes += bucket.successes;
            aggregate.failures += bucket.failures;
            aggregate.cancellations += bucket.cancellations;
            latency_weight += bucket.latency_count;
            latency_sum += bucket.latency_mean_ms * bucket.latency_count as f64;
        }

        let decided = aggregate.successes + aggregate.failures;
        if decided > 0 {
            aggregate.success_rate = aggregate.successes as f64 / decided as f64;
            aggregate.error_rate = aggregate.failures as f64 / decided as f64;
        }
        if latency_weight > 0 {
            aggregate.mean_latency_ms = latency_sum / latency_weight as f64;
        }
        aggregate.p95_latency_ms = self.p95();
        aggregate
    }

    /// Approximate p95 over the bounded ring of recent success latencies
    fn p95(&self) -> f64 {
        if self.recent_latencies.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.recent_latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_mean_matches_recompute() {
        let mut window = BackendWindow::new(900);
        let latencies = [120u64, 80, 310, 45, 200, 95, 150];
        for (i, latency) in latencies.iter().enumerate() {
            window.record(1_000 + i as u64, SampleOutcome::Success, *latency);
        }

        let recomputed: f64 =
            latencies.iter().map(|&l| l as f64).sum::<f64>() / latencies.len() as f64;
        let aggregate = window.aggregate();
        assert!((aggregate.mean_latency_ms - recomputed).abs() < 1e-9);
        assert_eq!(aggregate.count, latencies.len() as u64);
    }

    #[test]
    fn test_mean_weighted_across_minute_buckets() {
        let mut window = BackendWindow::new(900);
        // Two samples in minute 16, one in minute 17.
        window.record(1_000, SampleOutcome::Success, 100);
        window.record(1_010, SampleOutcome::Success, 200);
        window.record(1_020, SampleOutcome::Success, 600);

        let aggregate = window.aggregate();
        assert!((aggregate.mean_latency_ms - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_rates_exclude_cancellations() {
        let mut window = BackendWindow::new(900);
        window.record(0, SampleOutcome::Success, 100);
        window.record(1, SampleOutcome::Success, 100);
        window.record(2, SampleOutcome::Failure, 100);
        window.record(3, SampleOutcome::Cancelled, 5);
        window.record(4, SampleOutcome::Cancelled, 5);

        let aggregate = window.aggregate();
        assert_eq!(aggregate.count, 5);
        assert_eq!(aggregate.cancellations, 2);
        assert!((aggregate.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((aggregate.error_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_count_monotonic_until_prune() {
        let mut window = BackendWindow::new(120);
        let mut last = 0;
        for i in 0..50u64 {
            window.record(i, SampleOutcome::Success, 10);
            let count = window.aggregate().count;
            assert!(count >= last);
            last = count;
        }
        assert_eq!(last, 50);
    }

    #[test]
    fn test_prune_drops_expired_buckets() {
        let mut window = BackendWindow::new(120);
        window.record(0, SampleOutcome::Success, 10);
        window.record(60, SampleOutcome::Success, 10);
        window.record(600, SampleOutcome::Success, 10);

        window.prune(600);
        let aggregate = window.aggregate();
        // Only the bucket at minute 10 survives a 120s window ending at 600.
        assert_eq!(aggregate.count, 1);
    }

    #[test]
    fn test_prune_is_the_only_removal_path() {
        let mut window = BackendWindow::new(60);
        window.record(0, SampleOutcome::Success, 10);
        // Recording far in the future does not evict the stale bucket.
        window.record(10_000, SampleOutcome::Success, 10);
        assert_eq!(window.aggregate().count, 2);

        window.prune(10_000);
        assert_eq!(window.aggregate().count, 1);
    }

    #[test]
    fn test_p95_tracks_tail() {
        let mut window = BackendWindow::new(900);
        for i in 1..=100u64 {
            window.record(i, SampleOutcome::Success, i * 10);
        }
        let aggregate = window.aggregate();
        assert!((aggregate.p95_latency_ms - 950.0).abs() < 1e-9);
    }

    #[test]
    fn test_latency_ring_is_bounded() {
        let mut window = BackendWindow::new(900);
        for i in 0..(RECENT_LATENCY_CAP as u64 + 100) {
            window.record(i, SampleOutcome::Success, 10);
        }
        assert_eq!(window.recent_latencies.len(), RECENT_LATENCY_CAP);
    }

    #[test]
    fn test_empty_window_aggregate_is_zeroed() {
        let window = BackendWindow::new(900);
        let aggregate = window.aggregate();
        assert_eq!(aggregate.count, 0);
        assert_eq!(aggregate.success_rate, 0.0);
        assert_eq!(aggregate.p95_latency_ms, 0.0);
    }
}
