//! Atomic metrics collector.
//!
//! Single global-free collector shared by `Arc`; all updates are relaxed
//! atomic ops so the ingest thread never contends, and readers snapshot
//! without locks.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Fixed latency histogram buckets in microseconds.
const LATENCY_BUCKETS_US: [u64; 8] = [50, 100, 250, 500, 1_000, 5_000, 25_000, 100_000];

#[derive(Default)]
pub struct MetricsCollector {
    // Counters
    pub trades_processed: AtomicU64,
    pub invalid_trades: AtomicU64,
    pub depth_updates: AtomicU64,
    pub sequence_gaps: AtomicU64,
    pub snapshots_applied: AtomicU64,
    pub zones_expired: AtomicU64,
    pub candidates_emitted: AtomicU64,
    pub candidates_rejected: AtomicU64,
    pub signals_processed: AtomicU64,
    pub signals_confirmed: AtomicU64,
    pub signals_deduplicated: AtomicU64,
    pub signals_conflict_dropped: AtomicU64,
    pub spoof_vetoes: AtomicU64,
    pub storage_retries: AtomicU64,
    pub dead_letters: AtomicU64,
    pub ws_frames_sent: AtomicU64,
    pub ws_frames_dropped: AtomicU64,
    pub alerts_sent: AtomicU64,
    pub alerts_failed: AtomicU64,
    pub detector_errors: AtomicU64,

    // Gauges
    pub storage_queue_depth: AtomicI64,
    pub coordinator_pending: AtomicI64,
    pub book_levels: AtomicI64,
    pub active_zones: AtomicI64,
    pub ws_clients: AtomicI64,

    // Trade-processing latency histogram (microseconds)
    latency_buckets: [AtomicU64; 8],
    latency_overflow: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_gauge(gauge: &AtomicI64, v: i64) {
        gauge.store(v, Ordering::Relaxed);
    }

    /// Record one trade's end-to-end processing latency.
    #[inline]
    pub fn record_latency_us(&self, us: u64) {
        match LATENCY_BUCKETS_US.iter().position(|&b| us <= b) {
            Some(i) => {
                self.latency_buckets[i].fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.latency_overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.latency_sum_us.fetch_add(us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let sum = self.latency_sum_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            trades_processed: self.trades_processed.load(Ordering::Relaxed),
            invalid_trades: self.invalid_trades.load(Ordering::Relaxed),
            depth_updates: self.depth_updates.load(Ordering::Relaxed),
            sequence_gaps: self.sequence_gaps.load(Ordering::Relaxed),
            snapshots_applied: self.snapshots_applied.load(Ordering::Relaxed),
            zones_expired: self.zones_expired.load(Ordering::Relaxed),
            candidates_emitted: self.candidates_emitted.load(Ordering::Relaxed),
            candidates_rejected: self.candidates_rejected.load(Ordering::Relaxed),
            signals_processed: self.signals_processed.load(Ordering::Relaxed),
            signals_confirmed: self.signals_confirmed.load(Ordering::Relaxed),
            signals_deduplicated: self.signals_deduplicated.load(Ordering::Relaxed),
            signals_conflict_dropped: self.signals_conflict_dropped.load(Ordering::Relaxed),
            spoof_vetoes: self.spoof_vetoes.load(Ordering::Relaxed),
            storage_retries: self.storage_retries.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            ws_frames_sent: self.ws_frames_sent.load(Ordering::Relaxed),
            ws_frames_dropped: self.ws_frames_dropped.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            alerts_failed: self.alerts_failed.load(Ordering::Relaxed),
            detector_errors: self.detector_errors.load(Ordering::Relaxed),
            storage_queue_depth: self.storage_queue_depth.load(Ordering::Relaxed),
            coordinator_pending: self.coordinator_pending.load(Ordering::Relaxed),
            book_levels: self.book_levels.load(Ordering::Relaxed),
            active_zones: self.active_zones.load(Ordering::Relaxed),
            ws_clients: self.ws_clients.load(Ordering::Relaxed),
            latency: LatencySnapshot {
                buckets_us: LATENCY_BUCKETS_US.to_vec(),
                counts: self
                    .latency_buckets
                    .iter()
                    .map(|b| b.load(Ordering::Relaxed))
                    .collect(),
                overflow: self.latency_overflow.load(Ordering::Relaxed),
                mean_us: if count > 0 { sum as f64 / count as f64 } else { 0.0 },
                count,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub trades_processed: u64,
    pub invalid_trades: u64,
    pub depth_updates: u64,
    pub sequence_gaps: u64,
    pub snapshots_applied: u64,
    pub zones_expired: u64,
    pub candidates_emitted: u64,
    pub candidates_rejected: u64,
    pub signals_processed: u64,
    pub signals_confirmed: u64,
    pub signals_deduplicated: u64,
    pub signals_conflict_dropped: u64,
    pub spoof_vetoes: u64,
    pub storage_retries: u64,
    pub dead_letters: u64,
    pub ws_frames_sent: u64,
    pub ws_frames_dropped: u64,
    pub alerts_sent: u64,
    pub alerts_failed: u64,
    pub detector_errors: u64,
    pub storage_queue_depth: i64,
    pub coordinator_pending: i64,
    pub book_levels: i64,
    pub active_zones: i64,
    pub ws_clients: i64,
    pub latency: LatencySnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub buckets_us: Vec<u64>,
    pub counts: Vec<u64>,
    pub overflow: u64,
    pub mean_us: f64,
    pub count: u64,
}
