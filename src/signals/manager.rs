//! Signal manager.
//!
//! Last gate before the system boundary: confidence and staleness checks,
//! conflict resolution between opposite sides, per-detector position
//! sizing, adaptive batch sizing under load, and a circuit breaker fed by
//! downstream failures.

use crate::config::ManagerConfig;
use crate::financial_math::Price;
use crate::metrics::MetricsCollector;
use crate::models::{ConfirmedSignal, ProcessedSignal, Side};
use crate::resilience::{CircuitBreaker, CircuitStatus};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct SignalManager {
    config: ManagerConfig,
    metrics: Arc<MetricsCollector>,
    breaker: CircuitBreaker,
    queue: VecDeque<ProcessedSignal>,
    /// (confirmed_at, side, confidence) of recent emissions.
    recent: VecDeque<(i64, Side, f64)>,
    adaptive_batch: usize,
}

impl SignalManager {
    pub fn new(config: ManagerConfig, metrics: Arc<MetricsCollector>) -> Self {
        let breaker = CircuitBreaker::new(
            "signal-manager",
            config.circuit_breaker_threshold,
            Duration::from_millis(config.circuit_breaker_reset_ms),
        );
        let adaptive_batch = config.min_adaptive_batch_size;
        Self {
            config,
            metrics,
            breaker,
            queue: VecDeque::new(),
            recent: VecDeque::new(),
            adaptive_batch,
        }
    }

    pub fn enqueue(&mut self, signal: ProcessedSignal) {
        self.queue.push_back(signal);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// True when producers should yield before submitting more work.
    pub fn under_backpressure(&self) -> bool {
        self.queue.len() > self.config.backpressure_threshold
    }

    /// Report a downstream failure (storage, broadcast, alert) into the
    /// circuit breaker.
    pub fn record_failure(&mut self) {
        self.breaker.record_failure();
    }

    pub fn circuit_status(&self) -> CircuitStatus {
        self.breaker.status()
    }

    fn priority_of(&self, signal: &ProcessedSignal) -> i32 {
        self.config
            .signal_type_priorities
            .get(signal.candidate.signal_type.as_str())
            .copied()
            .unwrap_or(0)
    }

    fn position_size_of(&self, signal: &ProcessedSignal) -> f64 {
        self.config
            .position_sizing
            .get(&signal.candidate.detector_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Opposite-side conflict inside the separation window. Returns true
    /// when the incoming signal should be dropped.
    fn loses_conflict(&self, signal: &ProcessedSignal, now_ms: i64) -> bool {
        if !self.config.conflict_resolution.enabled {
            return false;
        }
        let floor = now_ms - self.config.conflict_resolution.minimum_separation_ms;
        self.recent.iter().any(|&(ts, side, confidence)| {
            ts >= floor
                && side == signal.candidate.side.opposite()
                && confidence >= signal.candidate.confidence
        })
    }

    fn adapt_batch_size(&mut self) {
        if self.queue.len() > self.config.backpressure_threshold {
            self.adaptive_batch =
                (self.adaptive_batch * 2).min(self.config.max_adaptive_batch_size);
        } else if self.adaptive_batch > self.config.min_adaptive_batch_size {
            self.adaptive_batch -= 1;
        }
    }

    /// Emit up to one adaptive batch of confirmed signals, highest priority
    /// first.
    pub fn process_batch(
        &mut self,
        now_ms: i64,
        market_price: Option<Price>,
    ) -> Vec<ConfirmedSignal> {
        let floor = now_ms - self.config.conflict_resolution.minimum_separation_ms;
        while matches!(self.recent.front(), Some(&(ts, _, _)) if ts < floor) {
            self.recent.pop_front();
        }

        let batch_size = self.adaptive_batch.min(self.queue.len());
        if batch_size == 0 {
            self.adapt_batch_size();
            return Vec::new();
        }

        let mut batch: Vec<ProcessedSignal> = self.queue.drain(..batch_size).collect();
        batch.sort_by_key(|s| std::cmp::Reverse(self.priority_of(s)));

        let mut confirmed = Vec::new();
        for signal in batch {
            if now_ms - signal.processed_at > self.config.signal_timeout_ms {
                debug!(id = %signal.id, "signal timed out before confirmation");
                continue;
            }
            if signal.candidate.confidence < self.config.confidence_threshold {
                continue;
            }
            if self.loses_conflict(&signal, now_ms) {
                MetricsCollector::incr(&self.metrics.signals_conflict_dropped);
                debug!(
                    id = %signal.id,
                    side = signal.candidate.side.as_str(),
                    "dropped lower-confidence opposite-side signal"
                );
                continue;
            }
            if !self.breaker.allow() {
                warn!(id = %signal.id, "manager circuit open, signal dropped");
                continue;
            }

            let position_size = self.position_size_of(&signal);
            let final_price = market_price.unwrap_or(signal.candidate.price);
            self.recent
                .push_back((now_ms, signal.candidate.side, signal.candidate.confidence));
            MetricsCollector::incr(&self.metrics.signals_confirmed);
            confirmed.push(ConfirmedSignal {
                signal,
                final_price,
                position_size,
                confirmed_at: now_ms,
            });
        }

        self.adapt_batch_size();
        confirmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SignalCandidate, SignalType};
    use serde_json::json;
    use uuid::Uuid;

    fn processed(
        detector: &str,
        signal_type: SignalType,
        side: Side,
        confidence: f64,
        ts: i64,
    ) -> ProcessedSignal {
        ProcessedSignal {
            id: Uuid::new_v4(),
            candidate: SignalCandidate {
                id: Uuid::new_v4(),
                detector_id: detector.into(),
                signal_type,
                side,
                confidence,
                price: Price::parse("89.01").unwrap(),
                ts,
                data: json!({}),
            },
            confirmations: 1,
            confirmed_by: vec![detector.into()],
            correlated_ids: vec![],
            processed_at: ts,
        }
    }

    fn manager() -> SignalManager {
        SignalManager::new(ManagerConfig::default(), Arc::new(MetricsCollector::new()))
    }

    #[test]
    fn confirms_with_position_size_and_final_price() {
        let mut m = manager();
        m.enqueue(processed("absorption", SignalType::Absorption, Side::Buy, 0.8, 1_000));
        let out = m.process_batch(1_100, Some(Price::parse("89.00").unwrap()));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].final_price, Price::parse("89.00").unwrap());
        assert!((out[0].position_size - 1.0).abs() < 1e-9);
        assert_eq!(out[0].confirmed_at, 1_100);
    }

    #[test]
    fn low_confidence_is_dropped() {
        let mut m = manager();
        m.enqueue(processed("absorption", SignalType::Absorption, Side::Buy, 0.3, 1_000));
        assert!(m.process_batch(1_100, None).is_empty());
    }

    #[test]
    fn stale_signal_times_out() {
        let mut m = manager();
        m.enqueue(processed("absorption", SignalType::Absorption, Side::Buy, 0.9, 1_000));
        assert!(m.process_batch(1_000 + 61_000, None).is_empty());
    }

    #[test]
    fn opposite_side_conflict_drops_lower_confidence() {
        let mut m = manager();
        m.enqueue(processed("absorption", SignalType::Absorption, Side::Buy, 0.9, 1_000));
        assert_eq!(m.process_batch(1_100, None).len(), 1);

        // Weaker sell inside the separation window loses.
        m.enqueue(processed("exhaustion", SignalType::Exhaustion, Side::Sell, 0.6, 2_000));
        assert!(m.process_batch(2_100, None).is_empty());

        // Stronger sell wins through.
        m.enqueue(processed("exhaustion", SignalType::Exhaustion, Side::Sell, 0.95, 3_000));
        assert_eq!(m.process_batch(3_100, None).len(), 1);
    }

    #[test]
    fn conflict_window_expires() {
        let mut m = manager();
        m.enqueue(processed("absorption", SignalType::Absorption, Side::Buy, 0.9, 1_000));
        assert_eq!(m.process_batch(1_100, None).len(), 1);

        // Past minimum_separation_ms the weaker opposite side is fine.
        m.enqueue(processed("exhaustion", SignalType::Exhaustion, Side::Sell, 0.6, 30_000));
        assert_eq!(m.process_batch(30_000, None).len(), 1);
    }

    #[test]
    fn circuit_breaker_suppresses_after_failures() {
        let mut m = manager();
        for _ in 0..ManagerConfig::default().circuit_breaker_threshold {
            m.record_failure();
        }
        m.enqueue(processed("absorption", SignalType::Absorption, Side::Buy, 0.9, 1_000));
        assert!(m.process_batch(1_100, None).is_empty());
    }

    #[test]
    fn batch_size_adapts_to_queue_depth() {
        let mut config = ManagerConfig::default();
        config.backpressure_threshold = 4;
        config.min_adaptive_batch_size = 1;
        config.max_adaptive_batch_size = 8;
        let mut m = SignalManager::new(config, Arc::new(MetricsCollector::new()));

        for i in 0..20 {
            m.enqueue(processed(
                "absorption",
                SignalType::Absorption,
                Side::Buy,
                0.9,
                1_000 + i,
            ));
        }
        assert!(m.under_backpressure());
        // Deep queue: batch grows geometrically up to the cap.
        let first = m.process_batch(1_500, None).len();
        let second = m.process_batch(1_500, None).len();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        let third = m.process_batch(1_500, None).len();
        assert_eq!(third, 4);
    }

    #[test]
    fn higher_priority_types_confirm_first() {
        let mut config = ManagerConfig::default();
        config.min_adaptive_batch_size = 2;
        let mut m = SignalManager::new(config, Arc::new(MetricsCollector::new()));
        m.enqueue(processed("delta_cvd", SignalType::DeltaCvd, Side::Buy, 0.9, 1_000));
        m.enqueue(processed("absorption", SignalType::Absorption, Side::Buy, 0.9, 1_000));
        let out = m.process_batch(1_100, None);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].signal.candidate.signal_type, SignalType::Absorption);
    }
}
