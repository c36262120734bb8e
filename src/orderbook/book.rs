//! Order book state machine.
//!
//! Levels are keyed by raw fixed-point price in a `BTreeMap`, so band sums
//! and pruning are range queries. The book mutates only on the ingest
//! thread; everything published to other threads is a value copy.

use crate::config::OrderBookConfig;
use crate::financial_math::{self, Price, Quantity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Error-rate window for `health()`.
const ERROR_WINDOW_MS: i64 = 60_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookError {
    #[error("sequence gap: expected {expected}, got range ({first}..{last}]")]
    SequenceGap { expected: u64, first: u64, last: u64 },
    /// The diff ends at or before the already-applied id; replays land here.
    #[error("stale diff: final id {last} already applied (at {applied})")]
    StaleDiff { last: u64, applied: u64 },
    #[error("book not initialized, snapshot required")]
    NotInitialized,
    #[error("circuit open, awaiting fresh snapshot")]
    CircuitOpen,
}

/// One price level. At most one side is populated unless the feed itself
/// crossed, which `health()` reports as unhealthy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub bid: Quantity,
    pub ask: Quantity,
    pub last_update: i64,
}

/// Aggregate passive volume in a price band.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BandVolumes {
    pub bid: Quantity,
    pub ask: Quantity,
    pub levels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookHealth {
    pub initialized: bool,
    pub circuit_open: bool,
    pub healthy: bool,
    pub crossed: bool,
    pub last_update_age_ms: i64,
    pub error_rate: f64,
    pub levels: usize,
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
    pub last_update_id: u64,
}

pub struct OrderBook {
    levels: BTreeMap<i64, DepthLevel>,
    tick: Price,
    max_levels: usize,
    max_price_distance_ticks: i64,
    stale_threshold_ms: i64,
    max_error_rate: f64,

    last_update_id: u64,
    initialized: bool,
    circuit_open: bool,
    last_update_ms: i64,

    window_started_ms: i64,
    window_updates: u64,
    window_errors: u64,
}

impl OrderBook {
    pub fn new(config: &OrderBookConfig, tick: Price) -> Self {
        Self {
            levels: BTreeMap::new(),
            tick,
            max_levels: config.max_levels,
            max_price_distance_ticks: config.max_price_distance_ticks,
            stale_threshold_ms: config.stale_threshold_ms,
            max_error_rate: config.max_error_rate,
            last_update_id: 0,
            initialized: false,
            circuit_open: false,
            last_update_ms: 0,
            window_started_ms: 0,
            window_updates: 0,
            window_errors: 0,
        }
    }

    /// Seed the book and reset all sequencing state. This is the only way
    /// to close an open circuit.
    pub fn apply_snapshot(
        &mut self,
        last_update_id: u64,
        bids: &[(Price, Quantity)],
        asks: &[(Price, Quantity)],
        now_ms: i64,
    ) {
        self.levels.clear();
        for &(price, qty) in bids {
            if qty.is_positive() {
                self.set_level(price, Some(qty), None, now_ms);
            }
        }
        for &(price, qty) in asks {
            if qty.is_positive() {
                self.set_level(price, None, Some(qty), now_ms);
            }
        }
        self.last_update_id = last_update_id;
        self.initialized = true;
        self.circuit_open = false;
        self.last_update_ms = now_ms;
    }

    /// Apply a diff covering the sequence range (first..last].
    ///
    /// The next expected id must fall inside that range; a gap beyond it
    /// opens the circuit breaker until a fresh snapshot arrives.
    pub fn apply_diff(
        &mut self,
        first_update_id: u64,
        final_update_id: u64,
        bids: &[(Price, Quantity)],
        asks: &[(Price, Quantity)],
        now_ms: i64,
    ) -> Result<(), BookError> {
        self.roll_error_window(now_ms);
        self.window_updates += 1;

        if !self.initialized {
            self.window_errors += 1;
            return Err(BookError::NotInitialized);
        }
        if self.circuit_open {
            return Err(BookError::CircuitOpen);
        }

        let expected = self.last_update_id + 1;
        if final_update_id < expected {
            // Replay of an already-applied diff; rejected, not an error burst.
            return Err(BookError::StaleDiff {
                last: final_update_id,
                applied: self.last_update_id,
            });
        }
        if first_update_id >= expected {
            self.window_errors += 1;
            self.circuit_open = true;
            warn!(
                expected,
                first = first_update_id,
                last = final_update_id,
                "depth gap detected, circuit opened"
            );
            return Err(BookError::SequenceGap {
                expected,
                first: first_update_id,
                last: final_update_id,
            });
        }

        for &(price, qty) in bids {
            self.set_level(price, Some(qty), None, now_ms);
        }
        for &(price, qty) in asks {
            self.set_level(price, None, Some(qty), now_ms);
        }

        self.last_update_id = final_update_id;
        self.last_update_ms = now_ms;
        Ok(())
    }

    fn set_level(&mut self, price: Price, bid: Option<Quantity>, ask: Option<Quantity>, now_ms: i64) {
        let key = price.normalize_to_tick(self.tick).raw();
        let level = self.levels.entry(key).or_default();
        if let Some(b) = bid {
            level.bid = b;
        }
        if let Some(a) = ask {
            level.ask = a;
        }
        level.last_update = now_ms;
        if level.bid.is_zero() && level.ask.is_zero() {
            self.levels.remove(&key);
        }
    }

    pub fn get_best_bid(&self) -> Option<(Price, Quantity)> {
        self.levels
            .iter()
            .rev()
            .find(|(_, l)| l.bid.is_positive())
            .map(|(k, l)| (Price::from_raw(*k), l.bid))
    }

    pub fn get_best_ask(&self) -> Option<(Price, Quantity)> {
        self.levels
            .iter()
            .find(|(_, l)| l.ask.is_positive())
            .map(|(k, l)| (Price::from_raw(*k), l.ask))
    }

    pub fn get_spread(&self) -> Option<Price> {
        let (bid, _) = self.get_best_bid()?;
        let (ask, _) = self.get_best_ask()?;
        Some(ask.abs_diff(bid))
    }

    pub fn get_mid_price(&self) -> Option<Price> {
        let (bid, _) = self.get_best_bid()?;
        let (ask, _) = self.get_best_ask()?;
        Some(financial_math::mid_price(bid, ask))
    }

    pub fn get_depth_at_price(&self, price: Price) -> Option<DepthLevel> {
        let key = price.normalize_to_tick(self.tick).raw();
        self.levels.get(&key).copied()
    }

    /// Aggregate bid/ask volume within ±`ticks` of `center` (inclusive).
    pub fn sum_band(&self, center: Price, ticks: i64) -> BandVolumes {
        let half = ticks.max(0).saturating_mul(self.tick.raw());
        let center = center.normalize_to_tick(self.tick).raw();
        let lo = center.saturating_sub(half);
        let hi = center.saturating_add(half);

        let mut out = BandVolumes::default();
        for level in self.levels.range(lo..=hi).map(|(_, l)| l) {
            out.bid = out.bid.saturating_add(level.bid);
            out.ask = out.ask.saturating_add(level.ask);
            out.levels += 1;
        }
        out
    }

    /// Drop levels beyond the configured distance from mid, then enforce the
    /// level cap from the outside in. Called on a timer, not per update.
    pub fn prune(&mut self) -> usize {
        let Some(mid) = self.get_mid_price() else {
            return 0;
        };
        let max_dist = self.max_price_distance_ticks.saturating_mul(self.tick.raw());
        let lo = mid.raw().saturating_sub(max_dist);
        let hi = mid.raw().saturating_add(max_dist);

        let before = self.levels.len();
        self.levels.retain(|k, _| (lo..=hi).contains(k));

        while self.levels.len() > self.max_levels {
            // Remove whichever edge is farther from mid.
            let (first, last) = match (
                self.levels.keys().next().copied(),
                self.levels.keys().next_back().copied(),
            ) {
                (Some(f), Some(l)) => (f, l),
                _ => break,
            };
            let victim = if mid.raw() - first > last - mid.raw() {
                first
            } else {
                last
            };
            self.levels.remove(&victim);
        }
        before - self.levels.len()
    }

    /// True once a sequence gap has been observed; the collaborator must
    /// fetch a fresh snapshot to recover.
    pub fn needs_snapshot(&self) -> bool {
        self.circuit_open || !self.initialized
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Top-of-book frame for the dashboard, `depth` levels per side.
    pub fn frame(&self, depth: usize) -> crate::models::BookFrame {
        let mut levels: Vec<crate::models::BookLevelFrame> = Vec::with_capacity(depth * 2);
        for (k, l) in self.levels.iter().rev().filter(|(_, l)| l.bid.is_positive()).take(depth) {
            levels.push(crate::models::BookLevelFrame {
                price: Price::from_raw(*k),
                bid: l.bid,
                ask: Quantity::ZERO,
            });
        }
        levels.reverse();
        for (k, l) in self.levels.iter().filter(|(_, l)| l.ask.is_positive()).take(depth) {
            levels.push(crate::models::BookLevelFrame {
                price: Price::from_raw(*k),
                bid: Quantity::ZERO,
                ask: l.ask,
            });
        }
        crate::models::BookFrame {
            best_bid: self.get_best_bid().map(|(p, _)| p),
            best_ask: self.get_best_ask().map(|(p, _)| p),
            levels,
        }
    }

    fn roll_error_window(&mut self, now_ms: i64) {
        if now_ms - self.window_started_ms >= ERROR_WINDOW_MS {
            self.window_started_ms = now_ms;
            self.window_updates = 0;
            self.window_errors = 0;
        }
    }

    pub fn health(&self, now_ms: i64) -> BookHealth {
        let best_bid = self.get_best_bid().map(|(p, _)| p);
        let best_ask = self.get_best_ask().map(|(p, _)| p);
        let crossed = matches!((best_bid, best_ask), (Some(b), Some(a)) if b >= a);
        let age = now_ms.saturating_sub(self.last_update_ms);
        let error_rate = financial_math::safe_ratio(self.window_errors as f64, self.window_updates as f64);
        let healthy = self.initialized
            && !self.circuit_open
            && !crossed
            && age <= self.stale_threshold_ms
            && error_rate <= self.max_error_rate;

        BookHealth {
            initialized: self.initialized,
            circuit_open: self.circuit_open,
            healthy,
            crossed,
            last_update_age_ms: age,
            error_rate,
            levels: self.levels.len(),
            best_bid,
            best_ask,
            last_update_id: self.last_update_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Price {
        Price::parse(s).unwrap()
    }

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    fn book() -> OrderBook {
        let mut b = OrderBook::new(&OrderBookConfig::default(), p("0.01"));
        b.apply_snapshot(
            100,
            &[(p("88.99"), q("1000")), (p("88.98"), q("500"))],
            &[(p("89.01"), q("1000")), (p("89.02"), q("250"))],
            1_000,
        );
        b
    }

    #[test]
    fn snapshot_seeds_best_prices() {
        let b = book();
        assert_eq!(b.get_best_bid(), Some((p("88.99"), q("1000"))));
        assert_eq!(b.get_best_ask(), Some((p("89.01"), q("1000"))));
        assert_eq!(b.get_spread(), Some(p("0.02")));
        assert_eq!(b.get_mid_price(), Some(p("89.00")));
    }

    #[test]
    fn in_order_diff_applies_and_moves_sequence() {
        let mut b = book();
        b.apply_diff(100, 102, &[(p("88.99"), q("900"))], &[], 1_100).unwrap();
        assert_eq!(b.last_update_id(), 102);
        assert_eq!(b.get_best_bid(), Some((p("88.99"), q("900"))));
    }

    #[test]
    fn same_diff_twice_is_rejected_second_time() {
        let mut b = book();
        b.apply_diff(100, 102, &[(p("88.99"), q("900"))], &[], 1_100).unwrap();
        let err = b
            .apply_diff(100, 102, &[(p("88.99"), q("900"))], &[], 1_101)
            .unwrap_err();
        assert_eq!(err, BookError::StaleDiff { last: 102, applied: 102 });
        // State unchanged.
        assert_eq!(b.get_best_bid(), Some((p("88.99"), q("900"))));
    }

    #[test]
    fn gap_opens_circuit_until_snapshot() {
        let mut b = book();
        let err = b.apply_diff(105, 106, &[], &[], 1_100).unwrap_err();
        assert_eq!(
            err,
            BookError::SequenceGap { expected: 101, first: 105, last: 106 }
        );
        assert!(b.needs_snapshot());
        assert_eq!(
            b.apply_diff(107, 108, &[], &[], 1_200).unwrap_err(),
            BookError::CircuitOpen
        );

        b.apply_snapshot(200, &[(p("88.99"), q("10"))], &[(p("89.01"), q("10"))], 1_300);
        assert!(!b.needs_snapshot());
        b.apply_diff(200, 201, &[], &[(p("89.01"), q("5"))], 1_400).unwrap();
    }

    #[test]
    fn zero_both_sides_removes_level() {
        let mut b = book();
        b.apply_diff(100, 101, &[], &[(p("89.02"), Quantity::ZERO)], 1_100).unwrap();
        assert_eq!(b.get_depth_at_price(p("89.02")), None);
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn sum_band_is_inclusive_of_edges() {
        let b = book();
        let band = b.sum_band(p("89.00"), 1);
        // 88.99 bid and 89.01 ask are exactly one tick away.
        assert_eq!(band.bid, q("1000"));
        assert_eq!(band.ask, q("1000"));
        assert_eq!(band.levels, 2);

        let wide = b.sum_band(p("89.00"), 2);
        assert_eq!(wide.bid, q("1500"));
        assert_eq!(wide.ask, q("1250"));
    }

    #[test]
    fn prune_drops_far_levels() {
        let mut config = OrderBookConfig::default();
        config.max_price_distance_ticks = 3;
        let mut b = OrderBook::new(&config, p("0.01"));
        b.apply_snapshot(
            1,
            &[(p("88.99"), q("10")), (p("80.00"), q("10"))],
            &[(p("89.01"), q("10")), (p("95.00"), q("10"))],
            0,
        );
        assert_eq!(b.prune(), 2);
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn crossed_book_is_unhealthy() {
        let mut b = book();
        b.apply_diff(100, 101, &[(p("89.05"), q("10"))], &[], 1_100).unwrap();
        let h = b.health(1_200);
        assert!(h.crossed);
        assert!(!h.healthy);
    }

    #[test]
    fn stale_book_is_unhealthy() {
        let b = book();
        let h = b.health(1_000 + OrderBookConfig::default().stale_threshold_ms + 1);
        assert!(!h.healthy);
        assert!(!h.crossed);
    }
}
