//! Wall-pull tracker.
//!
//! Watches passive size transitions per price level. A pull is a large
//! resting size vanishing inside a short window without matching aggressive
//! consumption; absorption and exhaustion veto signals at recently pulled
//! levels.

use crate::config::SpoofingConfig;
use crate::financial_math::{Price, Quantity};
use crate::models::Side;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

pub struct SpoofingDetector {
    config: SpoofingConfig,
    /// Aggressive consumption at (price, passive side), rolling window.
    consumed: HashMap<(i64, Side), VecDeque<(i64, Quantity)>>,
    /// Last recorded wall pull at (price, passive side).
    pulls: HashMap<(i64, Side), i64>,
    pulls_recorded: u64,
}

impl SpoofingDetector {
    pub fn new(config: SpoofingConfig) -> Self {
        Self {
            config,
            consumed: HashMap::new(),
            pulls: HashMap::new(),
            pulls_recorded: 0,
        }
    }

    /// Record an aggressive trade; it consumes passive liquidity on the
    /// opposite side of the taker.
    pub fn on_trade(&mut self, price: Price, taker: Side, qty: Quantity, now_ms: i64) {
        let passive_side = taker.opposite();
        let window = self
            .consumed
            .entry((price.raw(), passive_side))
            .or_default();
        window.push_back((now_ms, qty));
        Self::evict(window, now_ms, self.config.pull_window_ms);
    }

    /// Observe one passive level transition from a depth diff.
    pub fn on_level_change(
        &mut self,
        price: Price,
        side: Side,
        previous: Quantity,
        current: Quantity,
        now_ms: i64,
    ) {
        if previous < self.config.min_wall_size || current >= previous {
            return;
        }
        let drop = previous.saturating_sub(current);
        let pull_floor = crate::financial_math::scale_quantity(previous, self.config.pull_fraction);
        if drop < pull_floor {
            return;
        }

        // How much of the drop did trades actually eat?
        let consumed = self
            .consumed
            .get_mut(&(price.raw(), side))
            .map(|w| {
                Self::evict(w, now_ms, self.config.pull_window_ms);
                w.iter()
                    .fold(Quantity::ZERO, |acc, (_, q)| acc.saturating_add(*q))
            })
            .unwrap_or(Quantity::ZERO);

        let tolerated =
            crate::financial_math::scale_quantity(drop, self.config.consumption_tolerance);
        if consumed >= tolerated && !tolerated.is_zero() {
            return;
        }

        debug!(
            price = %price,
            side = side.as_str(),
            wall = %previous,
            remaining = %current,
            consumed = %consumed,
            "wall pull recorded"
        );
        self.pulls.insert((price.raw(), side), now_ms);
        self.pulls_recorded += 1;
    }

    /// Whether the level at `price` on `wall_side` was spoofed recently
    /// enough to veto a signal.
    pub fn was_spoofed(&self, price: Price, wall_side: Side, now_ms: i64) -> bool {
        self.pulls
            .get(&(price.raw(), wall_side))
            .map(|&ts| now_ms - ts <= self.config.event_cooldown_ms)
            .unwrap_or(false)
    }

    /// Drop stale pull records and consumption windows.
    pub fn tick(&mut self, now_ms: i64) {
        let cooldown = self.config.event_cooldown_ms;
        self.pulls.retain(|_, ts| now_ms - *ts <= cooldown);
        let window = self.config.pull_window_ms;
        self.consumed.retain(|_, w| {
            while let Some(&(ts, _)) = w.front() {
                if now_ms - ts > window {
                    w.pop_front();
                } else {
                    break;
                }
            }
            !w.is_empty()
        });
    }

    pub fn pulls_recorded(&self) -> u64 {
        self.pulls_recorded
    }

    fn evict(window: &mut VecDeque<(i64, Quantity)>, now_ms: i64, keep_ms: i64) {
        while let Some(&(ts, _)) = window.front() {
            if now_ms - ts > keep_ms {
                window.pop_front();
            } else {
                break;
            }
        }
    }
}
