//! Pattern detectors.
//!
//! Each detector is an independent consumer of enriched trades producing
//! signal candidates. Behavior differences live in configuration, not in
//! types: everything implements the one `Detector` capability set and runs
//! on the ingest thread without blocking or raising.

mod absorption;
mod accumulation;
mod delta_cvd;
mod exhaustion;
mod spoofing;

pub use absorption::AbsorptionDetector;
pub use accumulation::AccumulationDetector;
pub use delta_cvd::DeltaCvdDetector;
pub use exhaustion::ExhaustionDetector;
pub use spoofing::SpoofingDetector;

use crate::errors::next_correlation_id;
use crate::models::{ConfirmedSignal, EnrichedTrade, Side, SignalCandidate, Zone};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::error;

/// Read-only context handed to detectors on every trade.
pub struct DetectorContext<'a> {
    pub spoofing: &'a SpoofingDetector,
    pub now_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorStatus {
    pub id: String,
    pub healthy: bool,
    pub emitted: u64,
    pub rejected: u64,
    pub confirmed: u64,
    pub last_emit_ms: Option<i64>,
}

pub trait Detector: Send {
    fn id(&self) -> &'static str;

    /// Inspect one enriched trade; may emit at most one candidate. Never
    /// blocks, never panics past this boundary.
    fn on_enriched_trade(
        &mut self,
        trade: &EnrichedTrade,
        ctx: &DetectorContext<'_>,
    ) -> Option<SignalCandidate>;

    fn status(&self) -> DetectorStatus;

    fn mark_signal_confirmed(&mut self, signal: &ConfirmedSignal);

    /// Clear the unhealthy flag set by an internal anomaly.
    fn reset(&mut self);
}

/// Per-(side, price-bucket) cooldown bookkeeping shared by the detectors.
pub(crate) struct CooldownGate {
    cooldown_ms: i64,
    bucket_raw: i64,
    last_emit: HashMap<(Side, i64), i64>,
}

impl CooldownGate {
    pub fn new(cooldown_ms: i64, bucket_raw: i64) -> Self {
        Self {
            cooldown_ms,
            bucket_raw: bucket_raw.max(1),
            last_emit: HashMap::new(),
        }
    }

    #[inline]
    pub fn bucket(&self, price_raw: i64) -> i64 {
        price_raw.div_euclid(self.bucket_raw)
    }

    /// True when emission is allowed; arms the cooldown as a side effect.
    pub fn check_and_arm(&mut self, side: Side, price_raw: i64, now_ms: i64) -> bool {
        let key = (side, self.bucket(price_raw));
        match self.last_emit.get(&key) {
            Some(&last) if now_ms - last < self.cooldown_ms => false,
            _ => {
                self.last_emit.insert(key, now_ms);
                true
            }
        }
    }
}

/// Zones at the finest resolution whose center sits within one zone width
/// of `price`: the containing zone and its direct neighbors. Snapshot order
/// (nearest first) is preserved, so index 0 is the containing zone.
pub(crate) fn finest_zones_near(zones: &[Zone], price: crate::financial_math::Price) -> Vec<&Zone> {
    let Some(min_mult) = zones.iter().map(|z| z.multiplier).min() else {
        return Vec::new();
    };
    zones
        .iter()
        .filter(|z| {
            let width = z.boundaries.max.raw() - z.boundaries.min.raw();
            z.multiplier == min_mult && z.center.abs_diff(price).raw() <= width
        })
        .collect()
}

/// Common zone-sanity check: a malformed snapshot increments the detector's
/// rejection counter and suppresses this trade, never raising.
pub(crate) fn zones_are_sane(zones: &[Zone]) -> bool {
    zones.iter().all(|z| {
        z.boundaries.min <= z.boundaries.max
            && z.agg_vol.raw()
                == z.agg_buy_vol.raw().saturating_add(z.agg_sell_vol.raw())
    })
}

/// Log an invariant violation with a fresh correlation id. The caller marks
/// itself unhealthy.
pub(crate) fn log_internal_anomaly(detector: &'static str, message: &str) {
    let correlation_id = next_correlation_id();
    error!(detector, correlation_id, message, "detector internal anomaly");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::financial_math::{Price, Quantity};
    use crate::models::ZoneBoundaries;

    #[test]
    fn cooldown_blocks_within_window_per_side_and_bucket() {
        let mut gate = CooldownGate::new(1_000, Price::parse("0.10").unwrap().raw());
        let price = Price::parse("89.01").unwrap().raw();
        assert!(gate.check_and_arm(Side::Buy, price, 0));
        assert!(!gate.check_and_arm(Side::Buy, price, 500));
        // Other side and other bucket are independent.
        assert!(gate.check_and_arm(Side::Sell, price, 500));
        assert!(gate.check_and_arm(Side::Buy, Price::parse("90.50").unwrap().raw(), 500));
        // Window elapsed.
        assert!(gate.check_and_arm(Side::Buy, price, 1_000));
    }

    #[test]
    fn zone_sanity_rejects_mismatched_volumes() {
        let center = Price::parse("89.05").unwrap();
        let mut zone = Zone {
            id: 1,
            multiplier: 1,
            center,
            boundaries: ZoneBoundaries {
                min: Price::parse("89.00").unwrap(),
                max: Price::parse("89.10").unwrap(),
            },
            agg_vol: Quantity::from_units(5),
            agg_buy_vol: Quantity::from_units(2),
            agg_sell_vol: Quantity::from_units(3),
            passive_bid_vol: Quantity::ZERO,
            passive_ask_vol: Quantity::ZERO,
            peak_passive_bid_vol: Quantity::ZERO,
            peak_passive_ask_vol: Quantity::ZERO,
            trade_count: 1,
            vwap: center,
            first_ts: 0,
            last_ts: 0,
        };
        assert!(zones_are_sane(std::slice::from_ref(&zone)));
        zone.agg_buy_vol = Quantity::from_units(4);
        assert!(!zones_are_sane(std::slice::from_ref(&zone)));
    }
}
