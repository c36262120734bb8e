//! Accumulation / distribution detector.
//!
//! Works purely off zone volumes: a persistent buy-share of everything
//! traded and resting near price is accumulation (buy); the sell-side
//! mirror is distribution (sell).

use crate::config::AccumulationConfig;
use crate::detectors::{
    log_internal_anomaly, zones_are_sane, CooldownGate, Detector, DetectorContext, DetectorStatus,
};
use crate::financial_math::{self, Price, Quantity};
use crate::models::{ConfirmedSignal, EnrichedTrade, Side, SignalCandidate, SignalType, Zone};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

pub const DETECTOR_ID: &str = "accumulation";

/// Zone count at which the confluence density factor saturates.
const DENSITY_SATURATION: usize = 5;

pub struct AccumulationDetector {
    config: AccumulationConfig,
    tick: Price,
    cooldown: CooldownGate,
    healthy: bool,
    emitted: u64,
    rejected: u64,
    confirmed: u64,
    last_emit_ms: Option<i64>,
}

impl AccumulationDetector {
    pub fn new(config: AccumulationConfig, tick: Price, zone_ticks: i64) -> Self {
        let bucket_raw = zone_ticks.max(1).saturating_mul(tick.raw());
        let cooldown = CooldownGate::new(config.event_cooldown_ms, bucket_raw);
        Self {
            config,
            tick,
            cooldown,
            healthy: true,
            emitted: 0,
            rejected: 0,
            confirmed: 0,
            last_emit_ms: None,
        }
    }

    fn relevant_zones<'a>(&self, zones: &'a [Zone], price: Price) -> Vec<&'a Zone> {
        let max_dist = self
            .config
            .confluence_max_distance_ticks
            .saturating_mul(self.tick.raw());
        zones
            .iter()
            .filter(|z| z.center.abs_diff(price).raw() <= max_dist)
            .collect()
    }

    /// Share of zones trading above the average zone size; a proxy for
    /// size concentration.
    fn institutional_factor(zones: &[&Zone]) -> f64 {
        if zones.is_empty() {
            return 0.0;
        }
        let sizes: Vec<f64> = zones.iter().map(|z| z.agg_vol.to_f64()).collect();
        let Some(mean) = financial_math::mean(&sizes) else {
            return 0.0;
        };
        let above = sizes.iter().filter(|&&s| s > mean).count();
        above as f64 / zones.len() as f64
    }

    /// Fraction of tick multipliers whose own directional ratio clears the
    /// threshold: agreement across resolutions.
    fn alignment_factor(&self, zones: &[&Zone], side: Side) -> f64 {
        let mut per_mult: HashMap<u32, (Quantity, Quantity)> = HashMap::new(); // (dir, total)
        for zone in zones {
            let entry = per_mult.entry(zone.multiplier).or_default();
            let dir = match side {
                Side::Buy => zone.agg_buy_vol,
                Side::Sell => zone.agg_sell_vol,
            };
            entry.0 = entry.0.saturating_add(dir);
            let total = zone
                .agg_vol
                .saturating_add(zone.passive_bid_vol)
                .saturating_add(zone.passive_ask_vol);
            entry.1 = entry.1.saturating_add(total);
        }
        if per_mult.is_empty() {
            return 0.0;
        }
        let aligned = per_mult
            .values()
            .filter(|(dir, total)| {
                financial_math::ratio(*dir, *total) >= self.config.accumulation_ratio_threshold
            })
            .count();
        aligned as f64 / per_mult.len() as f64
    }

    fn evaluate(
        &mut self,
        trade: &EnrichedTrade,
        _ctx: &DetectorContext<'_>,
    ) -> Result<Option<SignalCandidate>, String> {
        let Some(zone_data) = trade.zone_data.as_ref() else {
            return Ok(None);
        };
        if !zones_are_sane(&zone_data.zones) {
            self.rejected += 1;
            return Err("malformed zone data in snapshot".into());
        }

        let relevant = self.relevant_zones(&zone_data.zones, trade.trade.price);
        if relevant.is_empty() {
            return Ok(None);
        }

        let mut total_vol = Quantity::ZERO;
        let mut agg_total = Quantity::ZERO;
        let mut buy_vol = Quantity::ZERO;
        let mut sell_vol = Quantity::ZERO;
        for zone in &relevant {
            agg_total = agg_total.saturating_add(zone.agg_vol);
            buy_vol = buy_vol.saturating_add(zone.agg_buy_vol);
            sell_vol = sell_vol.saturating_add(zone.agg_sell_vol);
            total_vol = total_vol
                .saturating_add(zone.agg_vol)
                .saturating_add(zone.passive_bid_vol)
                .saturating_add(zone.passive_ask_vol);
        }

        if total_vol < self.config.accumulation_volume_threshold {
            return Ok(None);
        }

        let buy_ratio = financial_math::ratio(buy_vol, total_vol);
        let sell_ratio = financial_math::ratio(sell_vol, total_vol);

        let (signal_type, side, dir_ratio) =
            if buy_ratio >= self.config.accumulation_ratio_threshold {
                (SignalType::Accumulation, Side::Buy, buy_ratio)
            } else if sell_ratio >= self.config.accumulation_ratio_threshold {
                (SignalType::Distribution, Side::Sell, sell_ratio)
            } else {
                return Ok(None);
            };

        let agg_ratio = financial_math::ratio(agg_total, total_vol);
        let density = (relevant.len() as f64 / DENSITY_SATURATION as f64).min(1.0);
        let confluence = agg_ratio * density;
        let institutional = Self::institutional_factor(&relevant);
        let alignment = self.alignment_factor(&relevant, side);

        let confidence = (self.config.ratio_weight * dir_ratio
            + self.config.confluence_weight * confluence
            + self.config.institutional_weight * institutional
            + self.config.alignment_weight * alignment)
            .min(1.0);
        if !confidence.is_finite() {
            return Err(format!("non-finite confidence (dir_ratio={dir_ratio})"));
        }
        if confidence < self.config.final_confidence_required {
            return Ok(None);
        }

        let ts = trade.trade.ts;
        if !self.cooldown.check_and_arm(side, trade.trade.price.raw(), ts) {
            return Ok(None);
        }

        self.emitted += 1;
        self.last_emit_ms = Some(ts);
        Ok(Some(SignalCandidate {
            id: Uuid::new_v4(),
            detector_id: DETECTOR_ID.to_string(),
            signal_type,
            side,
            confidence,
            price: trade.trade.price,
            ts,
            data: json!({
                "total_vol": total_vol,
                "buy_ratio": buy_ratio,
                "sell_ratio": sell_ratio,
                "confluence": confluence,
                "institutional": institutional,
                "alignment": alignment,
                "zone_update": {
                    "type": signal_type.as_str(),
                    "zones": relevant.len(),
                },
            }),
        }))
    }
}

impl Detector for AccumulationDetector {
    fn id(&self) -> &'static str {
        DETECTOR_ID
    }

    fn on_enriched_trade(
        &mut self,
        trade: &EnrichedTrade,
        ctx: &DetectorContext<'_>,
    ) -> Option<SignalCandidate> {
        if !self.healthy {
            return None;
        }
        match self.evaluate(trade, ctx) {
            Ok(candidate) => candidate,
            Err(message) => {
                log_internal_anomaly(DETECTOR_ID, &message);
                self.healthy = false;
                None
            }
        }
    }

    fn status(&self) -> DetectorStatus {
        DetectorStatus {
            id: DETECTOR_ID.to_string(),
            healthy: self.healthy,
            emitted: self.emitted,
            rejected: self.rejected,
            confirmed: self.confirmed,
            last_emit_ms: self.last_emit_ms,
        }
    }

    fn mark_signal_confirmed(&mut self, _signal: &ConfirmedSignal) {
        self.confirmed += 1;
    }

    fn reset(&mut self) {
        self.healthy = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpoofingConfig;
    use crate::detectors::SpoofingDetector;
    use crate::models::{AggressiveTrade, ZoneBoundaries, ZoneSnapshot};

    fn p(s: &str) -> Price {
        Price::parse(s).unwrap()
    }

    fn q(units: i64) -> Quantity {
        Quantity::from_units(units)
    }

    fn zone(id: u64, center: &str, buy: i64, sell: i64, passive: i64) -> Zone {
        let center = p(center);
        let half = Price::parse("0.05").unwrap();
        Zone {
            id,
            multiplier: 1,
            center,
            boundaries: ZoneBoundaries {
                min: Price::from_raw(center.raw() - half.raw()),
                max: Price::from_raw(center.raw() + half.raw()),
            },
            agg_vol: q(buy + sell),
            agg_buy_vol: q(buy),
            agg_sell_vol: q(sell),
            passive_bid_vol: q(passive / 2),
            passive_ask_vol: q(passive - passive / 2),
            peak_passive_bid_vol: q(passive / 2),
            peak_passive_ask_vol: q(passive - passive / 2),
            trade_count: 10,
            vwap: center,
            first_ts: 0,
            last_ts: 0,
        }
    }

    fn enriched_with_zones(price: &str, ts: i64, zones: Vec<Zone>) -> EnrichedTrade {
        EnrichedTrade {
            trade: AggressiveTrade {
                id: 1,
                price: p(price),
                qty: Quantity::from_units(1),
                ts,
                buyer_is_maker: false,
            },
            best_bid: None,
            best_ask: None,
            passive_bid_at_price: Quantity::ZERO,
            passive_ask_at_price: Quantity::ZERO,
            band_bid_vol: Quantity::ZERO,
            band_ask_vol: Quantity::ZERO,
            zone_data: Some(ZoneSnapshot { zones, generated_at: ts }),
        }
    }

    fn detector() -> AccumulationDetector {
        AccumulationDetector::new(AccumulationConfig::default(), p("0.01"), 10)
    }

    /// Three adjacent buy-heavy zones with enough combined volume produce an
    /// accumulation buy signal tagged as a zone update.
    #[test]
    fn buy_heavy_zones_emit_accumulation() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector();
        let zones = vec![
            zone(1, "86.75", 82, 38, 13),
            zone(2, "86.85", 82, 38, 13),
            zone(3, "86.95", 82, 38, 14),
        ];
        let trade = enriched_with_zones("86.85", 120_000, zones);
        let ctx = DetectorContext { spoofing: &spoofing, now_ms: 120_000 };
        let signal = d.on_enriched_trade(&trade, &ctx).expect("should fire");
        assert_eq!(signal.signal_type, SignalType::Accumulation);
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.data["zone_update"]["type"], "accumulation");
        let buy_ratio = signal.data["buy_ratio"].as_f64().unwrap();
        assert!(buy_ratio >= AccumulationConfig::default().accumulation_ratio_threshold);
    }

    #[test]
    fn sell_heavy_zones_emit_distribution() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector();
        let zones = vec![
            zone(1, "86.75", 38, 82, 13),
            zone(2, "86.85", 38, 82, 13),
            zone(3, "86.95", 38, 82, 14),
        ];
        let trade = enriched_with_zones("86.85", 120_000, zones);
        let ctx = DetectorContext { spoofing: &spoofing, now_ms: 120_000 };
        let signal = d.on_enriched_trade(&trade, &ctx).expect("should fire");
        assert_eq!(signal.signal_type, SignalType::Distribution);
        assert_eq!(signal.side, Side::Sell);
    }

    #[test]
    fn thin_volume_stays_silent() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector();
        let zones = vec![zone(1, "86.85", 40, 10, 10)];
        let trade = enriched_with_zones("86.85", 120_000, zones);
        let ctx = DetectorContext { spoofing: &spoofing, now_ms: 120_000 };
        assert!(d.on_enriched_trade(&trade, &ctx).is_none());
    }

    #[test]
    fn balanced_flow_stays_silent() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector();
        let zones = vec![
            zone(1, "86.75", 70, 70, 10),
            zone(2, "86.85", 70, 70, 10),
            zone(3, "86.95", 70, 70, 10),
        ];
        let trade = enriched_with_zones("86.85", 120_000, zones);
        let ctx = DetectorContext { spoofing: &spoofing, now_ms: 120_000 };
        assert!(d.on_enriched_trade(&trade, &ctx).is_none());
    }

    #[test]
    fn far_zones_are_excluded() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector();
        // Heavy buying, but a full point away from the trade.
        let zones = vec![
            zone(1, "87.90", 200, 20, 30),
            zone(2, "88.00", 200, 20, 30),
        ];
        let trade = enriched_with_zones("86.85", 120_000, zones);
        let ctx = DetectorContext { spoofing: &spoofing, now_ms: 120_000 };
        assert!(d.on_enriched_trade(&trade, &ctx).is_none());
    }

    #[test]
    fn cooldown_collapses_repeat_emissions() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector();
        let zones = vec![
            zone(1, "86.75", 82, 38, 13),
            zone(2, "86.85", 82, 38, 13),
            zone(3, "86.95", 82, 38, 14),
        ];
        let first = enriched_with_zones("86.85", 120_000, zones.clone());
        let ctx = DetectorContext { spoofing: &spoofing, now_ms: 120_000 };
        assert!(d.on_enriched_trade(&first, &ctx).is_some());

        let again = enriched_with_zones("86.85", 121_000, zones);
        let ctx = DetectorContext { spoofing: &spoofing, now_ms: 121_000 };
        assert!(d.on_enriched_trade(&again, &ctx).is_none());
    }
}
