//! Absorption detector.
//!
//! A level is absorbing when aggressive volume into one side keeps meeting
//! disproportionately large opposing passive volume while price refuses to
//! move. The emitted signal is counter-trend: absorbed buying is a sell
//! signal, absorbed selling a buy signal.

use crate::config::AbsorptionConfig;
use crate::detectors::{
    finest_zones_near, log_internal_anomaly, zones_are_sane, CooldownGate, Detector,
    DetectorContext, DetectorStatus,
};
use crate::financial_math::{self, Price, Quantity};
use crate::models::{ConfirmedSignal, EnrichedTrade, Side, SignalCandidate, SignalType};
use serde_json::json;
use std::collections::VecDeque;
use uuid::Uuid;

pub const DETECTOR_ID: &str = "absorption";

pub struct AbsorptionDetector {
    config: AbsorptionConfig,
    tick: Price,
    cooldown: CooldownGate,
    /// (ts, price raw) over the rolling window, for price-move measurement.
    price_window: VecDeque<(i64, i64)>,
    healthy: bool,
    emitted: u64,
    rejected: u64,
    confirmed: u64,
    last_emit_ms: Option<i64>,
}

impl AbsorptionDetector {
    pub fn new(config: AbsorptionConfig, tick: Price, zone_ticks: i64) -> Self {
        let bucket_raw = zone_ticks.max(1).saturating_mul(tick.raw());
        let cooldown = CooldownGate::new(config.event_cooldown_ms, bucket_raw);
        Self {
            config,
            tick,
            cooldown,
            price_window: VecDeque::new(),
            healthy: true,
            emitted: 0,
            rejected: 0,
            confirmed: 0,
            last_emit_ms: None,
        }
    }

    fn price_move_ticks(&self) -> i64 {
        let (mut lo, mut hi) = (i64::MAX, i64::MIN);
        for &(_, raw) in &self.price_window {
            lo = lo.min(raw);
            hi = hi.max(raw);
        }
        if lo > hi {
            return 0;
        }
        Price::from_raw(hi).ticks_from(Price::from_raw(lo), self.tick)
    }

    fn evaluate(
        &mut self,
        trade: &EnrichedTrade,
        ctx: &DetectorContext<'_>,
    ) -> Result<Option<SignalCandidate>, String> {
        let Some(zone_data) = trade.zone_data.as_ref() else {
            return Ok(None);
        };
        if !zones_are_sane(&zone_data.zones) {
            self.rejected += 1;
            return Err("malformed zone data in snapshot".into());
        }

        let ts = trade.trade.ts;
        self.price_window.push_back((ts, trade.trade.price.raw()));
        let horizon = ts - self.config.time_window_ms;
        while matches!(self.price_window.front(), Some(&(t, _)) if t < horizon) {
            self.price_window.pop_front();
        }

        let relevant = finest_zones_near(&zone_data.zones, trade.trade.price);
        if relevant.is_empty() {
            return Ok(None);
        }

        let taker = trade.trade.taker_side();
        let mut agg_vol = Quantity::ZERO;
        let mut directional_passive = Quantity::ZERO;
        let mut trade_count = 0u64;
        for zone in &relevant {
            agg_vol = agg_vol.saturating_add(zone.agg_vol);
            trade_count += zone.trade_count;
            directional_passive = directional_passive.saturating_add(match taker {
                Side::Buy => zone.passive_ask_vol,
                Side::Sell => zone.passive_bid_vol,
            });
        }

        if agg_vol < self.config.min_agg_volume {
            return Ok(None);
        }

        let passive_ratio = financial_math::ratio(
            directional_passive,
            directional_passive.saturating_add(agg_vol),
        );
        if passive_ratio < self.config.passive_absorption_threshold {
            return Ok(None);
        }

        let price_move_ticks = self.price_move_ticks();
        let price_efficiency =
            financial_math::safe_ratio(price_move_ticks as f64, agg_vol.to_f64());
        if price_efficiency > self.config.price_efficiency_threshold {
            return Ok(None);
        }

        // Absolute impact gate: price must not have escaped the level.
        let price_impact = financial_math::safe_ratio(
            (price_move_ticks.saturating_mul(self.tick.raw())) as f64,
            trade.trade.price.raw() as f64,
        );
        if price_impact > self.config.max_price_impact_ratio {
            return Ok(None);
        }

        // The wall doing the absorbing sits on the taker's opposite side.
        let wall_side = taker.opposite();
        if ctx.spoofing.was_spoofed(trade.trade.price, wall_side, ctx.now_ms) {
            self.rejected += 1;
            return Ok(None);
        }

        let avg_trade = financial_math::div_quantities(
            agg_vol,
            Quantity::from_units(trade_count.max(1) as i64),
        );
        let institutional = avg_trade >= self.config.institutional_volume_threshold;
        let boost = if institutional { self.config.institutional_boost } else { 0.0 };

        let efficiency_term =
            1.0 - price_efficiency / self.config.price_efficiency_threshold;
        let confidence = (passive_ratio * self.config.weight_passive
            + efficiency_term * self.config.weight_efficiency
            + boost)
            .min(1.0);
        if !confidence.is_finite() {
            return Err(format!(
                "non-finite confidence (passive_ratio={passive_ratio}, efficiency={price_efficiency})"
            ));
        }
        if confidence < self.config.final_confidence_required {
            return Ok(None);
        }

        // Counter-trend: absorbed buying means sell, absorbed selling buy.
        let side = taker.opposite();
        if !self.cooldown.check_and_arm(side, trade.trade.price.raw(), ts) {
            return Ok(None);
        }

        self.emitted += 1;
        self.last_emit_ms = Some(ts);
        Ok(Some(SignalCandidate {
            id: Uuid::new_v4(),
            detector_id: DETECTOR_ID.to_string(),
            signal_type: SignalType::Absorption,
            side,
            confidence,
            price: trade.trade.price,
            ts,
            data: json!({
                "agg_vol": agg_vol,
                "directional_passive": directional_passive,
                "passive_ratio": passive_ratio,
                "price_efficiency": price_efficiency,
                "institutional": institutional,
                "zones": relevant.len(),
            }),
        }))
    }
}

impl Detector for AbsorptionDetector {
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
    use crate::config::{OrderBookConfig, PreprocessorConfig, SpoofingConfig};
    use crate::detectors::SpoofingDetector;
    use crate::market::Preprocessor;
    use crate::metrics::MetricsCollector;
    use crate::models::AggTradeMessage;
    use crate::orderbook::OrderBook;
    use std::sync::Arc;

    fn p(s: &str) -> Price {
        Price::parse(s).unwrap()
    }

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    fn trade_msg(id: u64, price: &str, qty: &str, ts: i64, buyer_is_maker: bool) -> AggTradeMessage {
        AggTradeMessage {
            event_time: ts,
            symbol: "BTCUSDT".into(),
            agg_id: id,
            price: price.into(),
            qty: qty.into(),
            first_id: id,
            last_id: id,
            trade_time: ts,
            buyer_is_maker,
        }
    }

    struct Fixture {
        pre: Preprocessor,
        book: OrderBook,
        detector: AbsorptionDetector,
        spoofing: SpoofingDetector,
    }

    fn fixture() -> Fixture {
        let pre_config = PreprocessorConfig::default();
        let metrics = Arc::new(MetricsCollector::new());
        let mut book = OrderBook::new(&OrderBookConfig::default(), pre_config.tick_size);
        book.apply_snapshot(
            100,
            &[(p("88.99"), q("1000"))],
            &[(p("89.01"), q("1000"))],
            0,
        );
        Fixture {
            pre: Preprocessor::new(pre_config.clone(), metrics),
            book,
            detector: AbsorptionDetector::new(
                AbsorptionConfig::default(),
                pre_config.tick_size,
                pre_config.zone_ticks,
            ),
            spoofing: SpoofingDetector::new(SpoofingConfig::default()),
        }
    }

    /// Sustained aggressive selling into a standing bid wall with no price
    /// movement: counter-trend buy signal.
    #[test]
    fn absorbed_selling_emits_buy() {
        let mut fx = fixture();
        let mut signal = None;
        for i in 0..10u64 {
            let ts = 1_000 + i as i64 * 200;
            let enriched = fx
                .pre
                .handle_agg_trade(&fx.book, &trade_msg(i + 1, "88.99", "20", ts, true), ts)
                .unwrap();
            let ctx = DetectorContext { spoofing: &fx.spoofing, now_ms: ts };
            if let Some(c) = fx.detector.on_enriched_trade(&enriched, &ctx) {
                signal = Some(c);
            }
        }
        let signal = signal.expect("absorption should fire");
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.signal_type, SignalType::Absorption);
        assert!(signal.confidence >= AbsorptionConfig::default().final_confidence_required);
    }

    /// Mirror case: absorbed buying is a sell signal.
    #[test]
    fn absorbed_buying_emits_sell() {
        let mut fx = fixture();
        let mut signal = None;
        for i in 0..10u64 {
            let ts = 1_000 + i as i64 * 200;
            let enriched = fx
                .pre
                .handle_agg_trade(&fx.book, &trade_msg(i + 1, "89.01", "20", ts, false), ts)
                .unwrap();
            let ctx = DetectorContext { spoofing: &fx.spoofing, now_ms: ts };
            if let Some(c) = fx.detector.on_enriched_trade(&enriched, &ctx) {
                signal = Some(c);
            }
        }
        assert_eq!(signal.expect("absorption should fire").side, Side::Sell);
    }

    #[test]
    fn below_min_volume_stays_silent() {
        let mut fx = fixture();
        for i in 0..4u64 {
            let ts = 1_000 + i as i64 * 200;
            let enriched = fx
                .pre
                .handle_agg_trade(&fx.book, &trade_msg(i + 1, "88.99", "5", ts, true), ts)
                .unwrap();
            let ctx = DetectorContext { spoofing: &fx.spoofing, now_ms: ts };
            assert!(fx.detector.on_enriched_trade(&enriched, &ctx).is_none());
        }
    }

    #[test]
    fn spoofed_wall_vetoes_emission() {
        let mut fx = fixture();
        // Pull the bid wall right before the flow starts.
        fx.spoofing
            .on_level_change(p("88.99"), Side::Buy, q("5000"), q("50"), 900);
        for i in 0..10u64 {
            let ts = 1_000 + i as i64 * 200;
            let enriched = fx
                .pre
                .handle_agg_trade(&fx.book, &trade_msg(i + 1, "88.99", "20", ts, true), ts)
                .unwrap();
            let ctx = DetectorContext { spoofing: &fx.spoofing, now_ms: ts };
            assert!(fx.detector.on_enriched_trade(&enriched, &ctx).is_none());
        }
        assert!(fx.detector.status().rejected > 0);
    }

    #[test]
    fn cooldown_spaces_consecutive_emissions() {
        let mut fx = fixture();
        // A deep wall keeps the passive ratio above threshold for the whole run.
        fx.book
            .apply_diff(100, 101, &[(p("88.99"), q("10000"))], &[], 500)
            .unwrap();
        let mut emissions: Vec<i64> = Vec::new();
        for i in 0..200u64 {
            let ts = 1_000 + i as i64 * 500;
            let enriched = fx
                .pre
                .handle_agg_trade(&fx.book, &trade_msg(i + 1, "88.99", "20", ts, true), ts)
                .unwrap();
            let ctx = DetectorContext { spoofing: &fx.spoofing, now_ms: ts };
            if fx.detector.on_enriched_trade(&enriched, &ctx).is_some() {
                emissions.push(ts);
            }
        }
        assert!(emissions.len() >= 2, "expected repeat emissions across cooldowns");
        for pair in emissions.windows(2) {
            assert!(pair[1] - pair[0] >= AbsorptionConfig::default().event_cooldown_ms);
        }
    }

    #[test]
    fn unhealthy_detector_suppresses_until_reset() {
        let mut fx = fixture();
        let ts = 1_000;
        let mut enriched = fx
            .pre
            .handle_agg_trade(&fx.book, &trade_msg(1, "88.99", "20", ts, true), ts)
            .unwrap();
        // Corrupt the snapshot to trip the sanity boundary.
        if let Some(zd) = enriched.zone_data.as_mut() {
            zd.zones[0].agg_buy_vol = zd.zones[0].agg_vol.saturating_add(q("1"));
        }
        let ctx = DetectorContext { spoofing: &fx.spoofing, now_ms: ts };
        assert!(fx.detector.on_enriched_trade(&enriched, &ctx).is_none());
        assert!(!fx.detector.status().healthy);

        // Healthy input is still suppressed until reset.
        let clean = fx
            .pre
            .handle_agg_trade(&fx.book, &trade_msg(2, "88.99", "20", ts + 100, true), ts + 100)
            .unwrap();
        let ctx = DetectorContext { spoofing: &fx.spoofing, now_ms: ts + 100 };
        assert!(fx.detector.on_enriched_trade(&clean, &ctx).is_none());

        fx.detector.reset();
        assert!(fx.detector.status().healthy);
    }
}
