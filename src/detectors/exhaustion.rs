//! Exhaustion detector.
//!
//! Sustained aggression into one side while that side's opposing passive
//! liquidity drains from its lifetime peak: the aggressor is about to run
//! out of liquidity to consume. Ask depleted means buy, bid depleted means
//! sell.

use crate::config::ExhaustionConfig;
use crate::detectors::{
    finest_zones_near, log_internal_anomaly, zones_are_sane, CooldownGate, Detector,
    DetectorContext, DetectorStatus,
};
use crate::financial_math::{self, Price, Quantity};
use crate::models::{ConfirmedSignal, EnrichedTrade, Side, SignalCandidate, SignalType};
use serde_json::json;
use std::collections::VecDeque;
use uuid::Uuid;

pub const DETECTOR_ID: &str = "exhaustion";

pub struct ExhaustionDetector {
    config: ExhaustionConfig,
    tick: Price,
    cooldown: CooldownGate,
    /// (ts, taker side) over the rolling window; drives the continuity and
    /// velocity factors.
    flow_window: VecDeque<(i64, Side)>,
    healthy: bool,
    emitted: u64,
    rejected: u64,
    confirmed: u64,
    last_emit_ms: Option<i64>,
}

impl ExhaustionDetector {
    pub fn new(config: ExhaustionConfig, tick: Price, zone_ticks: i64) -> Self {
        let bucket_raw = zone_ticks.max(1).saturating_mul(tick.raw());
        let cooldown = CooldownGate::new(config.event_cooldown_ms, bucket_raw);
        Self {
            config,
            tick,
            cooldown,
            flow_window: VecDeque::new(),
            healthy: true,
            emitted: 0,
            rejected: 0,
            confirmed: 0,
            last_emit_ms: None,
        }
    }

    fn continuity(&self, side: Side) -> f64 {
        let lookback = self.config.continuity_lookback.max(1);
        let recent: Vec<Side> = self
            .flow_window
            .iter()
            .rev()
            .take(lookback)
            .map(|&(_, s)| s)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        let same = recent.iter().filter(|&&s| s == side).count();
        same as f64 / recent.len() as f64
    }

    fn velocity(&self) -> f64 {
        let window_sec = (self.config.time_window_ms as f64 / 1_000.0).max(1.0);
        let tps = self.flow_window.len() as f64 / window_sec;
        (tps / self.config.velocity_saturation_tps).clamp(0.0, 1.0)
    }

    fn spread_factor(&self, trade: &EnrichedTrade) -> f64 {
        let (Some(bid), Some(ask)) = (trade.best_bid, trade.best_ask) else {
            return 0.0;
        };
        let spread_ticks = ask.ticks_from(bid, self.tick).max(0) as f64;
        (1.0 - spread_ticks / self.config.max_spread_ticks.max(1) as f64).clamp(0.0, 1.0)
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
        let taker = trade.trade.taker_side();
        self.flow_window.push_back((ts, taker));
        let horizon = ts - self.config.time_window_ms;
        while matches!(self.flow_window.front(), Some(&(t, _)) if t < horizon) {
            self.flow_window.pop_front();
        }

        let relevant = finest_zones_near(&zone_data.zones, trade.trade.price);
        if relevant.is_empty() {
            return Ok(None);
        }

        let mut agg_vol = Quantity::ZERO;
        let mut relevant_passive = Quantity::ZERO;
        let mut buy_vol = Quantity::ZERO;
        let mut sell_vol = Quantity::ZERO;
        for zone in &relevant {
            agg_vol = agg_vol.saturating_add(zone.agg_vol);
            buy_vol = buy_vol.saturating_add(zone.agg_buy_vol);
            sell_vol = sell_vol.saturating_add(zone.agg_sell_vol);
            relevant_passive = relevant_passive.saturating_add(match taker {
                Side::Buy => zone.passive_ask_vol,
                Side::Sell => zone.passive_bid_vol,
            });
        }

        if agg_vol < self.config.min_agg_volume {
            return Ok(None);
        }

        let aggressive_ratio =
            financial_math::ratio(agg_vol, agg_vol.saturating_add(relevant_passive));
        if aggressive_ratio < self.config.exhaustion_threshold {
            return Ok(None);
        }

        // Depletion is measured against the containing zone's lifetime peak;
        // peaks only reset when the zone itself is evicted.
        let containing = relevant[0];
        let (peak, current) = match taker {
            Side::Buy => (containing.peak_passive_ask_vol, containing.passive_ask_vol),
            Side::Sell => (containing.peak_passive_bid_vol, containing.passive_bid_vol),
        };
        if peak < self.config.min_peak_volume {
            return Ok(None);
        }
        let depletion_ratio =
            financial_math::ratio(peak.saturating_sub(current), peak);
        if depletion_ratio < self.config.depletion_ratio_threshold {
            return Ok(None);
        }

        // The wall being consumed is on the taker's opposite side; a pulled
        // wall means the "depletion" was spoofed away, not traded away.
        if ctx
            .spoofing
            .was_spoofed(trade.trade.price, taker.opposite(), ctx.now_ms)
        {
            self.rejected += 1;
            return Ok(None);
        }

        let imbalance = financial_math::ratio(
            buy_vol.saturating_sub(sell_vol).max(sell_vol.saturating_sub(buy_vol)),
            agg_vol,
        );
        let w = &self.config.weights;
        let confidence = w.depletion * depletion_ratio
            + w.passive * aggressive_ratio
            + w.continuity * self.continuity(taker)
            + w.imbalance * imbalance
            + w.spread * self.spread_factor(trade)
            + w.velocity * self.velocity();
        if !confidence.is_finite() {
            return Err(format!(
                "non-finite confidence (depletion={depletion_ratio}, aggressive={aggressive_ratio})"
            ));
        }
        if confidence < self.config.final_confidence_required {
            return Ok(None);
        }

        // Side of depletion: asks exhausted by buyers mean buy, bids
        // exhausted by sellers mean sell.
        let side = taker;
        if !self.cooldown.check_and_arm(side, trade.trade.price.raw(), ts) {
            return Ok(None);
        }

        self.emitted += 1;
        self.last_emit_ms = Some(ts);
        Ok(Some(SignalCandidate {
            id: Uuid::new_v4(),
            detector_id: DETECTOR_ID.to_string(),
            signal_type: SignalType::Exhaustion,
            side,
            confidence,
            price: trade.trade.price,
            ts,
            data: json!({
                "agg_vol": agg_vol,
                "relevant_passive": relevant_passive,
                "aggressive_ratio": aggressive_ratio,
                "depletion_ratio": depletion_ratio,
                "peak_passive": peak,
                "current_passive": current,
            }),
        }))
    }
}

impl Detector for ExhaustionDetector {
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
