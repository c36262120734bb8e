//! Delta-CVD divergence detector.
//!
//! Tracks cumulative signed taker volume against price over several rolling
//! windows. Price falling while CVD rises is a bullish divergence (buy);
//! the mirror is bearish (sell). Scratch results are recycled through a
//! free list bounded by the window count.

use crate::config::DeltaCvdConfig;
use crate::detectors::{
    log_internal_anomaly, CooldownGate, Detector, DetectorContext, DetectorStatus,
};
use crate::financial_math::{self, Price, Quantity, SCALE};
use crate::models::{ConfirmedSignal, EnrichedTrade, Side, SignalCandidate, SignalType};
use serde_json::json;
use std::collections::VecDeque;
use uuid::Uuid;

pub const DETECTOR_ID: &str = "delta_cvd";

/// A perfectly linear series travels 2*sqrt(3) population std-devs end to
/// end; trend strength is measured against that bound.
const LINEAR_SPAN_STD: f64 = 3.464_101_615_137_754_6;

/// Scratch output of one window evaluation; pooled, never reallocated in
/// steady state.
#[derive(Debug, Default)]
pub struct CvdCalculationResult {
    pub window_sec: u64,
    pub price_strength: f64,
    pub cvd_strength: f64,
    pub divergence: f64,
    pub side: Option<Side>,
    pub vol_per_sec: f64,
    pub trades_in_window: usize,
}

impl CvdCalculationResult {
    fn clear(&mut self) {
        *self = CvdCalculationResult::default();
    }
}

struct WindowState {
    window_ms: i64,
    /// (ts, signed effective qty raw)
    trades: VecDeque<(i64, i64)>,
    cvd_raw: i128,
    abs_vol_raw: i128,
    /// (ts, price raw, cvd raw at sample time)
    samples: VecDeque<(i64, i64, i128)>,
    last_sample_ms: i64,
}

impl WindowState {
    fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            trades: VecDeque::new(),
            cvd_raw: 0,
            abs_vol_raw: 0,
            samples: VecDeque::new(),
            last_sample_ms: 0,
        }
    }

    fn push(&mut self, ts: i64, signed_raw: i64, price_raw: i64, sample_interval_ms: i64) {
        self.trades.push_back((ts, signed_raw));
        self.cvd_raw += signed_raw as i128;
        self.abs_vol_raw += signed_raw.unsigned_abs() as i128;

        let horizon = ts - self.window_ms;
        while let Some(&(t, q)) = self.trades.front() {
            if t < horizon {
                self.trades.pop_front();
                self.cvd_raw -= q as i128;
                self.abs_vol_raw -= q.unsigned_abs() as i128;
            } else {
                break;
            }
        }

        if ts - self.last_sample_ms >= sample_interval_ms {
            self.samples.push_back((ts, price_raw, self.cvd_raw));
            self.last_sample_ms = ts;
        }
        while matches!(self.samples.front(), Some(&(t, _, _)) if t < horizon) {
            self.samples.pop_front();
        }
    }
}

/// Normalized end-to-end trend strength of a series: 1.0 for a clean line,
/// ~0 for noise. Sign follows the slope.
fn trend_strength(ys: &[f64]) -> f64 {
    let Some(slope) = financial_math::linear_slope(ys) else {
        return 0.0;
    };
    let Some(std) = financial_math::std_dev(ys) else {
        return 0.0;
    };
    if std <= 0.0 {
        return 0.0;
    }
    let total_move = slope * (ys.len() as f64 - 1.0);
    (total_move / std / LINEAR_SPAN_STD).clamp(-1.0, 1.0)
}

pub struct DeltaCvdDetector {
    config: DeltaCvdConfig,
    cooldown: CooldownGate,
    windows: Vec<WindowState>,
    pool: Vec<Box<CvdCalculationResult>>,
    healthy: bool,
    emitted: u64,
    rejected: u64,
    confirmed: u64,
    last_emit_ms: Option<i64>,
}

impl DeltaCvdDetector {
    pub fn new(config: DeltaCvdConfig, tick: Price, zone_ticks: i64) -> Self {
        let bucket_raw = zone_ticks.max(1).saturating_mul(tick.raw());
        let cooldown = CooldownGate::new(config.event_cooldown_ms, bucket_raw);
        let windows = config
            .windows_sec
            .iter()
            .map(|&w| WindowState::new(w as i64 * 1_000))
            .collect();
        Self {
            config,
            cooldown,
            windows,
            pool: Vec::new(),
            healthy: true,
            emitted: 0,
            rejected: 0,
            confirmed: 0,
            last_emit_ms: None,
        }
    }

    fn acquire(&mut self) -> Box<CvdCalculationResult> {
        self.pool.pop().unwrap_or_default()
    }

    fn release(&mut self, mut result: Box<CvdCalculationResult>) {
        if self.pool.len() < self.windows.len() {
            result.clear();
            self.pool.push(result);
        }
    }

    /// Pool occupancy, bounded by the window count.
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Signed CVD for the window at `index`, in whole units.
    pub fn cvd_units(&self, index: usize) -> Option<f64> {
        self.windows
            .get(index)
            .map(|w| w.cvd_raw as f64 / SCALE as f64)
    }

    /// Total unsigned volume for the window at `index`, in whole units.
    pub fn window_volume_units(&self, index: usize) -> Option<f64> {
        self.windows
            .get(index)
            .map(|w| w.abs_vol_raw as f64 / SCALE as f64)
    }

    fn effective_qty(&self, trade: &EnrichedTrade) -> Quantity {
        let qty = trade.trade.qty;
        if !self.config.use_passive_volume {
            return qty;
        }
        let passive = match trade.trade.taker_side() {
            Side::Buy => trade.passive_ask_at_price,
            Side::Sell => trade.passive_bid_at_price,
        };
        let passive_ratio = financial_math::ratio(passive, qty).min(5.0);
        financial_math::scale_quantity(qty, 1.0 + passive_ratio * 0.1)
    }

    fn evaluate_window(&mut self, index: usize) -> Box<CvdCalculationResult> {
        let mut result = self.acquire();
        let window = &self.windows[index];
        let window_sec = (window.window_ms / 1_000).max(1) as f64;

        result.window_sec = window_sec as u64;
        result.trades_in_window = window.trades.len();
        result.vol_per_sec = window.abs_vol_raw as f64 / SCALE as f64 / window_sec;

        let min_samples = (self.config.min_trades_per_sec * window_sec).ceil() as usize;
        if result.trades_in_window < min_samples.max(2) {
            return result;
        }
        if result.vol_per_sec < self.config.min_vol_per_sec {
            return result;
        }

        let take = self.config.slope_points.max(2);
        let start = window.samples.len().saturating_sub(take);
        let mut prices: Vec<f64> = Vec::with_capacity(take);
        let mut cvds: Vec<f64> = Vec::with_capacity(take);
        for &(_, price_raw, cvd_raw) in window.samples.iter().skip(start) {
            prices.push(price_raw as f64 / SCALE as f64);
            cvds.push(cvd_raw as f64 / SCALE as f64);
        }
        if prices.len() < 2 {
            return result;
        }

        result.price_strength = trend_strength(&prices);
        result.cvd_strength = trend_strength(&cvds);

        // Divergence requires opposite, non-trivial trends.
        if result.price_strength * result.cvd_strength < 0.0 {
            result.divergence =
                (result.price_strength.abs() + result.cvd_strength.abs()) / 2.0;
            result.side = if result.price_strength < 0.0 {
                Some(Side::Buy)
            } else {
                Some(Side::Sell)
            };
        }
        result
    }

    fn evaluate(
        &mut self,
        trade: &EnrichedTrade,
        _ctx: &DetectorContext<'_>,
    ) -> Result<Option<SignalCandidate>, String> {
        let ts = trade.trade.ts;
        let eff = self.effective_qty(trade);
        let signed_raw = match trade.trade.taker_side() {
            Side::Buy => eff.raw(),
            Side::Sell => -eff.raw(),
        };
        let price_raw = trade.trade.price.raw();
        let sample_interval = self.config.sample_interval_ms;
        for window in &mut self.windows {
            window.push(ts, signed_raw, price_raw, sample_interval);
        }

        let mut best: Option<Box<CvdCalculationResult>> = None;
        for index in 0..self.windows.len() {
            let result = self.evaluate_window(index);
            if !result.divergence.is_finite() {
                self.release(result);
                return Err("non-finite divergence score".into());
            }
            let better = best
                .as_ref()
                .map(|b| result.divergence > b.divergence)
                .unwrap_or(true);
            if better {
                if let Some(prev) = best.take() {
                    self.release(prev);
                }
                best = Some(result);
            } else {
                self.release(result);
            }
        }

        let Some(result) = best else {
            return Ok(None);
        };
        let emit_side = result.side.filter(|_| {
            result.divergence >= self.config.cvd_imbalance_threshold
                && result.divergence >= self.config.final_confidence_required
        });

        let candidate = if let Some(side) = emit_side {
            if self.cooldown.check_and_arm(side, price_raw, ts) {
                self.emitted += 1;
                self.last_emit_ms = Some(ts);
                Some(SignalCandidate {
                    id: Uuid::new_v4(),
                    detector_id: DETECTOR_ID.to_string(),
                    signal_type: SignalType::DeltaCvd,
                    side,
                    confidence: result.divergence.min(1.0),
                    price: trade.trade.price,
                    ts,
                    data: json!({
                        "window_sec": result.window_sec,
                        "price_strength": result.price_strength,
                        "cvd_strength": result.cvd_strength,
                        "divergence": result.divergence,
                        "vol_per_sec": result.vol_per_sec,
                        "trades_in_window": result.trades_in_window,
                    }),
                })
            } else {
                None
            }
        } else {
            None
        };
        self.release(result);
        Ok(candidate)
    }
}

impl Detector for DeltaCvdDetector {
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
    use crate::models::AggressiveTrade;

    fn enriched(id: u64, price: &str, qty: &str, ts: i64, buyer_is_maker: bool) -> EnrichedTrade {
        EnrichedTrade {
            trade: AggressiveTrade {
                id,
                price: Price::parse(price).unwrap(),
                qty: Quantity::parse(qty).unwrap(),
                ts,
                buyer_is_maker,
            },
            best_bid: None,
            best_ask: None,
            passive_bid_at_price: Quantity::ZERO,
            passive_ask_at_price: Quantity::ZERO,
            band_bid_vol: Quantity::ZERO,
            band_ask_vol: Quantity::ZERO,
            zone_data: None,
        }
    }

    fn detector(config: DeltaCvdConfig) -> DeltaCvdDetector {
        DeltaCvdDetector::new(config, Price::parse("0.01").unwrap(), 10)
    }

    /// Price drifts down 100.00 -> 99.50 over a minute while buyers keep
    /// lifting: bullish divergence, buy signal.
    #[test]
    fn bullish_divergence_emits_buy() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector(DeltaCvdConfig::default());
        let mut signal = None;
        for i in 0..60i64 {
            let ts = 1_000 + i * 1_000;
            let price = format!("{:.2}", 100.00 - 0.50 * i as f64 / 59.0);
            let trade = enriched(i as u64 + 1, &price, "8.4", ts, false);
            let ctx = DetectorContext { spoofing: &spoofing, now_ms: ts };
            if let Some(c) = d.on_enriched_trade(&trade, &ctx) {
                signal = Some(c);
            }
        }
        let signal = signal.expect("divergence should fire");
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.signal_type, SignalType::DeltaCvd);
        assert!(signal.confidence >= DeltaCvdConfig::default().cvd_imbalance_threshold);
    }

    /// Mirror: price rising while sellers dominate the tape.
    #[test]
    fn bearish_divergence_emits_sell() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector(DeltaCvdConfig::default());
        let mut signal = None;
        for i in 0..60i64 {
            let ts = 1_000 + i * 1_000;
            let price = format!("{:.2}", 99.50 + 0.50 * i as f64 / 59.0);
            let trade = enriched(i as u64 + 1, &price, "8.4", ts, true);
            let ctx = DetectorContext { spoofing: &spoofing, now_ms: ts };
            if let Some(c) = d.on_enriched_trade(&trade, &ctx) {
                signal = Some(c);
            }
        }
        assert_eq!(signal.expect("divergence should fire").side, Side::Sell);
    }

    /// Aligned price and CVD trends are not a divergence.
    #[test]
    fn aligned_trend_stays_silent() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector(DeltaCvdConfig::default());
        for i in 0..60i64 {
            let ts = 1_000 + i * 1_000;
            let price = format!("{:.2}", 99.50 + 0.50 * i as f64 / 59.0);
            let trade = enriched(i as u64 + 1, &price, "8.4", ts, false);
            let ctx = DetectorContext { spoofing: &spoofing, now_ms: ts };
            assert!(d.on_enriched_trade(&trade, &ctx).is_none());
        }
    }

    /// |cvd(W)| can never exceed total volume traded in W.
    #[test]
    fn cvd_is_bounded_by_window_volume() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut config = DeltaCvdConfig::default();
        config.use_passive_volume = false;
        let mut d = detector(config);
        // Mixed flow with an excess of buys.
        for i in 0..200i64 {
            let ts = 1_000 + i * 300;
            let trade = enriched(i as u64 + 1, "100.00", "2", ts, i % 3 == 0);
            let ctx = DetectorContext { spoofing: &spoofing, now_ms: ts };
            let _ = d.on_enriched_trade(&trade, &ctx);
            for w in 0..3 {
                let cvd = d.cvd_units(w).unwrap().abs();
                let vol = d.window_volume_units(w).unwrap();
                assert!(cvd <= vol + 1e-9, "cvd {cvd} > vol {vol}");
            }
        }
    }

    /// The scratch-result pool never grows beyond the window count.
    #[test]
    fn result_pool_is_bounded() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector(DeltaCvdConfig::default());
        for i in 0..50i64 {
            let ts = 1_000 + i * 500;
            let trade = enriched(i as u64 + 1, "100.00", "1", ts, false);
            let ctx = DetectorContext { spoofing: &spoofing, now_ms: ts };
            let _ = d.on_enriched_trade(&trade, &ctx);
            assert!(d.pool_size() <= 3);
        }
        assert!(d.pool_size() >= 1);
    }

    /// Passive weighting inflates effective size by at most 50%.
    #[test]
    fn passive_weighting_is_capped() {
        let spoofing = SpoofingDetector::new(SpoofingConfig::default());
        let mut d = detector(DeltaCvdConfig::default());
        let mut trade = enriched(1, "100.00", "1", 1_000, false);
        trade.passive_ask_at_price = Quantity::from_units(1_000); // ratio way past the cap
        let ctx = DetectorContext { spoofing: &spoofing, now_ms: 1_000 };
        let _ = d.on_enriched_trade(&trade, &ctx);
        let cvd = d.cvd_units(0).unwrap();
        assert!((cvd - 1.5).abs() < 1e-9, "cvd {cvd}");
    }
}
