//! Multi-resolution zone aggregation.
//!
//! For every configured tick multiplier the aggregator maintains a rolling
//! set of fixed-width price bands ("zones") summarizing aggressive trades
//! and the passive liquidity resting near them. Zones are created on first
//! trade, expire after inactivity, and are capped LRU by last activity.

use crate::config::PreprocessorConfig;
use crate::financial_math::{self, Price, Quantity};
use crate::models::{Side, Zone, ZoneBoundaries, ZoneSnapshot};
use crate::orderbook::OrderBook;
use std::collections::{BTreeMap, HashMap};

pub struct ZoneAggregator {
    tick: Price,
    zone_ticks: i64,
    multipliers: Vec<u32>,
    range_raw: i64,
    max_zones: usize,
    /// Cap on zones returned per snapshot (nearest first).
    snapshot_cap: usize,
    time_window_ms: i64,
    next_zone_id: u64,
    total_trades: u64,
    /// multiplier -> (zone start, zone)
    bands: HashMap<u32, BTreeMap<i64, Zone>>,
    /// VWAP numerators per zone id; dropped with the zone.
    notionals: HashMap<u64, i128>,
}

impl ZoneAggregator {
    pub fn new(config: &PreprocessorConfig) -> Self {
        let mut bands = HashMap::new();
        for &m in &config.tick_multipliers {
            bands.insert(m, BTreeMap::new());
        }
        Self {
            tick: config.tick_size,
            zone_ticks: config.zone_ticks,
            multipliers: config.tick_multipliers.clone(),
            range_raw: config
                .zone_calculation_range_ticks
                .saturating_mul(config.tick_size.raw()),
            max_zones: config.max_zones,
            snapshot_cap: config.zone_cache_size.max(1),
            time_window_ms: config.zone_time_window_ms(),
            next_zone_id: 1,
            total_trades: 0,
            bands,
            notionals: HashMap::new(),
        }
    }

    #[inline]
    fn width_raw(&self, multiplier: u32) -> i64 {
        multiplier as i64 * self.zone_ticks * self.tick.raw()
    }

    /// Start of the zone containing `price`: `min <= price < max`, so a
    /// price exactly on a boundary belongs to the upper zone.
    #[inline]
    fn zone_start(&self, price: Price, multiplier: u32) -> i64 {
        let width = self.width_raw(multiplier);
        price.raw().div_euclid(width) * width
    }

    fn make_zone(&mut self, start: i64, multiplier: u32, ts: i64) -> Zone {
        let width = self.width_raw(multiplier);
        let center = Price::from_raw(start + width / 2);
        let id = self.next_zone_id;
        self.next_zone_id += 1;
        Zone {
            id,
            multiplier,
            center,
            boundaries: ZoneBoundaries {
                min: Price::from_raw(start),
                max: Price::from_raw(start + width),
            },
            agg_vol: Quantity::ZERO,
            agg_buy_vol: Quantity::ZERO,
            agg_sell_vol: Quantity::ZERO,
            passive_bid_vol: Quantity::ZERO,
            passive_ask_vol: Quantity::ZERO,
            peak_passive_bid_vol: Quantity::ZERO,
            peak_passive_ask_vol: Quantity::ZERO,
            trade_count: 0,
            vwap: center,
            first_ts: ts,
            last_ts: ts,
        }
    }

    /// Fold one trade into its containing zone (per multiplier) and refresh
    /// the passive sample from the book at the zone center.
    pub fn update(&mut self, price: Price, qty: Quantity, side: Side, ts: i64, book: &OrderBook) {
        self.total_trades += 1;
        for i in 0..self.multipliers.len() {
            let m = self.multipliers[i];
            let start = self.zone_start(price, m);
            if !self.bands.get(&m).map(|b| b.contains_key(&start)).unwrap_or(false) {
                let zone = self.make_zone(start, m, ts);
                if let Some(band) = self.bands.get_mut(&m) {
                    band.insert(start, zone);
                }
            }

            let half_ticks = ((m as i64 * self.zone_ticks) / 2).max(1);
            let Some(zone) = self.bands.get_mut(&m).and_then(|b| b.get_mut(&start)) else {
                continue;
            };

            zone.agg_vol = zone.agg_vol.saturating_add(qty);
            match side {
                Side::Buy => zone.agg_buy_vol = zone.agg_buy_vol.saturating_add(qty),
                Side::Sell => zone.agg_sell_vol = zone.agg_sell_vol.saturating_add(qty),
            }
            zone.trade_count += 1;
            let notional_sum = self
                .notionals
                .entry(zone.id)
                .and_modify(|n| *n += financial_math::notional(price, qty))
                .or_insert_with(|| financial_math::notional(price, qty));
            zone.vwap = financial_math::vwap_from_notional(*notional_sum, zone.agg_vol, zone.center);
            zone.last_ts = ts;

            let band_vol = book.sum_band(zone.center, half_ticks);
            zone.passive_bid_vol = band_vol.bid;
            zone.passive_ask_vol = band_vol.ask;
            // Peaks only ever ratchet up; they reset when the zone is evicted.
            zone.peak_passive_bid_vol = zone.peak_passive_bid_vol.max(band_vol.bid);
            zone.peak_passive_ask_vol = zone.peak_passive_ask_vol.max(band_vol.ask);
        }
    }

    /// Value-copy of every zone whose center lies within the calculation
    /// range of `price`, sorted by distance (nearest first).
    pub fn snapshot_near(&self, price: Price, now_ms: i64) -> ZoneSnapshot {
        let mut zones: Vec<Zone> = Vec::new();
        for (&m, band) in &self.bands {
            // A zone's key is its start; widen the low edge so zones whose
            // center is in range but whose start is below it still match.
            let lo = price.raw().saturating_sub(self.range_raw + self.width_raw(m));
            let hi = price.raw().saturating_add(self.range_raw);
            for zone in band.range(lo..=hi).map(|(_, z)| z) {
                if zone.center.abs_diff(price).raw() <= self.range_raw {
                    zones.push(zone.clone());
                }
            }
        }
        zones.sort_by_key(|z| (z.center.abs_diff(price).raw(), z.multiplier, z.id));
        zones.truncate(self.snapshot_cap);
        ZoneSnapshot { zones, generated_at: now_ms }
    }

    /// Expire idle zones and enforce the global LRU cap. Returns how many
    /// zones were dropped.
    pub fn tick(&mut self, now_ms: i64) -> usize {
        let cutoff = now_ms.saturating_sub(self.time_window_ms);
        let mut dropped = 0usize;
        for band in self.bands.values_mut() {
            let expired: Vec<(i64, u64)> = band
                .iter()
                .filter(|(_, z)| z.last_ts < cutoff)
                .map(|(&start, z)| (start, z.id))
                .collect();
            for (start, id) in expired {
                band.remove(&start);
                self.notionals.remove(&id);
                dropped += 1;
            }
        }

        while self.zone_count() > self.max_zones {
            // Evict the globally least-recently-active zone.
            let mut victim: Option<(u32, i64, u64, i64)> = None; // (mult, start, id, last_ts)
            for (&m, band) in &self.bands {
                for (&start, zone) in band {
                    if victim.map(|(_, _, _, ts)| zone.last_ts < ts).unwrap_or(true) {
                        victim = Some((m, start, zone.id, zone.last_ts));
                    }
                }
            }
            match victim {
                Some((m, start, id, _)) => {
                    if let Some(band) = self.bands.get_mut(&m) {
                        band.remove(&start);
                    }
                    self.notionals.remove(&id);
                    dropped += 1;
                }
                None => break,
            }
        }
        dropped
    }

    pub fn zone_count(&self) -> usize {
        self.bands.values().map(|b| b.len()).sum()
    }

    pub fn is_warm(&self) -> bool {
        self.total_trades > 0 && self.zone_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrderBookConfig;

    fn p(s: &str) -> Price {
        Price::parse(s).unwrap()
    }

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    fn setup() -> (ZoneAggregator, OrderBook) {
        let config = PreprocessorConfig::default();
        let agg = ZoneAggregator::new(&config);
        let mut book = OrderBook::new(&OrderBookConfig::default(), config.tick_size);
        book.apply_snapshot(
            1,
            &[(p("88.99"), q("1000"))],
            &[(p("89.01"), q("1000"))],
            0,
        );
        (agg, book)
    }

    #[test]
    fn zone_width_matches_multiplier() {
        let (mut agg, book) = setup();
        agg.update(p("89.01"), q("1"), Side::Buy, 1_000, &book);
        let snap = agg.snapshot_near(p("89.01"), 1_000);
        for zone in &snap.zones {
            let width = zone.boundaries.max.raw() - zone.boundaries.min.raw();
            assert_eq!(width, zone.multiplier as i64 * 10 * p("0.01").raw());
            assert!(zone.boundaries.min <= zone.boundaries.max);
        }
        // One zone per configured multiplier.
        assert_eq!(snap.zones.len(), 3);
    }

    #[test]
    fn boundary_price_belongs_to_upper_zone() {
        let (mut agg, book) = setup();
        // m=1, zone_ticks=10, tick=0.01 -> width 0.10; 89.10 is a boundary.
        agg.update(p("89.10"), q("1"), Side::Buy, 1_000, &book);
        let snap = agg.snapshot_near(p("89.10"), 1_000);
        let zone = snap.zones.iter().find(|z| z.multiplier == 1).unwrap();
        assert_eq!(zone.boundaries.min, p("89.10"));
        assert_eq!(zone.boundaries.max, p("89.20"));
    }

    #[test]
    fn agg_vol_is_buy_plus_sell() {
        let (mut agg, book) = setup();
        agg.update(p("89.01"), q("2"), Side::Buy, 1_000, &book);
        agg.update(p("89.01"), q("3"), Side::Sell, 1_001, &book);
        let snap = agg.snapshot_near(p("89.01"), 1_001);
        for zone in &snap.zones {
            assert_eq!(
                zone.agg_vol,
                zone.agg_buy_vol.saturating_add(zone.agg_sell_vol)
            );
        }
        assert_eq!(snap.zones[0].agg_vol, q("5"));
        assert_eq!(snap.zones[0].trade_count, 2);
    }

    #[test]
    fn vwap_weights_by_volume() {
        let (mut agg, book) = setup();
        agg.update(p("89.00"), q("1"), Side::Buy, 1_000, &book);
        agg.update(p("89.04"), q("3"), Side::Buy, 1_001, &book);
        let snap = agg.snapshot_near(p("89.02"), 1_001);
        let zone = snap.zones.iter().find(|z| z.multiplier == 1).unwrap();
        assert_eq!(zone.vwap, p("89.03"));
    }

    #[test]
    fn peaks_never_decrease() {
        let (mut agg, mut book) = setup();
        agg.update(p("89.01"), q("1"), Side::Buy, 1_000, &book);
        let peak_before = agg
            .snapshot_near(p("89.01"), 1_000)
            .zones
            .iter()
            .find(|z| z.multiplier == 1)
            .unwrap()
            .peak_passive_ask_vol;
        assert!(peak_before.is_positive());

        // Ask liquidity collapses; current follows, peak holds.
        book.apply_diff(1, 2, &[], &[(p("89.01"), q("10"))], 1_050).unwrap();
        agg.update(p("89.01"), q("1"), Side::Buy, 1_100, &book);
        let zone_snapshot = agg.snapshot_near(p("89.01"), 1_100);
        let zone = zone_snapshot.zones.iter().find(|z| z.multiplier == 1).unwrap();
        assert_eq!(zone.passive_ask_vol, q("10"));
        assert_eq!(zone.peak_passive_ask_vol, peak_before);
    }

    #[test]
    fn idle_zones_expire() {
        let (mut agg, book) = setup();
        agg.update(p("89.01"), q("1"), Side::Buy, 1_000, &book);
        assert_eq!(agg.zone_count(), 3);
        let dropped = agg.tick(1_000 + 300_000 + 1);
        assert_eq!(dropped, 3);
        assert_eq!(agg.zone_count(), 0);
    }

    #[test]
    fn zone_cap_evicts_least_recent() {
        let mut config = PreprocessorConfig::default();
        config.tick_multipliers = vec![1];
        config.max_zones = 2;
        let mut agg = ZoneAggregator::new(&config);
        let mut book = OrderBook::new(&OrderBookConfig::default(), config.tick_size);
        book.apply_snapshot(1, &[(p("88.99"), q("1"))], &[(p("89.01"), q("1"))], 0);

        agg.update(p("89.01"), q("1"), Side::Buy, 1_000, &book);
        agg.update(p("89.25"), q("1"), Side::Buy, 2_000, &book);
        agg.update(p("89.55"), q("1"), Side::Buy, 3_000, &book);
        assert_eq!(agg.zone_count(), 3);
        agg.tick(3_000);
        assert_eq!(agg.zone_count(), 2);
        // The 1_000ms zone is gone.
        let snap = agg.snapshot_near(p("89.01"), 3_000);
        assert!(snap.zones.iter().all(|z| z.last_ts >= 2_000));
    }

    #[test]
    fn snapshot_is_sorted_by_distance() {
        let (mut agg, book) = setup();
        agg.update(p("89.01"), q("1"), Side::Buy, 1_000, &book);
        agg.update(p("89.95"), q("1"), Side::Buy, 1_001, &book);
        let snap = agg.snapshot_near(p("89.01"), 1_001);
        for pair in snap.zones.windows(2) {
            assert!(
                pair[0].center.abs_diff(p("89.01")).raw()
                    <= pair[1].center.abs_diff(p("89.01")).raw()
            );
        }
    }

    #[test]
    fn snapshot_is_a_value_copy() {
        let (mut agg, book) = setup();
        agg.update(p("89.01"), q("1"), Side::Buy, 1_000, &book);
        let snap = agg.snapshot_near(p("89.01"), 1_000);
        let vol_then = snap.zones[0].agg_vol;
        agg.update(p("89.01"), q("5"), Side::Buy, 1_100, &book);
        assert_eq!(snap.zones[0].agg_vol, vol_then);
    }
}
