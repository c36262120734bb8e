//! Per-trade enrichment pipeline.
//!
//! Runs on the ingest thread only, strictly in exchange order: a depth
//! message mutates the book first, then each trade is validated, enriched
//! with book state, folded into the zone aggregator and emitted. Bad input
//! is dropped and counted, never raised to the caller.

use crate::config::PreprocessorConfig;
use crate::financial_math::{Price, Quantity};
use crate::market::ZoneAggregator;
use crate::metrics::MetricsCollector;
use crate::models::{AggTradeMessage, AggressiveTrade, DiffDepthMessage, EnrichedTrade, Side, SnapshotMessage};
use crate::orderbook::{BookError, OrderBook};
use std::sync::Arc;
use tracing::{debug, warn};

/// What a depth message did to the book, with per-level before/after sizes
/// so the spoofing tracker can watch walls.
pub enum DepthOutcome {
    Applied {
        changed: Vec<LevelChange>,
    },
    /// Replayed or malformed update; dropped.
    Rejected,
    /// Sequence gap: the circuit is open and a snapshot must be fetched.
    GapDetected,
    /// Circuit already open; update ignored.
    CircuitOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct LevelChange {
    pub price: Price,
    pub side: Side,
    pub previous: Quantity,
    pub current: Quantity,
}

pub struct Preprocessor {
    config: PreprocessorConfig,
    aggregator: ZoneAggregator,
    metrics: Arc<MetricsCollector>,
    last_trade_id: u64,
}

impl Preprocessor {
    pub fn new(config: PreprocessorConfig, metrics: Arc<MetricsCollector>) -> Self {
        let aggregator = ZoneAggregator::new(&config);
        Self {
            config,
            aggregator,
            metrics,
            last_trade_id: 0,
        }
    }

    fn parse_levels(raw: &[[String; 2]]) -> Option<Vec<(Price, Quantity)>> {
        let mut out = Vec::with_capacity(raw.len());
        for [price_str, qty_str] in raw {
            let price = Price::parse(price_str)?;
            let qty = Quantity::parse(qty_str)?;
            if price.raw() < 0 || qty.raw() < 0 {
                return None;
            }
            out.push((price, qty));
        }
        Some(out)
    }

    /// Seed the book from a snapshot, resetting sequencing and closing any
    /// open circuit.
    pub fn handle_snapshot(&mut self, book: &mut OrderBook, msg: &SnapshotMessage, now_ms: i64) {
        let (Some(bids), Some(asks)) = (Self::parse_levels(&msg.bids), Self::parse_levels(&msg.asks))
        else {
            warn!("snapshot with malformed levels dropped");
            MetricsCollector::incr(&self.metrics.invalid_trades);
            return;
        };
        book.apply_snapshot(msg.last_update_id, &bids, &asks, now_ms);
        MetricsCollector::incr(&self.metrics.snapshots_applied);
        MetricsCollector::set_gauge(&self.metrics.book_levels, book.len() as i64);
    }

    /// Apply a diff to the book. Returns the per-level changes so the caller
    /// can feed the spoofing tracker.
    pub fn handle_depth(
        &mut self,
        book: &mut OrderBook,
        msg: &DiffDepthMessage,
        now_ms: i64,
    ) -> DepthOutcome {
        let (Some(bids), Some(asks)) = (Self::parse_levels(&msg.bids), Self::parse_levels(&msg.asks))
        else {
            MetricsCollector::incr(&self.metrics.invalid_trades);
            return DepthOutcome::Rejected;
        };

        let mut changed = Vec::with_capacity(bids.len() + asks.len());
        for &(price, qty) in &bids {
            let previous = book
                .get_depth_at_price(price)
                .map(|l| l.bid)
                .unwrap_or(Quantity::ZERO);
            changed.push(LevelChange { price, side: Side::Buy, previous, current: qty });
        }
        for &(price, qty) in &asks {
            let previous = book
                .get_depth_at_price(price)
                .map(|l| l.ask)
                .unwrap_or(Quantity::ZERO);
            changed.push(LevelChange { price, side: Side::Sell, previous, current: qty });
        }

        match book.apply_diff(msg.first_update_id, msg.final_update_id, &bids, &asks, now_ms) {
            Ok(()) => {
                MetricsCollector::incr(&self.metrics.depth_updates);
                MetricsCollector::set_gauge(&self.metrics.book_levels, book.len() as i64);
                DepthOutcome::Applied { changed }
            }
            Err(BookError::SequenceGap { .. }) | Err(BookError::NotInitialized) => {
                MetricsCollector::incr(&self.metrics.sequence_gaps);
                DepthOutcome::GapDetected
            }
            Err(BookError::CircuitOpen) => DepthOutcome::CircuitOpen,
            Err(BookError::StaleDiff { .. }) => {
                debug!(
                    first = msg.first_update_id,
                    last = msg.final_update_id,
                    "stale depth diff dropped"
                );
                DepthOutcome::Rejected
            }
        }
    }

    /// Validate, enrich and emit one trade. Emission order equals input
    /// order; a trade that fails validation is dropped with a counter.
    pub fn handle_agg_trade(
        &mut self,
        book: &OrderBook,
        msg: &AggTradeMessage,
        now_ms: i64,
    ) -> Option<EnrichedTrade> {
        let trade = match self.validate(msg) {
            Some(t) => t,
            None => {
                MetricsCollector::incr(&self.metrics.invalid_trades);
                return None;
            }
        };
        self.last_trade_id = trade.id;

        let best_bid = book.get_best_bid().map(|(p, _)| p);
        let best_ask = book.get_best_ask().map(|(p, _)| p);
        let at_level = book.get_depth_at_price(trade.price).unwrap_or_default();
        let band = book.sum_band(trade.price, self.config.band_ticks);

        self.aggregator
            .update(trade.price, trade.qty, trade.taker_side(), trade.ts, book);
        MetricsCollector::set_gauge(&self.metrics.active_zones, self.aggregator.zone_count() as i64);

        let zone_data = if self.aggregator.is_warm() {
            let snapshot = self.aggregator.snapshot_near(trade.price, now_ms);
            if snapshot.zones.is_empty() {
                None
            } else {
                Some(snapshot)
            }
        } else {
            None
        };

        MetricsCollector::incr(&self.metrics.trades_processed);

        Some(EnrichedTrade {
            trade,
            best_bid,
            best_ask,
            passive_bid_at_price: at_level.bid,
            passive_ask_at_price: at_level.ask,
            band_bid_vol: band.bid,
            band_ask_vol: band.ask,
            zone_data,
        })
    }

    /// Raw units per step at the configured decimal precision.
    fn precision_step(decimals: u32) -> i64 {
        10_i64.pow(8_u32.saturating_sub(decimals).min(8))
    }

    fn validate(&self, msg: &AggTradeMessage) -> Option<AggressiveTrade> {
        let price = Price::parse(&msg.price)?;
        let qty = Quantity::parse(&msg.qty)?;
        if !price.is_positive() || !qty.is_positive() {
            return None;
        }
        // Representable at the configured precisions.
        if price.raw() % Self::precision_step(self.config.price_precision) != 0 {
            return None;
        }
        if qty.raw() % Self::precision_step(self.config.quantity_precision) != 0 {
            return None;
        }
        if msg.trade_time <= 0 {
            return None;
        }
        // Replays of an already-seen aggregate id are duplicates, not data.
        if msg.agg_id <= self.last_trade_id && self.last_trade_id != 0 {
            return None;
        }
        Some(AggressiveTrade {
            id: msg.agg_id,
            price: price.normalize_to_tick(self.config.tick_size),
            qty,
            ts: msg.trade_time,
            buyer_is_maker: msg.buyer_is_maker,
        })
    }

    /// Periodic zone maintenance (expiry + cap).
    pub fn tick(&mut self, now_ms: i64) {
        let dropped = self.aggregator.tick(now_ms);
        if dropped > 0 {
            MetricsCollector::add(&self.metrics.zones_expired, dropped as u64);
            MetricsCollector::set_gauge(&self.metrics.active_zones, self.aggregator.zone_count() as i64);
        }
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

    fn setup() -> (Preprocessor, OrderBook) {
        let metrics = Arc::new(MetricsCollector::new());
        let pre = Preprocessor::new(PreprocessorConfig::default(), metrics);
        let mut book = OrderBook::new(&OrderBookConfig::default(), p("0.01"));
        book.apply_snapshot(
            100,
            &[(p("88.99"), q("1000"))],
            &[(p("89.01"), q("1000"))],
            0,
        );
        (pre, book)
    }

    #[test]
    fn trade_is_enriched_with_book_state() {
        let (mut pre, book) = setup();
        let enriched = pre
            .handle_agg_trade(&book, &trade_msg(1, "89.01", "20", 1_000, false), 1_000)
            .unwrap();
        assert_eq!(enriched.best_bid, Some(p("88.99")));
        assert_eq!(enriched.best_ask, Some(p("89.01")));
        assert_eq!(enriched.passive_ask_at_price, q("1000"));
        assert_eq!(enriched.passive_bid_at_price, Quantity::ZERO);
        assert!(enriched.zone_data.is_some());
        assert_eq!(enriched.trade.taker_side(), Side::Buy);
    }

    #[test]
    fn invalid_trade_is_dropped_and_counted() {
        let (mut pre, book) = setup();
        let metrics = pre.metrics.clone();
        assert!(pre
            .handle_agg_trade(&book, &trade_msg(1, "not-a-price", "20", 1_000, false), 1_000)
            .is_none());
        assert!(pre
            .handle_agg_trade(&book, &trade_msg(2, "89.01", "0", 1_000, false), 1_000)
            .is_none());
        assert_eq!(metrics.snapshot().invalid_trades, 2);
        assert_eq!(metrics.snapshot().trades_processed, 0);
    }

    #[test]
    fn replayed_trade_id_is_dropped() {
        let (mut pre, book) = setup();
        assert!(pre
            .handle_agg_trade(&book, &trade_msg(5, "89.01", "1", 1_000, false), 1_000)
            .is_some());
        assert!(pre
            .handle_agg_trade(&book, &trade_msg(5, "89.01", "1", 1_001, false), 1_001)
            .is_none());
        assert!(pre
            .handle_agg_trade(&book, &trade_msg(6, "89.01", "1", 1_002, false), 1_002)
            .is_some());
    }

    #[test]
    fn depth_reports_level_transitions() {
        let (mut pre, mut book) = setup();
        let msg = DiffDepthMessage {
            symbol: "BTCUSDT".into(),
            first_update_id: 100,
            final_update_id: 101,
            bids: vec![],
            asks: vec![[String::from("89.01"), String::from("250")]],
        };
        match pre.handle_depth(&mut book, &msg, 1_000) {
            DepthOutcome::Applied { changed } => {
                assert_eq!(changed.len(), 1);
                assert_eq!(changed[0].previous, q("1000"));
                assert_eq!(changed[0].current, q("250"));
                assert_eq!(changed[0].side, Side::Sell);
            }
            _ => panic!("expected applied"),
        }
    }

    #[test]
    fn gap_is_surfaced_for_snapshot_request() {
        let (mut pre, mut book) = setup();
        let msg = DiffDepthMessage {
            symbol: "BTCUSDT".into(),
            first_update_id: 200,
            final_update_id: 201,
            bids: vec![],
            asks: vec![],
        };
        assert!(matches!(
            pre.handle_depth(&mut book, &msg, 1_000),
            DepthOutcome::GapDetected
        ));
        assert!(book.needs_snapshot());
        assert!(matches!(
            pre.handle_depth(&mut book, &msg, 1_100),
            DepthOutcome::CircuitOpen
        ));
    }

    #[test]
    fn snapshot_recovers_after_gap() {
        let (mut pre, mut book) = setup();
        let gap = DiffDepthMessage {
            symbol: "BTCUSDT".into(),
            first_update_id: 300,
            final_update_id: 301,
            bids: vec![],
            asks: vec![],
        };
        pre.handle_depth(&mut book, &gap, 1_000);

        let snap = SnapshotMessage {
            last_update_id: 400,
            bids: vec![[String::from("88.99"), String::from("10")]],
            asks: vec![[String::from("89.01"), String::from("10")]],
        };
        pre.handle_snapshot(&mut book, &snap, 1_100);
        assert!(!book.needs_snapshot());
        assert_eq!(book.last_update_id(), 400);
    }
}
