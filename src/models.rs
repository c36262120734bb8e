//! Core domain types shared across the pipeline.
//!
//! Everything that crosses a thread boundary is a value copy of one of these
//! types; the order book and the zone aggregator hand out snapshots, never
//! references.

use crate::financial_math::{Price, Quantity};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Exchange wire messages (decoded at the feed boundary, string decimals)
// ============================================================================

/// Aggregated trade event as the exchange sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggTradeMessage {
    pub event_time: i64,
    pub symbol: String,
    pub agg_id: u64,
    pub price: String,
    pub qty: String,
    pub first_id: u64,
    pub last_id: u64,
    pub trade_time: i64,
    pub buyer_is_maker: bool,
}

/// Differential depth update covering the sequence range (U..u].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffDepthMessage {
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: u64,
    #[serde(rename = "u")]
    pub final_update_id: u64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// Full book snapshot served on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMessage {
    pub last_update_id: u64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

/// Everything the ingest thread consumes, in exchange order.
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    Trade(AggTradeMessage),
    Depth(DiffDepthMessage),
    Snapshot(SnapshotMessage),
}

// ============================================================================
// Trades and enrichment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// A validated aggressive (taker) trade. Immutable once built.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AggressiveTrade {
    pub id: u64,
    pub price: Price,
    pub qty: Quantity,
    pub ts: i64,
    pub buyer_is_maker: bool,
}

impl AggressiveTrade {
    /// `buyer_is_maker = true` means the trade was seller-initiated.
    #[inline]
    pub fn taker_side(&self) -> Side {
        if self.buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneBoundaries {
    pub min: Price,
    pub max: Price,
}

/// One tick-width band of price summarizing trades and passive liquidity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub id: u64,
    pub multiplier: u32,
    pub center: Price,
    pub boundaries: ZoneBoundaries,
    pub agg_vol: Quantity,
    pub agg_buy_vol: Quantity,
    pub agg_sell_vol: Quantity,
    pub passive_bid_vol: Quantity,
    pub passive_ask_vol: Quantity,
    /// Lifetime maxima; these never decrease while the zone lives.
    pub peak_passive_bid_vol: Quantity,
    pub peak_passive_ask_vol: Quantity,
    pub trade_count: u64,
    pub vwap: Price,
    pub first_ts: i64,
    pub last_ts: i64,
}

/// Immutable value copy of the zones near a trade. Consumers never observe
/// later aggregator state through this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub zones: Vec<Zone>,
    pub generated_at: i64,
}

/// A trade after book enrichment and zone annotation, emitted once, in
/// exchange order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedTrade {
    pub trade: AggressiveTrade,
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
    pub passive_bid_at_price: Quantity,
    pub passive_ask_at_price: Quantity,
    pub band_bid_vol: Quantity,
    pub band_ask_vol: Quantity,
    /// Present iff the aggregator is warm.
    pub zone_data: Option<ZoneSnapshot>,
}

// ============================================================================
// Signals
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Absorption,
    Exhaustion,
    DeltaCvd,
    Accumulation,
    Distribution,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Absorption => "absorption",
            SignalType::Exhaustion => "exhaustion",
            SignalType::DeltaCvd => "delta_cvd",
            SignalType::Accumulation => "accumulation",
            SignalType::Distribution => "distribution",
        }
    }

    /// Family used for cross-detector confirmation: candidates only confirm
    /// each other within the same family and side.
    pub fn family(&self) -> &'static str {
        match self {
            SignalType::Absorption | SignalType::DeltaCvd => "reversal",
            SignalType::Exhaustion => "continuation",
            SignalType::Accumulation | SignalType::Distribution => "positioning",
        }
    }
}

/// Raw detector output, before correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalCandidate {
    pub id: Uuid,
    pub detector_id: String,
    pub signal_type: SignalType,
    pub side: Side,
    pub confidence: f64,
    pub price: Price,
    pub ts: i64,
    pub data: serde_json::Value,
}

/// A candidate that survived correlation and confirmation gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedSignal {
    pub id: Uuid,
    pub candidate: SignalCandidate,
    pub confirmations: u32,
    pub confirmed_by: Vec<String>,
    pub correlated_ids: Vec<Uuid>,
    pub processed_at: i64,
}

/// The only signal stage that crosses the system boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedSignal {
    pub signal: ProcessedSignal,
    pub final_price: Price,
    pub position_size: f64,
    pub confirmed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeState {
    Pending,
    Success,
    Failure,
    Mixed,
    Timeout,
}

impl OutcomeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeState::Pending => "pending",
            OutcomeState::Success => "success",
            OutcomeState::Failure => "failure",
            OutcomeState::Mixed => "mixed",
            OutcomeState::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutcomeState::Pending),
            "success" => Some(OutcomeState::Success),
            "failure" => Some(OutcomeState::Failure),
            "mixed" => Some(OutcomeState::Mixed),
            "timeout" => Some(OutcomeState::Timeout),
            _ => None,
        }
    }
}

/// Price excursion record for a confirmed signal, finalized at the last
/// horizon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalOutcome {
    pub signal_id: Uuid,
    pub side: Side,
    pub entry_price: Price,
    pub entry_ts: i64,
    pub price_after_1m: Option<Price>,
    pub price_after_5m: Option<Price>,
    pub price_after_15m: Option<Price>,
    pub price_after_60m: Option<Price>,
    pub max_favorable: Price,
    pub max_adverse: Price,
    pub outcome: OutcomeState,
    pub is_active: bool,
}

// ============================================================================
// Coordinator jobs
// ============================================================================

/// Durable unit of coordinator work; survives restarts in the queue tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub detector_id: String,
    pub candidate: SignalCandidate,
    pub priority: i32,
    pub retry_count: u32,
    pub enqueued_at: i64,
    pub started_at: Option<i64>,
}

// ============================================================================
// Broadcast envelopes
// ============================================================================

/// One throttled frame of top-of-book state for the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookFrame {
    pub best_bid: Option<Price>,
    pub best_ask: Option<Price>,
    pub levels: Vec<BookLevelFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookLevelFrame {
    pub price: Price,
    pub bid: Quantity,
    pub ask: Quantity,
}

/// JSON envelope pushed to websocket clients: `{type, data, now}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerEvent {
    Trade { data: EnrichedTrade, now: i64 },
    Orderbook { data: BookFrame, now: i64 },
    Signal { data: ConfirmedSignal, now: i64 },
    Stats { data: serde_json::Value, now: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buyer_is_maker_means_aggressive_sell() {
        let t = AggressiveTrade {
            id: 1,
            price: Price::from_units(89),
            qty: Quantity::from_units(1),
            ts: 0,
            buyer_is_maker: true,
        };
        assert_eq!(t.taker_side(), Side::Sell);

        let t = AggressiveTrade {
            buyer_is_maker: false,
            ..t
        };
        assert_eq!(t.taker_side(), Side::Buy);
    }

    #[test]
    fn ws_envelope_carries_type_tag() {
        let ev = WsServerEvent::Stats {
            data: serde_json::json!({"trades": 1}),
            now: 42,
        };
        let v: serde_json::Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "stats");
        assert_eq!(v["now"], 42);
        assert_eq!(v["data"]["trades"], 1);
    }

    #[test]
    fn depth_message_decodes_exchange_field_names() {
        let raw = r#"{"symbol":"BTCUSDT","U":10,"u":12,
                      "bids":[["88.99","1000"]],"asks":[["89.01","1000"]]}"#;
        let msg: DiffDepthMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.first_update_id, 10);
        assert_eq!(msg.final_update_id, 12);
        assert_eq!(msg.bids[0][0], "88.99");
    }

    #[test]
    fn signal_families_group_confirmable_types() {
        assert_eq!(SignalType::Absorption.family(), SignalType::DeltaCvd.family());
        assert_eq!(
            SignalType::Accumulation.family(),
            SignalType::Distribution.family()
        );
        assert_ne!(SignalType::Absorption.family(), SignalType::Exhaustion.family());
    }
}
