//! Binance stream adapter.
//!
//! Connects the combined aggTrade + depth stream, decodes the exchange's
//! short field names into the engine's wire messages, and serves snapshot
//! requests over REST. The engine itself only ever sees `ExchangeEvent`s
//! on a channel, so tests and replays bypass this module entirely.

use crate::config::FeedConfig;
use crate::models::{AggTradeMessage, DiffDepthMessage, ExchangeEvent, SnapshotMessage};
use crossbeam::channel::Sender;
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Ask the feed to fetch a fresh book snapshot (gap recovery, startup).
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRequest;

#[derive(Deserialize)]
struct CombinedFrame {
    stream: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct RawAggTrade {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "a")]
    agg_id: u64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    qty: String,
    #[serde(rename = "f")]
    first_id: u64,
    #[serde(rename = "l")]
    last_id: u64,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

async fn fetch_snapshot(
    client: &reqwest::Client,
    rest_url: &str,
    symbol: &str,
) -> anyhow::Result<SnapshotMessage> {
    let url = format!("{rest_url}/api/v3/depth?symbol={}&limit=1000", symbol.to_uppercase());
    let snapshot = client.get(&url).send().await?.error_for_status()?.json().await?;
    Ok(snapshot)
}

fn decode_frame(raw: &str, ingest: &Sender<ExchangeEvent>) {
    let frame: CombinedFrame = match serde_json::from_str(raw) {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "undecodable stream frame dropped");
            return;
        }
    };

    if frame.stream.ends_with("@aggTrade") {
        match serde_json::from_value::<RawAggTrade>(frame.data) {
            Ok(t) => {
                let _ = ingest.send(ExchangeEvent::Trade(AggTradeMessage {
                    event_time: t.event_time,
                    symbol: t.symbol,
                    agg_id: t.agg_id,
                    price: t.price,
                    qty: t.qty,
                    first_id: t.first_id,
                    last_id: t.last_id,
                    trade_time: t.trade_time,
                    buyer_is_maker: t.buyer_is_maker,
                }));
            }
            Err(e) => debug!(error = %e, "bad aggTrade payload dropped"),
        }
    } else if frame.stream.contains("@depth") {
        match serde_json::from_value::<RawDepthUpdate>(frame.data) {
            Ok(d) => {
                let _ = ingest.send(ExchangeEvent::Depth(DiffDepthMessage {
                    symbol: d.symbol,
                    first_update_id: d.first_update_id,
                    final_update_id: d.final_update_id,
                    bids: d.bids,
                    asks: d.asks,
                }));
            }
            Err(e) => debug!(error = %e, "bad depth payload dropped"),
        }
    }
}

/// Connect-and-read loop with exponential reconnect backoff. Every new
/// connection starts with a fresh snapshot so the book can resync.
pub async fn run_feed(
    config: FeedConfig,
    ingest: Sender<ExchangeEvent>,
    mut snapshot_requests: mpsc::UnboundedReceiver<SnapshotRequest>,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to build snapshot http client");
            return;
        }
    };

    let symbol = config.symbol.to_lowercase();
    let stream_url = format!(
        "{}?streams={symbol}@aggTrade/{symbol}@depth@100ms",
        config.ws_url
    );
    let mut backoff_ms = config.reconnect_backoff_ms;

    loop {
        info!(url = %stream_url, "connecting exchange stream");
        let (mut ws, _) = match connect_async(&stream_url).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, backoff_ms, "stream connect failed");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(config.max_reconnect_backoff_ms);
                continue;
            }
        };
        backoff_ms = config.reconnect_backoff_ms;

        // Seed the book for this connection.
        match fetch_snapshot(&client, &config.rest_url, &config.symbol).await {
            Ok(snapshot) => {
                let _ = ingest.send(ExchangeEvent::Snapshot(snapshot));
            }
            Err(e) => warn!(error = %e, "startup snapshot fetch failed"),
        }

        loop {
            tokio::select! {
                request = snapshot_requests.recv() => {
                    if request.is_none() {
                        info!("snapshot request channel closed, feed stopping");
                        return;
                    }
                    match fetch_snapshot(&client, &config.rest_url, &config.symbol).await {
                        Ok(snapshot) => {
                            let _ = ingest.send(ExchangeEvent::Snapshot(snapshot));
                        }
                        Err(e) => warn!(error = %e, "snapshot fetch failed"),
                    }
                }
                message = ws.next() => {
                    match message {
                        Some(Ok(Message::Text(raw))) => decode_frame(&raw, &ingest),
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("exchange stream closed, reconnecting");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "exchange stream error, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms = (backoff_ms * 2).min(config.max_reconnect_backoff_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    #[test]
    fn decodes_agg_trade_frame() {
        let (tx, rx) = unbounded();
        let raw = r#"{"stream":"btcusdt@aggTrade","data":{
            "e":"aggTrade","E":1700000000100,"s":"BTCUSDT","a":42,
            "p":"89.01","q":"20","f":100,"l":101,"T":1700000000099,"m":false,"M":true}}"#;
        decode_frame(raw, &tx);
        match rx.try_recv().unwrap() {
            ExchangeEvent::Trade(t) => {
                assert_eq!(t.agg_id, 42);
                assert_eq!(t.price, "89.01");
                assert!(!t.buyer_is_maker);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn decodes_depth_frame() {
        let (tx, rx) = unbounded();
        let raw = r#"{"stream":"btcusdt@depth@100ms","data":{
            "e":"depthUpdate","E":1700000000100,"s":"BTCUSDT","U":10,"u":12,
            "b":[["88.99","1000"]],"a":[["89.01","0"]]}}"#;
        decode_frame(raw, &tx);
        match rx.try_recv().unwrap() {
            ExchangeEvent::Depth(d) => {
                assert_eq!(d.first_update_id, 10);
                assert_eq!(d.final_update_id, 12);
                assert_eq!(d.asks[0][1], "0");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn garbage_frames_are_dropped_silently() {
        let (tx, rx) = unbounded();
        decode_frame("not json", &tx);
        decode_frame(r#"{"stream":"btcusdt@aggTrade","data":{"bogus":1}}"#, &tx);
        assert!(rx.try_recv().is_err());
    }
}
