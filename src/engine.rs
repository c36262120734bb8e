//! Ingest engine.
//!
//! One OS thread owns the order book, the preprocessor, the spoofing
//! tracker and every detector. Events arrive on a single channel in
//! exchange order; everything leaving the thread is a value copy. No call
//! in here blocks and no error escapes the loop.

use crate::api::{HealthSnapshot, SharedHealth};
use crate::config::Config;
use crate::detectors::{
    AbsorptionDetector, AccumulationDetector, DeltaCvdDetector, Detector, DetectorContext,
    ExhaustionDetector, SpoofingDetector,
};
use crate::feed::SnapshotRequest;
use crate::market::{DepthOutcome, Preprocessor};
use crate::metrics::MetricsCollector;
use crate::models::{ConfirmedSignal, ExchangeEvent, WsServerEvent};
use crate::orderbook::OrderBook;
use crate::signals::worker::SignalWorkerMsg;
use chrono::Utc;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

/// Everything the ingest thread consumes.
pub enum IngestEvent {
    Exchange(ExchangeEvent),
    /// Confirmation feedback so detectors can track their hit rate.
    SignalConfirmed(ConfirmedSignal),
    ResetDetectors,
    Shutdown,
}

/// Book-depth shown in dashboard frames.
const FRAME_DEPTH: usize = 20;

/// Cadence of health publication and zone maintenance.
const MAINTENANCE_INTERVAL_MS: u64 = 1_000;

pub struct Engine {
    config: Arc<Config>,
    metrics: Arc<MetricsCollector>,
    book: OrderBook,
    preprocessor: Preprocessor,
    spoofing: SpoofingDetector,
    detectors: Vec<Box<dyn Detector>>,
    signal_tx: Sender<SignalWorkerMsg>,
    broadcast_tx: broadcast::Sender<WsServerEvent>,
    snapshot_tx: mpsc::UnboundedSender<SnapshotRequest>,
    health: SharedHealth,

    last_prune: Instant,
    last_resync: Instant,
    last_maintenance: Instant,
    last_frame: Instant,
    last_stats: Instant,
    last_price_forward: Instant,
    last_snapshot_request: Instant,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        metrics: Arc<MetricsCollector>,
        signal_tx: Sender<SignalWorkerMsg>,
        broadcast_tx: broadcast::Sender<WsServerEvent>,
        snapshot_tx: mpsc::UnboundedSender<SnapshotRequest>,
        health: SharedHealth,
    ) -> Self {
        let pre = &config.preprocessor;
        let book = OrderBook::new(&config.orderbook, pre.tick_size);
        let preprocessor = Preprocessor::new(pre.clone(), metrics.clone());
        let spoofing = SpoofingDetector::new(config.spoofing.clone());
        let detectors: Vec<Box<dyn Detector>> = vec![
            Box::new(AbsorptionDetector::new(
                config.absorption.clone(),
                pre.tick_size,
                pre.zone_ticks,
            )),
            Box::new(ExhaustionDetector::new(
                config.exhaustion.clone(),
                pre.tick_size,
                pre.zone_ticks,
            )),
            Box::new(DeltaCvdDetector::new(
                config.delta_cvd.clone(),
                pre.tick_size,
                pre.zone_ticks,
            )),
            Box::new(AccumulationDetector::new(
                config.accumulation.clone(),
                pre.tick_size,
                pre.zone_ticks,
            )),
        ];

        let now = Instant::now();
        Self {
            config,
            metrics,
            book,
            preprocessor,
            spoofing,
            detectors,
            signal_tx,
            broadcast_tx,
            snapshot_tx,
            health,
            last_prune: now,
            last_resync: now,
            last_maintenance: now,
            last_frame: now,
            last_stats: now,
            last_price_forward: now,
            last_snapshot_request: now,
        }
    }

    /// Blocking ingest loop. Returns on `Shutdown` or channel close.
    pub fn run(mut self, rx: Receiver<IngestEvent>) {
        info!("ingest engine started");
        // Ask for the initial book snapshot.
        let _ = self.snapshot_tx.send(SnapshotRequest);

        loop {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(IngestEvent::Exchange(event)) => self.handle_exchange(event),
                Ok(IngestEvent::SignalConfirmed(signal)) => {
                    for detector in &mut self.detectors {
                        if detector.id() == signal.signal.candidate.detector_id {
                            detector.mark_signal_confirmed(&signal);
                        }
                    }
                }
                Ok(IngestEvent::ResetDetectors) => {
                    for detector in &mut self.detectors {
                        detector.reset();
                    }
                    info!("detectors reset");
                }
                Ok(IngestEvent::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.maintain();
        }
        info!("ingest engine stopped");
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn handle_exchange(&mut self, event: ExchangeEvent) {
        let now_ms = Self::now_ms();
        match event {
            ExchangeEvent::Snapshot(msg) => {
                self.preprocessor.handle_snapshot(&mut self.book, &msg, now_ms);
            }
            ExchangeEvent::Depth(msg) => {
                match self.preprocessor.handle_depth(&mut self.book, &msg, now_ms) {
                    DepthOutcome::Applied { changed } => {
                        for change in changed {
                            self.spoofing.on_level_change(
                                change.price,
                                change.side,
                                change.previous,
                                change.current,
                                now_ms,
                            );
                        }
                    }
                    DepthOutcome::GapDetected => self.request_snapshot(now_ms),
                    DepthOutcome::CircuitOpen | DepthOutcome::Rejected => {}
                }
            }
            ExchangeEvent::Trade(msg) => {
                let started = Instant::now();
                let Some(enriched) = self.preprocessor.handle_agg_trade(&self.book, &msg, now_ms)
                else {
                    return;
                };

                self.spoofing.on_trade(
                    enriched.trade.price,
                    enriched.trade.taker_side(),
                    enriched.trade.qty,
                    now_ms,
                );

                let ctx = DetectorContext { spoofing: &self.spoofing, now_ms };
                for detector in &mut self.detectors {
                    if let Some(candidate) = detector.on_enriched_trade(&enriched, &ctx) {
                        MetricsCollector::incr(&self.metrics.candidates_emitted);
                        if self.signal_tx.send(SignalWorkerMsg::Candidate(candidate)).is_err() {
                            warn!("signal worker gone, candidate dropped");
                        }
                    }
                }

                let _ = self.broadcast_tx.send(WsServerEvent::Trade {
                    data: enriched,
                    now: now_ms,
                });

                // Feed the outcome tracker at ~1Hz, not per trade.
                if self.last_price_forward.elapsed() >= Duration::from_secs(1) {
                    if let Some(mid) = self.book.get_mid_price() {
                        let _ = self
                            .signal_tx
                            .send(SignalWorkerMsg::Price { price: mid, now_ms });
                        self.last_price_forward = Instant::now();
                    }
                }

                self.metrics
                    .record_latency_us(started.elapsed().as_micros() as u64);
            }
        }
    }

    fn request_snapshot(&mut self, now_ms: i64) {
        // A gap storm should not turn into a snapshot storm.
        if self.last_snapshot_request.elapsed() < Duration::from_millis(500) {
            return;
        }
        self.last_snapshot_request = Instant::now();
        let _ = self.snapshot_tx.send(SnapshotRequest);
        let _ = self.signal_tx.send(SignalWorkerMsg::Anomaly {
            anomaly_type: "orderbook_gap".to_string(),
            anomaly_json: format!(
                r#"{{"last_update_id":{},"detected_at":{}}}"#,
                self.book.last_update_id(),
                now_ms
            ),
            severity: "high".to_string(),
            detected_at: now_ms,
        });
    }

    fn maintain(&mut self) {
        let now_ms = Self::now_ms();

        if self.last_prune.elapsed()
            >= Duration::from_millis(self.config.orderbook.prune_interval_ms)
        {
            self.book.prune();
            self.last_prune = Instant::now();
        }

        // Periodic resync keeps slow drift from accumulating between gaps.
        if self.last_resync.elapsed()
            >= Duration::from_millis(self.config.orderbook.snapshot_interval_ms)
        {
            let _ = self.snapshot_tx.send(SnapshotRequest);
            self.last_resync = Instant::now();
        }

        if self.last_maintenance.elapsed() >= Duration::from_millis(MAINTENANCE_INTERVAL_MS) {
            self.preprocessor.tick(now_ms);
            self.spoofing.tick(now_ms);

            let book_health = self.book.health(now_ms);
            if self.book.needs_snapshot() {
                self.request_snapshot(now_ms);
            } else if !book_health.circuit_open {
                let _ = self.signal_tx.send(SignalWorkerMsg::ClearAnomaly {
                    anomaly_type: "orderbook_gap".to_string(),
                });
            }

            let status = if book_health.healthy { "healthy" } else { "degraded" };
            let mut snapshot = HealthSnapshot {
                status: status.to_string(),
                book: Some(book_health),
                detectors: self.detectors.iter().map(|d| d.status()).collect(),
                circuits: Vec::new(),
                storage_queue_depth: self
                    .metrics
                    .storage_queue_depth
                    .load(std::sync::atomic::Ordering::Relaxed),
                updated_at: now_ms,
            };
            // Preserve circuit states published by the signal worker.
            snapshot.circuits = self.health.get().circuits;
            self.health.update(snapshot);
            self.last_maintenance = Instant::now();
        }

        if self.last_frame.elapsed()
            >= Duration::from_millis(self.config.broadcast.dashboard_update_interval_ms)
        {
            let _ = self.broadcast_tx.send(WsServerEvent::Orderbook {
                data: self.book.frame(FRAME_DEPTH),
                now: now_ms,
            });
            self.last_frame = Instant::now();
        }

        if self.last_stats.elapsed() >= Duration::from_millis(self.config.broadcast.stats_interval_ms)
        {
            let stats = serde_json::json!({
                "metrics": self.metrics.snapshot(),
                "health": self.health.get(),
                "data_stream": {
                    "book_levels": self.book.len(),
                    "last_update_id": self.book.last_update_id(),
                },
            });
            let _ = self.broadcast_tx.send(WsServerEvent::Stats { data: stats, now: now_ms });
            self.last_stats = Instant::now();
        }
    }
}
