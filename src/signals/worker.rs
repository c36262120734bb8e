//! Signal worker thread.
//!
//! Consumes candidates from the ingest thread, runs them through the
//! durable coordinator and the manager, then persists, broadcasts and
//! alerts on confirmed signals. Also owns the outcome tracker and the
//! anomaly ledger writes.

use crate::config::Config;
use crate::engine::IngestEvent;
use crate::financial_math::Price;
use crate::metrics::MetricsCollector;
use crate::models::{SignalCandidate, WsServerEvent};
use crate::api::SharedHealth;
use crate::signals::{OutcomeTracker, SignalCoordinator, SignalManager, StorageHandle};
use chrono::Utc;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

pub enum SignalWorkerMsg {
    Candidate(SignalCandidate),
    Price { price: Price, now_ms: i64 },
    Anomaly { anomaly_type: String, anomaly_json: String, severity: String, detected_at: i64 },
    ClearAnomaly { anomaly_type: String },
    Shutdown,
}

/// Cycle cadence when no messages arrive.
const IDLE_CYCLE_MS: u64 = 50;

pub struct SignalWorker {
    config: Arc<Config>,
    metrics: Arc<MetricsCollector>,
    storage: StorageHandle,
    coordinator: SignalCoordinator,
    manager: SignalManager,
    outcomes: OutcomeTracker,
    broadcast_tx: broadcast::Sender<WsServerEvent>,
    feedback_tx: Sender<IngestEvent>,
    health: SharedHealth,
    last_price: Option<Price>,
}

impl SignalWorker {
    pub fn new(
        config: Arc<Config>,
        metrics: Arc<MetricsCollector>,
        storage: StorageHandle,
        broadcast_tx: broadcast::Sender<WsServerEvent>,
        feedback_tx: Sender<IngestEvent>,
        health: SharedHealth,
    ) -> Self {
        let coordinator = SignalCoordinator::new(
            config.coordinator.clone(),
            config.feed.symbol.clone(),
            config.preprocessor.tick_size,
            storage.clone(),
            metrics.clone(),
        );
        let manager = SignalManager::new(config.manager.clone(), metrics.clone());
        let outcomes = OutcomeTracker::new(
            &config.outcomes,
            config.preprocessor.tick_size,
            storage.clone(),
        );
        Self {
            config,
            metrics,
            storage,
            coordinator,
            manager,
            outcomes,
            broadcast_tx,
            feedback_tx,
            health,
            last_price: None,
        }
    }

    /// Restore durable state, then run until shutdown.
    pub fn run(mut self, rx: Receiver<SignalWorkerMsg>) {
        let now_ms = Utc::now().timestamp_millis();

        // Seed dedup from signals confirmed before the restart, then replay
        // whatever was still queued or in flight.
        let recent =
            self.storage.recent_confirmed(now_ms - self.config.coordinator.deduplication_window_ms);
        self.coordinator.seed_dedup(&recent);
        let restored = self.storage.restore();
        if !restored.is_empty() {
            info!(count = restored.len(), "replaying restored coordinator jobs");
            let processed = self.coordinator.process_jobs(restored, now_ms);
            for signal in processed {
                self.manager.enqueue(signal);
            }
        }
        self.outcomes.restore();
        info!("signal worker started");

        loop {
            match rx.recv_timeout(Duration::from_millis(IDLE_CYCLE_MS)) {
                Ok(SignalWorkerMsg::Candidate(candidate)) => {
                    self.coordinator.submit(candidate);
                }
                Ok(SignalWorkerMsg::Price { price, now_ms }) => {
                    self.last_price = Some(price);
                    self.outcomes.on_price(price, now_ms);
                }
                Ok(SignalWorkerMsg::Anomaly { anomaly_type, anomaly_json, severity, detected_at }) => {
                    self.storage
                        .upsert_anomaly(&anomaly_type, anomaly_json, &severity, detected_at);
                }
                Ok(SignalWorkerMsg::ClearAnomaly { anomaly_type }) => {
                    self.storage.clear_anomaly(&anomaly_type);
                }
                Ok(SignalWorkerMsg::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.cycle();
        }
        info!("signal worker stopped");
    }

    fn cycle(&mut self) {
        let now_ms = Utc::now().timestamp_millis();

        for signal in self.coordinator.run_cycle(now_ms) {
            self.manager.enqueue(signal);
        }

        let confirmed = self.manager.process_batch(now_ms, self.last_price);
        for signal in confirmed {
            self.storage.insert_confirmed(signal.clone());
            self.outcomes.on_confirmed(&signal);
            // Market context travels with the signal for post-hoc review.
            let context = serde_json::json!({
                "final_price": signal.final_price,
                "position_size": signal.position_size,
                "confirmations": signal.signal.confirmations,
                "confirmed_by": signal.signal.confirmed_by,
            });
            self.storage
                .insert_market_context(signal.signal.id, context.to_string(), now_ms);

            let _ = self.feedback_tx.send(IngestEvent::SignalConfirmed(signal.clone()));
            let _ = self.broadcast_tx.send(WsServerEvent::Signal {
                data: signal,
                now: now_ms,
            });
        }

        MetricsCollector::set_gauge(
            &self.metrics.coordinator_pending,
            self.coordinator.pending_len() as i64,
        );
        self.health
            .update_circuits(vec![self.manager.circuit_status()]);
    }
}
