//! Storage worker thread.
//!
//! The only thread that touches the SQLite connection. Callers talk over a
//! bounded crossbeam channel; when the queue is full the send blocks, which
//! is the backpressure contract. Write failures retry with exponential
//! backoff; jobs that keep failing are parked in the dead-letter table.

use crate::config::StorageConfig;
use crate::metrics::MetricsCollector;
use crate::models::{ConfirmedSignal, Job, ProcessedSignal, SignalOutcome};
use crate::signals::pipeline_storage::{PipelineStorage, StorageStats};
use anyhow::Result;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub enum StorageRequest {
    EnqueueJob(Job),
    DrainJobs { limit: usize, now_ms: i64, reply: Sender<Vec<Job>> },
    CompleteJob(Uuid),
    Restore { reply: Sender<Vec<Job>> },
    InsertHistory { signal: ProcessedSignal, symbol: String },
    InsertConfirmed(ConfirmedSignal),
    RecentConfirmed { since_ts: i64, reply: Sender<Vec<ConfirmedSignal>> },
    UpsertAnomaly { anomaly_type: String, anomaly_json: String, severity: String, detected_at: i64 },
    ClearAnomaly(String),
    UpsertOutcome(SignalOutcome),
    ActiveOutcomes { reply: Sender<Vec<SignalOutcome>> },
    InsertMarketContext { signal_id: Uuid, context_json: String, now_ms: i64 },
    InsertFailedAnalysis { signal_id: Uuid, analysis_json: String, now_ms: i64 },
    Stats { reply: Sender<StorageStats> },
    Shutdown,
}

/// Cheap cloneable handle used by the coordinator worker and the API layer.
#[derive(Clone)]
pub struct StorageHandle {
    tx: Sender<StorageRequest>,
    metrics: Arc<MetricsCollector>,
    backpressure_threshold: usize,
}

impl StorageHandle {
    /// True when the request queue is deep enough that producers should
    /// yield before submitting more work. Sends past the hard capacity
    /// block until the worker catches up.
    pub fn under_backpressure(&self) -> bool {
        self.tx.len() > self.backpressure_threshold
    }

    fn send(&self, request: StorageRequest) {
        MetricsCollector::set_gauge(&self.metrics.storage_queue_depth, self.tx.len() as i64);
        if self.under_backpressure() {
            warn!(depth = self.tx.len(), "storage queue over backpressure threshold");
        }
        if self.tx.send(request).is_err() {
            warn!("storage worker gone; request dropped");
        }
    }

    pub fn enqueue_job(&self, job: Job) {
        self.send(StorageRequest::EnqueueJob(job));
    }

    pub fn drain_jobs(&self, limit: usize, now_ms: i64) -> Vec<Job> {
        let (reply, rx) = bounded(1);
        self.send(StorageRequest::DrainJobs { limit, now_ms, reply });
        rx.recv().unwrap_or_default()
    }

    pub fn complete_job(&self, job_id: Uuid) {
        self.send(StorageRequest::CompleteJob(job_id));
    }

    pub fn restore(&self) -> Vec<Job> {
        let (reply, rx) = bounded(1);
        self.send(StorageRequest::Restore { reply });
        rx.recv().unwrap_or_default()
    }

    pub fn insert_history(&self, signal: ProcessedSignal, symbol: String) {
        self.send(StorageRequest::InsertHistory { signal, symbol });
    }

    pub fn insert_confirmed(&self, signal: ConfirmedSignal) {
        self.send(StorageRequest::InsertConfirmed(signal));
    }

    pub fn recent_confirmed(&self, since_ts: i64) -> Vec<ConfirmedSignal> {
        let (reply, rx) = bounded(1);
        self.send(StorageRequest::RecentConfirmed { since_ts, reply });
        rx.recv().unwrap_or_default()
    }

    pub fn upsert_anomaly(&self, anomaly_type: &str, anomaly_json: String, severity: &str, detected_at: i64) {
        self.send(StorageRequest::UpsertAnomaly {
            anomaly_type: anomaly_type.to_string(),
            anomaly_json,
            severity: severity.to_string(),
            detected_at,
        });
    }

    pub fn clear_anomaly(&self, anomaly_type: &str) {
        self.send(StorageRequest::ClearAnomaly(anomaly_type.to_string()));
    }

    pub fn upsert_outcome(&self, outcome: SignalOutcome) {
        self.send(StorageRequest::UpsertOutcome(outcome));
    }

    pub fn active_outcomes(&self) -> Vec<SignalOutcome> {
        let (reply, rx) = bounded(1);
        self.send(StorageRequest::ActiveOutcomes { reply });
        rx.recv().unwrap_or_default()
    }

    pub fn insert_market_context(&self, signal_id: Uuid, context_json: String, now_ms: i64) {
        self.send(StorageRequest::InsertMarketContext { signal_id, context_json, now_ms });
    }

    pub fn insert_failed_analysis(&self, signal_id: Uuid, analysis_json: String, now_ms: i64) {
        self.send(StorageRequest::InsertFailedAnalysis { signal_id, analysis_json, now_ms });
    }

    pub fn stats(&self) -> Option<StorageStats> {
        let (reply, rx) = bounded(1);
        self.send(StorageRequest::Stats { reply });
        rx.recv().ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(StorageRequest::Shutdown);
    }
}

pub struct StorageWorker {
    handle: StorageHandle,
    join: JoinHandle<()>,
}

impl StorageWorker {
    /// Open the database and spin up the worker thread.
    pub fn spawn(config: &StorageConfig, metrics: Arc<MetricsCollector>) -> Result<Self> {
        let storage = PipelineStorage::open(&config.path)?;
        let (tx, rx) = bounded::<StorageRequest>(config.queue_capacity);
        let handle = StorageHandle {
            tx,
            metrics: metrics.clone(),
            backpressure_threshold: config.backpressure_threshold,
        };
        let max_retries = config.max_retries;
        let backoff_base_ms = config.backoff_base_ms;

        let join = thread::Builder::new()
            .name("storage-worker".into())
            .spawn(move || {
                run_worker(storage, rx, metrics, max_retries, backoff_base_ms);
            })?;

        Ok(Self { handle, join })
    }

    pub fn handle(&self) -> StorageHandle {
        self.handle.clone()
    }

    /// Request shutdown and wait for the queue to flush.
    pub fn shutdown(self) {
        self.handle.shutdown();
        if self.join.join().is_err() {
            error!("storage worker panicked during shutdown");
        }
    }
}

fn run_worker(
    mut storage: PipelineStorage,
    rx: Receiver<StorageRequest>,
    metrics: Arc<MetricsCollector>,
    max_retries: u32,
    backoff_base_ms: u64,
) {
    info!("storage worker started");
    while let Ok(request) = rx.recv() {
        MetricsCollector::set_gauge(&metrics.storage_queue_depth, rx.len() as i64);
        match request {
            StorageRequest::Shutdown => break,
            StorageRequest::EnqueueJob(job) => {
                let outcome = with_retries(&metrics, max_retries, backoff_base_ms, || {
                    storage.enqueue_job(&job)
                });
                if let Err(e) = outcome {
                    MetricsCollector::incr(&metrics.dead_letters);
                    let reason = format!("enqueue failed after retries: {e}");
                    if let Err(dead_err) = storage.dead_letter_job(&job, &reason, job.enqueued_at) {
                        error!(error = %dead_err, "dead-letter write failed; job lost");
                    }
                }
            }
            StorageRequest::DrainJobs { limit, now_ms, reply } => {
                let jobs = with_retries(&metrics, max_retries, backoff_base_ms, || {
                    storage.drain_jobs(limit, now_ms)
                })
                .unwrap_or_else(|e| {
                    error!(error = %e, "drain failed after retries");
                    Vec::new()
                });
                let _ = reply.send(jobs);
            }
            StorageRequest::CompleteJob(job_id) => {
                log_failure("complete_job", with_retries(&metrics, max_retries, backoff_base_ms, || {
                    storage.complete_job(job_id)
                }));
            }
            StorageRequest::Restore { reply } => {
                let jobs = with_retries(&metrics, max_retries, backoff_base_ms, || storage.restore())
                    .unwrap_or_else(|e| {
                        error!(error = %e, "restore failed after retries");
                        Vec::new()
                    });
                let _ = reply.send(jobs);
            }
            StorageRequest::InsertHistory { signal, symbol } => {
                log_failure("insert_history", with_retries(&metrics, max_retries, backoff_base_ms, || {
                    storage.insert_history(&signal, &symbol)
                }));
            }
            StorageRequest::InsertConfirmed(signal) => {
                log_failure("insert_confirmed", with_retries(&metrics, max_retries, backoff_base_ms, || {
                    storage.insert_confirmed(&signal)
                }));
            }
            StorageRequest::RecentConfirmed { since_ts, reply } => {
                let signals = storage.recent_confirmed(since_ts).unwrap_or_default();
                let _ = reply.send(signals);
            }
            StorageRequest::UpsertAnomaly { anomaly_type, anomaly_json, severity, detected_at } => {
                log_failure("upsert_anomaly", with_retries(&metrics, max_retries, backoff_base_ms, || {
                    storage.upsert_anomaly(&anomaly_type, &anomaly_json, &severity, detected_at)
                }));
            }
            StorageRequest::ClearAnomaly(anomaly_type) => {
                log_failure("clear_anomaly", with_retries(&metrics, max_retries, backoff_base_ms, || {
                    storage.clear_anomaly(&anomaly_type)
                }));
            }
            StorageRequest::UpsertOutcome(outcome) => {
                log_failure("upsert_outcome", with_retries(&metrics, max_retries, backoff_base_ms, || {
                    storage.upsert_outcome(&outcome)
                }));
            }
            StorageRequest::ActiveOutcomes { reply } => {
                let _ = reply.send(storage.active_outcomes().unwrap_or_default());
            }
            StorageRequest::InsertMarketContext { signal_id, context_json, now_ms } => {
                log_failure("insert_market_context", with_retries(&metrics, max_retries, backoff_base_ms, || {
                    storage.insert_market_context(signal_id, &context_json, now_ms)
                }));
            }
            StorageRequest::InsertFailedAnalysis { signal_id, analysis_json, now_ms } => {
                log_failure("insert_failed_analysis", with_retries(&metrics, max_retries, backoff_base_ms, || {
                    storage.insert_failed_analysis(signal_id, &analysis_json, now_ms)
                }));
            }
            StorageRequest::Stats { reply } => {
                if let Ok(stats) = storage.stats() {
                    let _ = reply.send(stats);
                }
            }
        }
    }
    info!("storage worker stopped");
}

fn with_retries<T>(
    metrics: &MetricsCollector,
    max_retries: u32,
    backoff_base_ms: u64,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                MetricsCollector::incr(&metrics.storage_retries);
                let backoff = backoff_base_ms.saturating_mul(1 << (attempt - 1).min(8));
                warn!(attempt, backoff_ms = backoff, error = %e, "storage op failed, retrying");
                thread::sleep(Duration::from_millis(backoff));
            }
            Err(e) => return Err(e),
        }
    }
}

fn log_failure(op: &'static str, result: Result<()>) {
    if let Err(e) = result {
        error!(op, error = %e, "storage op failed after retries");
    }
}
