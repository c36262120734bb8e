//! Signal coordinator.
//!
//! Every candidate becomes a durable job before it is considered; draining
//! moves jobs queue -> active inside one transaction, and completion is the
//! only thing that removes them. Confirmation is N-of-M across distinct
//! detectors agreeing on side and type-family within a window; duplicates
//! inside the dedup window collapse, including across restarts.

use crate::config::CoordinatorConfig;
use crate::financial_math::Price;
use crate::metrics::MetricsCollector;
use crate::models::{ConfirmedSignal, Job, ProcessedSignal, Side, SignalCandidate, SignalType};
use crate::signals::StorageHandle;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

struct ProcessedRecord {
    ts: i64,
    signal_type: SignalType,
    side: Side,
    price_raw: i64,
}

pub struct SignalCoordinator {
    config: CoordinatorConfig,
    symbol: String,
    price_tolerance_raw: i64,
    storage: StorageHandle,
    metrics: Arc<MetricsCollector>,
    /// Candidates awaiting enough confirmations.
    pending: Vec<SignalCandidate>,
    /// Recently processed signals, for dedup collapse.
    processed_log: VecDeque<ProcessedRecord>,
}

impl SignalCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        symbol: String,
        tick: Price,
        storage: StorageHandle,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let price_tolerance_raw = config.price_tolerance_ticks.saturating_mul(tick.raw());
        Self {
            config,
            symbol,
            price_tolerance_raw,
            storage,
            metrics,
            pending: Vec::new(),
            processed_log: VecDeque::new(),
        }
    }

    /// Seed the dedup window from signals confirmed before a restart, so a
    /// replayed job cannot emit the same signal twice.
    pub fn seed_dedup(&mut self, confirmed: &[ConfirmedSignal]) {
        for signal in confirmed {
            self.processed_log.push_back(ProcessedRecord {
                ts: signal.confirmed_at,
                signal_type: signal.signal.candidate.signal_type,
                side: signal.signal.candidate.side,
                price_raw: signal.signal.candidate.price.raw(),
            });
        }
    }

    /// Persist a candidate as a durable job. Called from the ingest side.
    pub fn submit(&self, candidate: SignalCandidate) {
        let priority = self
            .config
            .detector_priorities
            .get(&candidate.detector_id)
            .copied()
            .unwrap_or(0);
        let job = Job {
            id: Uuid::new_v4(),
            detector_id: candidate.detector_id.clone(),
            enqueued_at: candidate.ts,
            candidate,
            priority,
            retry_count: 0,
            started_at: None,
        };
        self.storage.enqueue_job(job);
    }

    /// Drain a batch of durable jobs and run confirmation over them.
    pub fn run_cycle(&mut self, now_ms: i64) -> Vec<ProcessedSignal> {
        let jobs = self.storage.drain_jobs(self.config.drain_batch_size, now_ms);
        self.process_jobs(jobs, now_ms)
    }

    /// Process restored jobs at startup, in their drain order.
    pub fn process_jobs(&mut self, jobs: Vec<Job>, now_ms: i64) -> Vec<ProcessedSignal> {
        let mut emitted = Vec::new();
        for job in jobs {
            let job_id = job.id;
            if let Some(signal) = self.handle_candidate(job.candidate, now_ms) {
                emitted.push(signal);
            }
            self.storage.complete_job(job_id);
        }
        MetricsCollector::set_gauge(&self.metrics.coordinator_pending, self.pending.len() as i64);
        emitted
    }

    fn is_duplicate(&self, candidate: &SignalCandidate) -> bool {
        self.processed_log.iter().any(|rec| {
            rec.signal_type == candidate.signal_type
                && rec.side == candidate.side
                && (rec.price_raw - candidate.price.raw()).abs() <= self.price_tolerance_raw
                && candidate.ts - rec.ts <= self.config.deduplication_window_ms
        })
    }

    fn handle_candidate(
        &mut self,
        candidate: SignalCandidate,
        now_ms: i64,
    ) -> Option<ProcessedSignal> {
        // Expire stale state first.
        let expiry = now_ms - self.config.signal_expiry_ms;
        self.pending.retain(|c| c.ts >= expiry);
        let dedup_floor = now_ms - self.config.deduplication_window_ms;
        while matches!(self.processed_log.front(), Some(rec) if rec.ts < dedup_floor) {
            self.processed_log.pop_front();
        }

        if self.is_duplicate(&candidate) {
            MetricsCollector::incr(&self.metrics.signals_deduplicated);
            debug!(
                detector = %candidate.detector_id,
                side = candidate.side.as_str(),
                "candidate collapsed into dedup window"
            );
            return None;
        }

        self.pending.push(candidate.clone());

        // Agreement set: same family and side, close in price and time.
        let family = candidate.signal_type.family();
        let group: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.signal_type.family() == family
                    && c.side == candidate.side
                    && (c.price.raw() - candidate.price.raw()).abs() <= self.price_tolerance_raw
                    && candidate.ts - c.ts <= self.config.confirmation_window_ms
            })
            .map(|(i, _)| i)
            .collect();

        let mut detectors: Vec<String> = group
            .iter()
            .map(|&i| self.pending[i].detector_id.clone())
            .collect();
        detectors.sort_unstable();
        detectors.dedup();
        if (detectors.len() as u32) < self.config.required_confirmations {
            return None;
        }

        // Primary candidate is the most confident member of the group; the
        // group always contains at least the candidate just pushed.
        let mut primary_idx = self.pending.len() - 1;
        for &i in &group {
            if self.pending[i].confidence > self.pending[primary_idx].confidence {
                primary_idx = i;
            }
        }

        let confirmed_by: Vec<String> = detectors.iter().map(|d| d.to_string()).collect();
        let correlated_ids: Vec<Uuid> = group.iter().map(|&i| self.pending[i].id).collect();
        let primary = self.pending[primary_idx].clone();

        // Consume the whole agreement set.
        let mut keep = Vec::with_capacity(self.pending.len());
        for (i, c) in self.pending.drain(..).enumerate() {
            if !group.contains(&i) {
                keep.push(c);
            }
        }
        self.pending = keep;

        self.processed_log.push_back(ProcessedRecord {
            ts: primary.ts,
            signal_type: primary.signal_type,
            side: primary.side,
            price_raw: primary.price.raw(),
        });

        let signal = ProcessedSignal {
            id: Uuid::new_v4(),
            confirmations: detectors.len() as u32,
            confirmed_by,
            correlated_ids,
            candidate: primary,
            processed_at: now_ms,
        };
        self.storage.insert_history(signal.clone(), self.symbol.clone());
        MetricsCollector::incr(&self.metrics.signals_processed);
        Some(signal)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
