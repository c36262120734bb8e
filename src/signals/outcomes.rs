//! Signal outcome tracking.
//!
//! Each confirmed signal gets an excursion record: price sampled at fixed
//! horizons after entry, max favorable and adverse prices along the way,
//! and a final verdict at the last horizon. Active records survive a
//! restart through the outcome table.

use crate::config::OutcomesConfig;
use crate::financial_math::Price;
use crate::models::{ConfirmedSignal, OutcomeState, Side, SignalOutcome};
use crate::signals::StorageHandle;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

const HORIZON_1M_MS: i64 = 60_000;
const HORIZON_5M_MS: i64 = 5 * 60_000;
const HORIZON_15M_MS: i64 = 15 * 60_000;
const HORIZON_60M_MS: i64 = 60 * 60_000;

pub struct OutcomeTracker {
    tick: Price,
    success_threshold_ticks: i64,
    storage: StorageHandle,
    active: HashMap<Uuid, SignalOutcome>,
}

impl OutcomeTracker {
    pub fn new(config: &OutcomesConfig, tick: Price, storage: StorageHandle) -> Self {
        Self {
            tick,
            success_threshold_ticks: config.success_threshold_ticks,
            storage,
            active: HashMap::new(),
        }
    }

    /// Reload unfinished records after a restart.
    pub fn restore(&mut self) {
        for outcome in self.storage.active_outcomes() {
            self.active.insert(outcome.signal_id, outcome);
        }
        if !self.active.is_empty() {
            debug!(count = self.active.len(), "restored active signal outcomes");
        }
    }

    pub fn on_confirmed(&mut self, signal: &ConfirmedSignal) {
        let outcome = SignalOutcome {
            signal_id: signal.signal.id,
            side: signal.signal.candidate.side,
            entry_price: signal.final_price,
            entry_ts: signal.confirmed_at,
            price_after_1m: None,
            price_after_5m: None,
            price_after_15m: None,
            price_after_60m: None,
            max_favorable: signal.final_price,
            max_adverse: signal.final_price,
            outcome: OutcomeState::Pending,
            is_active: true,
        };
        self.storage.upsert_outcome(outcome.clone());
        self.active.insert(outcome.signal_id, outcome);
    }

    /// Signed favorable excursion in ticks: positive is a move in the
    /// signal's direction.
    fn favorable_ticks(side: Side, entry: Price, price: Price, tick: Price) -> i64 {
        match side {
            Side::Buy => price.ticks_from(entry, tick),
            Side::Sell => entry.ticks_from(price, tick),
        }
    }

    /// Fold one market price into every active record; persists records
    /// that crossed a horizon or finished.
    pub fn on_price(&mut self, price: Price, now_ms: i64) {
        let mut finished: Vec<Uuid> = Vec::new();
        for outcome in self.active.values_mut() {
            let elapsed = now_ms - outcome.entry_ts;
            if elapsed < 0 {
                continue;
            }

            let fav_now =
                Self::favorable_ticks(outcome.side, outcome.entry_price, price, self.tick);
            let best_fav = Self::favorable_ticks(
                outcome.side,
                outcome.entry_price,
                outcome.max_favorable,
                self.tick,
            );
            let worst_adv = Self::favorable_ticks(
                outcome.side,
                outcome.entry_price,
                outcome.max_adverse,
                self.tick,
            );
            if fav_now > best_fav {
                outcome.max_favorable = price;
            }
            if fav_now < worst_adv {
                outcome.max_adverse = price;
            }

            let mut crossed = false;
            for (slot, horizon) in [
                (&mut outcome.price_after_1m, HORIZON_1M_MS),
                (&mut outcome.price_after_5m, HORIZON_5M_MS),
                (&mut outcome.price_after_15m, HORIZON_15M_MS),
                (&mut outcome.price_after_60m, HORIZON_60M_MS),
            ] {
                if slot.is_none() && elapsed >= horizon {
                    *slot = Some(price);
                    crossed = true;
                }
            }

            if elapsed >= HORIZON_60M_MS {
                let fav = Self::favorable_ticks(
                    outcome.side,
                    outcome.entry_price,
                    outcome.max_favorable,
                    self.tick,
                );
                let adv = -Self::favorable_ticks(
                    outcome.side,
                    outcome.entry_price,
                    outcome.max_adverse,
                    self.tick,
                );
                let threshold = self.success_threshold_ticks;
                outcome.outcome = match (fav >= threshold, adv >= threshold) {
                    (true, false) => OutcomeState::Success,
                    (false, true) => OutcomeState::Failure,
                    (true, true) => OutcomeState::Mixed,
                    (false, false) => OutcomeState::Timeout,
                };
                outcome.is_active = false;
                if outcome.outcome == OutcomeState::Failure {
                    let analysis = serde_json::json!({
                        "side": outcome.side.as_str(),
                        "entry_price": outcome.entry_price,
                        "max_favorable_ticks": fav,
                        "max_adverse_ticks": adv,
                        "price_after_60m": outcome.price_after_60m,
                    });
                    self.storage.insert_failed_analysis(
                        outcome.signal_id,
                        analysis.to_string(),
                        now_ms,
                    );
                }
                finished.push(outcome.signal_id);
                crossed = true;
            }

            if crossed {
                self.storage.upsert_outcome(outcome.clone());
            }
        }
        for id in finished {
            self.active.remove(&id);
        }
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::metrics::MetricsCollector;
    use crate::models::{ProcessedSignal, SignalCandidate, SignalType};
    use crate::signals::StorageWorker;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn p(s: &str) -> Price {
        Price::parse(s).unwrap()
    }

    fn confirmed(side: Side, entry: &str, ts: i64) -> ConfirmedSignal {
        ConfirmedSignal {
            signal: ProcessedSignal {
                id: Uuid::new_v4(),
                candidate: SignalCandidate {
                    id: Uuid::new_v4(),
                    detector_id: "absorption".into(),
                    signal_type: SignalType::Absorption,
                    side,
                    confidence: 0.8,
                    price: p(entry),
                    ts,
                    data: json!({}),
                },
                confirmations: 1,
                confirmed_by: vec!["absorption".into()],
                correlated_ids: vec![],
                processed_at: ts,
            },
            final_price: p(entry),
            position_size: 1.0,
            confirmed_at: ts,
        }
    }

    struct Fixture {
        tracker: OutcomeTracker,
        worker: StorageWorker,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let mut storage_config = StorageConfig::default();
        storage_config.path = dir.path().join("p.db").to_string_lossy().into_owned();
        let worker =
            StorageWorker::spawn(&storage_config, Arc::new(MetricsCollector::new())).unwrap();
        let tracker = OutcomeTracker::new(
            &OutcomesConfig::default(),
            p("0.01"),
            worker.handle(),
        );
        Fixture { tracker, worker, _dir: dir }
    }

    #[test]
    fn buy_signal_rising_price_finalizes_success() {
        let mut fx = fixture();
        let signal = confirmed(Side::Buy, "89.00", 0);
        fx.tracker.on_confirmed(&signal);

        fx.tracker.on_price(p("89.05"), 30_000);
        fx.tracker.on_price(p("89.20"), HORIZON_1M_MS); // +20 ticks, past threshold
        fx.tracker.on_price(p("89.15"), HORIZON_5M_MS);
        fx.tracker.on_price(p("89.15"), HORIZON_15M_MS);
        fx.tracker.on_price(p("89.12"), HORIZON_60M_MS);
        assert_eq!(fx.tracker.active_len(), 0);

        // Give the storage worker a synchronization point.
        let _ = fx.worker.handle().stats();
        let stored = fx
            .worker
            .handle()
            .active_outcomes();
        assert!(stored.is_empty(), "finalized outcomes are not active");
        fx.worker.shutdown();
    }

    #[test]
    fn horizons_capture_first_price_after_each_mark() {
        let mut fx = fixture();
        let signal = confirmed(Side::Buy, "89.00", 0);
        let id = signal.signal.id;
        fx.tracker.on_confirmed(&signal);

        fx.tracker.on_price(p("89.02"), HORIZON_1M_MS + 10);
        fx.tracker.on_price(p("89.04"), HORIZON_5M_MS + 10);

        let outcome = fx.tracker.active.get(&id).unwrap();
        assert_eq!(outcome.price_after_1m, Some(p("89.02")));
        assert_eq!(outcome.price_after_5m, Some(p("89.04")));
        assert_eq!(outcome.price_after_15m, None);
        fx.worker.shutdown();
    }

    #[test]
    fn sell_signal_rising_price_is_adverse() {
        let mut fx = fixture();
        let signal = confirmed(Side::Sell, "89.00", 0);
        let id = signal.signal.id;
        fx.tracker.on_confirmed(&signal);

        fx.tracker.on_price(p("89.30"), 10_000);
        let outcome = fx.tracker.active.get(&id).unwrap();
        assert_eq!(outcome.max_adverse, p("89.30"));
        assert_eq!(outcome.max_favorable, p("89.00"));

        fx.tracker.on_price(p("89.25"), HORIZON_60M_MS);
        let _ = fx.worker.handle().stats();
        let stored_active = fx.worker.handle().active_outcomes();
        assert!(stored_active.is_empty());
        fx.worker.shutdown();
    }

    #[test]
    fn flat_price_times_out() {
        let mut fx = fixture();
        let signal = confirmed(Side::Buy, "89.00", 0);
        fx.tracker.on_confirmed(&signal);
        fx.tracker.on_price(p("89.01"), HORIZON_60M_MS);
        assert_eq!(fx.tracker.active_len(), 0);
        fx.worker.shutdown();
    }

    #[test]
    fn restore_reloads_active_records() {
        let dir = tempdir().unwrap();
        let mut storage_config = StorageConfig::default();
        storage_config.path = dir.path().join("p.db").to_string_lossy().into_owned();

        let signal = confirmed(Side::Buy, "89.00", 0);
        {
            let worker =
                StorageWorker::spawn(&storage_config, Arc::new(MetricsCollector::new())).unwrap();
            let mut tracker =
                OutcomeTracker::new(&OutcomesConfig::default(), p("0.01"), worker.handle());
            tracker.on_confirmed(&signal);
            worker.shutdown();
        }

        let worker =
            StorageWorker::spawn(&storage_config, Arc::new(MetricsCollector::new())).unwrap();
        let mut tracker =
            OutcomeTracker::new(&OutcomesConfig::default(), p("0.01"), worker.handle());
        tracker.restore();
        assert_eq!(tracker.active_len(), 1);
        worker.shutdown();
    }
}
