//! Durable pipeline storage.
//!
//! One SQLite connection, WAL mode, owned by the storage worker thread.
//! The coordinator queue tables are the crash-recovery contract: whatever
//! is in `coordinator_queue` or `coordinator_active` at startup is work
//! that must be restored.

use crate::models::{ConfirmedSignal, Job, OutcomeState, ProcessedSignal, SignalOutcome};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -16000;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS coordinator_queue (
    job_id TEXT PRIMARY KEY,
    detector_id TEXT NOT NULL,
    candidate_json TEXT NOT NULL,
    priority INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    enqueued_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_coordinator_queue_order
    ON coordinator_queue(priority DESC, enqueued_at ASC);

CREATE TABLE IF NOT EXISTS coordinator_active (
    job_id TEXT PRIMARY KEY,
    detector_id TEXT NOT NULL,
    candidate_json TEXT NOT NULL,
    priority INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    enqueued_at INTEGER NOT NULL,
    started_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS coordinator_dead_letter (
    job_id TEXT PRIMARY KEY,
    detector_id TEXT NOT NULL,
    candidate_json TEXT NOT NULL,
    retry_count INTEGER NOT NULL,
    reason TEXT NOT NULL,
    failed_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS signal_active_anomalies (
    anomaly_type TEXT PRIMARY KEY,
    anomaly_json TEXT NOT NULL,
    detected_at INTEGER NOT NULL,
    severity TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS signal_history (
    signal_id TEXT PRIMARY KEY,
    signal_json TEXT NOT NULL,
    symbol TEXT NOT NULL,
    price REAL NOT NULL,
    timestamp INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_signal_history_time
    ON signal_history(timestamp DESC);

CREATE TABLE IF NOT EXISTS confirmed_signals (
    signal_id TEXT PRIMARY KEY,
    signal_json TEXT NOT NULL,
    price REAL NOT NULL,
    timestamp INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_confirmed_signals_time
    ON confirmed_signals(timestamp DESC);

CREATE TABLE IF NOT EXISTS signal_outcomes (
    signal_id TEXT PRIMARY KEY,
    outcome_json TEXT NOT NULL,
    entry_price REAL NOT NULL,
    entry_ts INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    is_active INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_signal_outcomes_active
    ON signal_outcomes(is_active, entry_ts DESC);

CREATE TABLE IF NOT EXISTS signal_market_context (
    signal_id TEXT PRIMARY KEY,
    context_json TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS failed_signal_analysis (
    signal_id TEXT PRIMARY KEY,
    analysis_json TEXT NOT NULL,
    recorded_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub queued_jobs: usize,
    pub active_jobs: usize,
    pub dead_letters: usize,
    pub confirmed_signals: usize,
}

/// Synchronous storage facade. Only the storage worker touches this.
pub struct PipelineStorage {
    conn: Connection,
}

impl PipelineStorage {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("failed to open pipeline db at {db_path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to initialize pipeline schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {journal_mode}");
        }

        let pending: i64 = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM coordinator_queue)
                      + (SELECT COUNT(*) FROM coordinator_active)",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        info!(db = db_path, pending_jobs = pending, "pipeline storage ready");

        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // Coordinator queue
    // ------------------------------------------------------------------

    pub fn enqueue_job(&self, job: &Job) -> Result<()> {
        let candidate_json = serde_json::to_string(&job.candidate)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO coordinator_queue
             (job_id, detector_id, candidate_json, priority, retry_count, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id.to_string(),
                job.detector_id,
                candidate_json,
                job.priority,
                job.retry_count,
                job.enqueued_at,
            ],
        )?;
        Ok(())
    }

    /// Atomically move up to `limit` jobs from the queue to the active
    /// table, ordered by (priority DESC, enqueued_at ASC), and return them.
    pub fn drain_jobs(&mut self, limit: usize, now_ms: i64) -> Result<Vec<Job>> {
        let tx = self.conn.transaction()?;
        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut stmt = tx.prepare_cached(
                "SELECT job_id, detector_id, candidate_json, priority, retry_count, enqueued_at
                 FROM coordinator_queue
                 ORDER BY priority DESC, enqueued_at ASC, job_id ASC
                 LIMIT ?1",
            )?;
            let mut rows = stmt.query([limit])?;
            while let Some(row) = rows.next()? {
                if let Some(job) = Self::row_to_job(row, None)? {
                    jobs.push(job);
                }
            }

            let mut delete = tx.prepare_cached("DELETE FROM coordinator_queue WHERE job_id = ?1")?;
            let mut insert = tx.prepare_cached(
                "INSERT OR REPLACE INTO coordinator_active
                 (job_id, detector_id, candidate_json, priority, retry_count, enqueued_at, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for job in &mut jobs {
                job.started_at = Some(now_ms);
                let id = job.id.to_string();
                delete.execute([&id])?;
                insert.execute(params![
                    id,
                    job.detector_id,
                    serde_json::to_string(&job.candidate)?,
                    job.priority,
                    job.retry_count,
                    job.enqueued_at,
                    now_ms,
                ])?;
            }
        }
        tx.commit()?;
        Ok(jobs)
    }

    pub fn complete_job(&self, job_id: Uuid) -> Result<()> {
        self.conn.execute(
            "DELETE FROM coordinator_active WHERE job_id = ?1",
            [job_id.to_string()],
        )?;
        Ok(())
    }

    /// All jobs that were queued or in flight when the process stopped,
    /// in drain order. Active jobs are moved back onto the queue so a
    /// subsequent drain sees them again.
    pub fn restore(&mut self) -> Result<Vec<Job>> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO coordinator_queue
             (job_id, detector_id, candidate_json, priority, retry_count, enqueued_at)
             SELECT job_id, detector_id, candidate_json, priority, retry_count, enqueued_at
             FROM coordinator_active",
            [],
        )?;
        tx.execute("DELETE FROM coordinator_active", [])?;

        let mut jobs: Vec<Job> = Vec::new();
        {
            let mut stmt = tx.prepare_cached(
                "SELECT job_id, detector_id, candidate_json, priority, retry_count, enqueued_at
                 FROM coordinator_queue
                 ORDER BY priority DESC, enqueued_at ASC, job_id ASC",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                if let Some(job) = Self::row_to_job(row, None)? {
                    jobs.push(job);
                }
            }
        }
        tx.commit()?;
        Ok(jobs)
    }

    /// Park a poison job after retries are exhausted.
    pub fn dead_letter_job(&self, job: &Job, reason: &str, now_ms: i64) -> Result<()> {
        let candidate_json = serde_json::to_string(&job.candidate)?;
        let id = job.id.to_string();
        self.conn.execute(
            "INSERT OR REPLACE INTO coordinator_dead_letter
             (job_id, detector_id, candidate_json, retry_count, reason, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, job.detector_id, candidate_json, job.retry_count, reason, now_ms],
        )?;
        self.conn
            .execute("DELETE FROM coordinator_queue WHERE job_id = ?1", [&id])?;
        self.conn
            .execute("DELETE FROM coordinator_active WHERE job_id = ?1", [&id])?;
        Ok(())
    }

    fn row_to_job(row: &rusqlite::Row, started_at: Option<i64>) -> rusqlite::Result<Option<Job>> {
        let job_id: String = row.get(0)?;
        let detector_id: String = row.get(1)?;
        let candidate_json: String = row.get(2)?;
        let priority: i32 = row.get(3)?;
        let retry_count: u32 = row.get(4)?;
        let enqueued_at: i64 = row.get(5)?;

        let Ok(id) = Uuid::parse_str(&job_id) else {
            warn!(job_id, "dropping job with malformed id");
            return Ok(None);
        };
        let candidate = match serde_json::from_str(&candidate_json) {
            Ok(c) => c,
            Err(e) => {
                warn!(job_id, error = %e, "dropping job with malformed candidate");
                return Ok(None);
            }
        };
        Ok(Some(Job {
            id,
            detector_id,
            candidate,
            priority,
            retry_count,
            enqueued_at,
            started_at,
        }))
    }

    // ------------------------------------------------------------------
    // Signal history / confirmations
    // ------------------------------------------------------------------

    pub fn insert_history(&self, signal: &ProcessedSignal, symbol: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO signal_history
             (signal_id, signal_json, symbol, price, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                signal.id.to_string(),
                serde_json::to_string(signal)?,
                symbol,
                signal.candidate.price.to_f64(),
                signal.processed_at,
            ],
        )?;
        Ok(())
    }

    pub fn insert_confirmed(&self, signal: &ConfirmedSignal) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO confirmed_signals
             (signal_id, signal_json, price, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                signal.signal.id.to_string(),
                serde_json::to_string(signal)?,
                signal.final_price.to_f64(),
                signal.confirmed_at,
            ],
        )?;
        Ok(())
    }

    /// Confirmed signals newer than `since_ts`, newest first. Used to seed
    /// the dedup window after a restart.
    pub fn recent_confirmed(&self, since_ts: i64) -> Result<Vec<ConfirmedSignal>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT signal_json FROM confirmed_signals
             WHERE timestamp >= ?1
             ORDER BY timestamp DESC",
        )?;
        let mut rows = stmt.query([since_ts])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            match serde_json::from_str(&json) {
                Ok(signal) => out.push(signal),
                Err(e) => warn!(error = %e, "skipping malformed confirmed signal row"),
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Anomalies, outcomes, context
    // ------------------------------------------------------------------

    pub fn upsert_anomaly(
        &self,
        anomaly_type: &str,
        anomaly_json: &str,
        severity: &str,
        detected_at: i64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO signal_active_anomalies (anomaly_type, anomaly_json, detected_at, severity)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(anomaly_type) DO UPDATE SET
                anomaly_json = excluded.anomaly_json,
                detected_at = excluded.detected_at,
                severity = excluded.severity",
            params![anomaly_type, anomaly_json, detected_at, severity],
        )?;
        Ok(())
    }

    pub fn clear_anomaly(&self, anomaly_type: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM signal_active_anomalies WHERE anomaly_type = ?1",
            [anomaly_type],
        )?;
        Ok(())
    }

    pub fn active_anomalies(&self) -> Result<Vec<(String, String, i64, String)>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT anomaly_type, anomaly_json, detected_at, severity
             FROM signal_active_anomalies ORDER BY detected_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn upsert_outcome(&self, outcome: &SignalOutcome) -> Result<()> {
        self.conn.execute(
            "INSERT INTO signal_outcomes
             (signal_id, outcome_json, entry_price, entry_ts, outcome, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(signal_id) DO UPDATE SET
                outcome_json = excluded.outcome_json,
                outcome = excluded.outcome,
                is_active = excluded.is_active",
            params![
                outcome.signal_id.to_string(),
                serde_json::to_string(outcome)?,
                outcome.entry_price.to_f64(),
                outcome.entry_ts,
                outcome.outcome.as_str(),
                outcome.is_active as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_outcome(&self, signal_id: Uuid) -> Result<Option<SignalOutcome>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT outcome_json FROM signal_outcomes WHERE signal_id = ?1",
        )?;
        let mut rows = stmt.query([signal_id.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let json: String = row.get(0)?;
        Ok(serde_json::from_str(&json).ok())
    }

    /// Outcomes still inside their tracking horizon.
    pub fn active_outcomes(&self) -> Result<Vec<SignalOutcome>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT outcome_json FROM signal_outcomes WHERE is_active = 1
             ORDER BY entry_ts ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let json: String = row.get(0)?;
            if let Ok(outcome) = serde_json::from_str::<SignalOutcome>(&json) {
                if outcome.outcome == OutcomeState::Pending || outcome.is_active {
                    out.push(outcome);
                }
            }
        }
        Ok(out)
    }

    pub fn insert_market_context(&self, signal_id: Uuid, context_json: &str, now_ms: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO signal_market_context (signal_id, context_json, recorded_at)
             VALUES (?1, ?2, ?3)",
            params![signal_id.to_string(), context_json, now_ms],
        )?;
        Ok(())
    }

    pub fn insert_failed_analysis(&self, signal_id: Uuid, analysis_json: &str, now_ms: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO failed_signal_analysis (signal_id, analysis_json, recorded_at)
             VALUES (?1, ?2, ?3)",
            params![signal_id.to_string(), analysis_json, now_ms],
        )?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let count = |sql: &str| -> i64 {
            self.conn.query_row(sql, [], |row| row.get(0)).unwrap_or(0)
        };
        Ok(StorageStats {
            queued_jobs: count("SELECT COUNT(*) FROM coordinator_queue") as usize,
            active_jobs: count("SELECT COUNT(*) FROM coordinator_active") as usize,
            dead_letters: count("SELECT COUNT(*) FROM coordinator_dead_letter") as usize,
            confirmed_signals: count("SELECT COUNT(*) FROM confirmed_signals") as usize,
        })
    }
}
