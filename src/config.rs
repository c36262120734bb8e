//! Startup configuration.
//!
//! One document, loaded once, validated before anything spins up. Every
//! threshold, ratio and cooldown the pipeline uses lives here; the rest of
//! the crate carries no magic numbers. Components receive an immutable
//! `Arc<Config>` at construction and never reach into the environment again.

use crate::errors::EngineError;
use crate::financial_math::{Price, Quantity};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub feed: FeedConfig,
    pub orderbook: OrderBookConfig,
    pub preprocessor: PreprocessorConfig,
    pub absorption: AbsorptionConfig,
    pub exhaustion: ExhaustionConfig,
    pub delta_cvd: DeltaCvdConfig,
    pub accumulation: AccumulationConfig,
    pub spoofing: SpoofingConfig,
    pub coordinator: CoordinatorConfig,
    pub manager: ManagerConfig,
    pub storage: StorageConfig,
    pub alert: AlertConfig,
    pub broadcast: BroadcastConfig,
    pub outcomes: OutcomesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutcomesConfig {
    /// Favorable/adverse excursions beyond this many ticks decide
    /// success/failure at the final horizon.
    pub success_threshold_ticks: i64,
}

impl Default for OutcomesConfig {
    fn default() -> Self {
        Self {
            success_threshold_ticks: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3001,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub symbol: String,
    pub ws_url: String,
    pub rest_url: String,
    /// Disabled in tests and replay runs; events then come from the caller.
    pub enabled: bool,
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".into(),
            ws_url: "wss://stream.binance.com:9443/stream".into(),
            rest_url: "https://api.binance.com".into(),
            enabled: true,
            reconnect_backoff_ms: 500,
            max_reconnect_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderBookConfig {
    pub max_levels: usize,
    pub snapshot_interval_ms: u64,
    /// Levels farther than this many ticks from mid are pruned.
    pub max_price_distance_ticks: i64,
    pub prune_interval_ms: u64,
    pub max_error_rate: f64,
    pub stale_threshold_ms: i64,
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            max_levels: 5_000,
            snapshot_interval_ms: 30_000,
            max_price_distance_ticks: 2_000,
            prune_interval_ms: 10_000,
            max_error_rate: 0.05,
            stale_threshold_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub tick_size: Price,
    pub price_precision: u32,
    pub quantity_precision: u32,
    /// Half-width, in ticks, of the passive band sampled around each trade.
    pub band_ticks: i64,
    /// Base zone width in ticks (scaled by each multiplier).
    pub zone_ticks: i64,
    pub tick_multipliers: Vec<u32>,
    /// Rolling windows in seconds; the largest doubles as the zone lifetime.
    pub time_windows_sec: Vec<u64>,
    /// Zones are tracked within this many ticks of the last trade.
    pub zone_calculation_range_ticks: i64,
    pub max_zones: usize,
    pub zone_cache_size: usize,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            tick_size: Price::from_raw(1_000_000), // 0.01
            price_precision: 2,
            quantity_precision: 8,
            band_ticks: 5,
            zone_ticks: 10,
            tick_multipliers: vec![1, 2, 4],
            time_windows_sec: vec![60, 180, 300],
            zone_calculation_range_ticks: 120,
            max_zones: 256,
            zone_cache_size: 64,
        }
    }
}

impl PreprocessorConfig {
    pub fn zone_time_window_ms(&self) -> i64 {
        self.time_windows_sec.iter().copied().max().unwrap_or(300) as i64 * 1_000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsorptionConfig {
    pub min_agg_volume: Quantity,
    pub passive_absorption_threshold: f64,
    pub price_efficiency_threshold: f64,
    pub max_price_impact_ratio: f64,
    pub time_window_ms: i64,
    pub event_cooldown_ms: i64,
    pub final_confidence_required: f64,
    pub weight_passive: f64,
    pub weight_efficiency: f64,
    /// Average trade size at or above this earns the institutional boost.
    pub institutional_volume_threshold: Quantity,
    pub institutional_boost: f64,
}

impl Default for AbsorptionConfig {
    fn default() -> Self {
        Self {
            min_agg_volume: Quantity::from_units(100),
            passive_absorption_threshold: 0.6,
            price_efficiency_threshold: 0.01,
            max_price_impact_ratio: 0.01,
            time_window_ms: 30_000,
            event_cooldown_ms: 15_000,
            final_confidence_required: 0.55,
            weight_passive: 0.55,
            weight_efficiency: 0.35,
            institutional_volume_threshold: Quantity::from_units(15),
            institutional_boost: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExhaustionWeights {
    pub depletion: f64,
    pub passive: f64,
    pub continuity: f64,
    pub imbalance: f64,
    pub spread: f64,
    pub velocity: f64,
}

impl Default for ExhaustionWeights {
    fn default() -> Self {
        Self {
            depletion: 0.4,
            passive: 0.25,
            continuity: 0.15,
            imbalance: 0.1,
            spread: 0.08,
            velocity: 0.02,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExhaustionConfig {
    pub min_agg_volume: Quantity,
    pub exhaustion_threshold: f64,
    pub depletion_ratio_threshold: f64,
    pub min_peak_volume: Quantity,
    pub time_window_ms: i64,
    pub event_cooldown_ms: i64,
    pub final_confidence_required: f64,
    pub weights: ExhaustionWeights,
    /// Spread factor saturates at this many ticks.
    pub max_spread_ticks: i64,
    /// Trades/sec at which the velocity factor saturates.
    pub velocity_saturation_tps: f64,
    /// Trades considered by the continuity factor.
    pub continuity_lookback: usize,
}

impl Default for ExhaustionConfig {
    fn default() -> Self {
        Self {
            min_agg_volume: Quantity::from_units(100),
            exhaustion_threshold: 0.55,
            depletion_ratio_threshold: 0.6,
            min_peak_volume: Quantity::from_units(200),
            time_window_ms: 30_000,
            event_cooldown_ms: 15_000,
            final_confidence_required: 0.5,
            weights: ExhaustionWeights::default(),
            max_spread_ticks: 10,
            velocity_saturation_tps: 5.0,
            continuity_lookback: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaCvdConfig {
    pub windows_sec: Vec<u64>,
    pub cvd_imbalance_threshold: f64,
    pub min_vol_per_sec: f64,
    pub min_trades_per_sec: f64,
    pub use_passive_volume: bool,
    pub sample_interval_ms: i64,
    /// Regression length over the sampled series.
    pub slope_points: usize,
    pub event_cooldown_ms: i64,
    pub final_confidence_required: f64,
}

impl Default for DeltaCvdConfig {
    fn default() -> Self {
        Self {
            windows_sec: vec![60, 180, 300],
            cvd_imbalance_threshold: 0.35,
            min_vol_per_sec: 1.0,
            min_trades_per_sec: 0.5,
            use_passive_volume: true,
            sample_interval_ms: 1_000,
            slope_points: 20,
            event_cooldown_ms: 20_000,
            final_confidence_required: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulationConfig {
    pub confluence_max_distance_ticks: i64,
    pub accumulation_volume_threshold: Quantity,
    pub accumulation_ratio_threshold: f64,
    pub event_cooldown_ms: i64,
    pub final_confidence_required: f64,
    pub ratio_weight: f64,
    pub confluence_weight: f64,
    pub institutional_weight: f64,
    pub alignment_weight: f64,
}

impl Default for AccumulationConfig {
    fn default() -> Self {
        Self {
            confluence_max_distance_ticks: 30,
            accumulation_volume_threshold: Quantity::from_units(300),
            accumulation_ratio_threshold: 0.58,
            event_cooldown_ms: 30_000,
            final_confidence_required: 0.5,
            ratio_weight: 0.5,
            confluence_weight: 0.2,
            institutional_weight: 0.2,
            alignment_weight: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoofingConfig {
    pub min_wall_size: Quantity,
    /// Fraction of a wall that must vanish to count as a pull.
    pub pull_fraction: f64,
    pub pull_window_ms: i64,
    /// Fraction of the drop that trades may explain before it stops being
    /// a pull.
    pub consumption_tolerance: f64,
    pub event_cooldown_ms: i64,
}

impl Default for SpoofingConfig {
    fn default() -> Self {
        Self {
            min_wall_size: Quantity::from_units(1_000),
            pull_fraction: 0.8,
            pull_window_ms: 1_000,
            consumption_tolerance: 0.25,
            event_cooldown_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub required_confirmations: u32,
    pub confirmation_window_ms: i64,
    pub deduplication_window_ms: i64,
    pub signal_expiry_ms: i64,
    pub drain_batch_size: usize,
    pub price_tolerance_ticks: i64,
    pub detector_priorities: HashMap<String, i32>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let mut detector_priorities = HashMap::new();
        detector_priorities.insert("absorption".into(), 30);
        detector_priorities.insert("exhaustion".into(), 20);
        detector_priorities.insert("delta_cvd".into(), 10);
        detector_priorities.insert("accumulation".into(), 5);
        Self {
            required_confirmations: 1,
            confirmation_window_ms: 10_000,
            deduplication_window_ms: 30_000,
            signal_expiry_ms: 60_000,
            drain_batch_size: 16,
            price_tolerance_ticks: 5,
            detector_priorities,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictResolutionConfig {
    pub enabled: bool,
    pub strategy: String,
    pub minimum_separation_ms: i64,
}

impl Default for ConflictResolutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: "drop_lower_confidence".into(),
            minimum_separation_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub confidence_threshold: f64,
    pub signal_timeout_ms: i64,
    pub backpressure_threshold: usize,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset_ms: u64,
    pub min_adaptive_batch_size: usize,
    pub max_adaptive_batch_size: usize,
    pub signal_type_priorities: HashMap<String, i32>,
    /// Position size per detector id, in contract units.
    pub position_sizing: HashMap<String, f64>,
    pub conflict_resolution: ConflictResolutionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let mut signal_type_priorities = HashMap::new();
        signal_type_priorities.insert("absorption".into(), 30);
        signal_type_priorities.insert("exhaustion".into(), 20);
        signal_type_priorities.insert("delta_cvd".into(), 10);
        signal_type_priorities.insert("accumulation".into(), 5);
        signal_type_priorities.insert("distribution".into(), 5);
        let mut position_sizing = HashMap::new();
        position_sizing.insert("absorption".into(), 1.0);
        position_sizing.insert("exhaustion".into(), 1.0);
        position_sizing.insert("delta_cvd".into(), 0.5);
        position_sizing.insert("accumulation".into(), 0.5);
        position_sizing.insert("distribution".into(), 0.5);
        Self {
            confidence_threshold: 0.5,
            signal_timeout_ms: 60_000,
            backpressure_threshold: 512,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_ms: 30_000,
            min_adaptive_batch_size: 1,
            max_adaptive_batch_size: 32,
            signal_type_priorities,
            position_sizing,
            conflict_resolution: ConflictResolutionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    /// Bounded request queue into the storage worker.
    pub queue_capacity: usize,
    pub backpressure_threshold: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./orderflow.db".into(),
            queue_capacity: 2_048,
            backpressure_threshold: 1_536,
            max_retries: 3,
            backoff_base_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub webhook_url: Option<String>,
    pub circuit_breaker_threshold: u32,
    pub half_open_after_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            circuit_breaker_threshold: 5,
            half_open_after_ms: 30_000,
            call_timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub channel_capacity: usize,
    pub dashboard_update_interval_ms: u64,
    pub stats_interval_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1_000,
            dashboard_update_interval_ms: 250,
            stats_interval_ms: 5_000,
        }
    }
}

impl Config {
    /// Load from a TOML file (if given/present), then apply environment
    /// overrides for deployment-variable fields.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", p.display()))?
            }
            None => Config::default(),
        };

        if let Ok(symbol) = std::env::var("ORDERFLOW_SYMBOL") {
            config.feed.symbol = symbol;
        }
        if let Ok(port) = std::env::var("PORT") {
            config.server.port = port
                .parse()
                .with_context(|| format!("PORT is not a valid port: {port}"))?;
        }
        if let Ok(db) = std::env::var("ORDERFLOW_DB_PATH") {
            config.storage.path = db;
        }
        if let Ok(url) = std::env::var("ORDERFLOW_WEBHOOK_URL") {
            config.alert.webhook_url = Some(url);
        }

        config.validate().map_err(anyhow::Error::from)?;
        Ok(config)
    }

    /// Startup validation; any failure here is fatal.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut problems: Vec<String> = Vec::new();

        if !self.preprocessor.tick_size.is_positive() {
            problems.push("preprocessor.tick_size must be > 0".into());
        }
        if self.preprocessor.zone_ticks <= 0 {
            problems.push("preprocessor.zone_ticks must be > 0".into());
        }
        if self.preprocessor.tick_multipliers.is_empty() {
            problems.push("preprocessor.tick_multipliers must not be empty".into());
        }
        for m in &self.preprocessor.tick_multipliers {
            if ![1, 2, 4].contains(m) {
                problems.push(format!("preprocessor.tick_multipliers: unsupported multiplier {m}"));
            }
        }
        if self.preprocessor.time_windows_sec.is_empty() {
            problems.push("preprocessor.time_windows_sec must not be empty".into());
        }
        if self.preprocessor.max_zones == 0 {
            problems.push("preprocessor.max_zones must be > 0".into());
        }

        for (name, v) in [
            (
                "absorption.passive_absorption_threshold",
                self.absorption.passive_absorption_threshold,
            ),
            (
                "absorption.final_confidence_required",
                self.absorption.final_confidence_required,
            ),
            ("exhaustion.exhaustion_threshold", self.exhaustion.exhaustion_threshold),
            (
                "exhaustion.depletion_ratio_threshold",
                self.exhaustion.depletion_ratio_threshold,
            ),
            (
                "accumulation.accumulation_ratio_threshold",
                self.accumulation.accumulation_ratio_threshold,
            ),
            ("spoofing.pull_fraction", self.spoofing.pull_fraction),
            ("manager.confidence_threshold", self.manager.confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                problems.push(format!("{name} must be within [0, 1], got {v}"));
            }
        }

        if self.absorption.price_efficiency_threshold <= 0.0 {
            problems.push("absorption.price_efficiency_threshold must be > 0".into());
        }
        if self.delta_cvd.windows_sec.is_empty() {
            problems.push("delta_cvd.windows_sec must not be empty".into());
        }
        if self.delta_cvd.slope_points < 2 {
            problems.push("delta_cvd.slope_points must be at least 2".into());
        }
        if self.coordinator.required_confirmations == 0 {
            problems.push("coordinator.required_confirmations must be >= 1".into());
        }
        if self.coordinator.drain_batch_size == 0 {
            problems.push("coordinator.drain_batch_size must be >= 1".into());
        }
        if self.manager.min_adaptive_batch_size > self.manager.max_adaptive_batch_size {
            problems.push(
                "manager.min_adaptive_batch_size must not exceed max_adaptive_batch_size".into(),
            );
        }
        if self.manager.min_adaptive_batch_size == 0 {
            problems.push("manager.min_adaptive_batch_size must be >= 1".into());
        }
        if self.storage.queue_capacity == 0 {
            problems.push("storage.queue_capacity must be >= 1".into());
        }
        if self.storage.backpressure_threshold > self.storage.queue_capacity {
            problems.push("storage.backpressure_threshold must not exceed queue_capacity".into());
        }
        if self.orderbook.max_levels == 0 {
            problems.push("orderbook.max_levels must be >= 1".into());
        }
        if !(0.0..=1.0).contains(&self.orderbook.max_error_rate) {
            problems.push("orderbook.max_error_rate must be within [0, 1]".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Config(problems.join("; ")))
        }
    }
}
