//! Per-trade market state: zone aggregation and the enrichment pipeline.

mod preprocessor;
mod zones;

pub use preprocessor::{DepthOutcome, LevelChange, Preprocessor};
pub use zones::ZoneAggregator;
