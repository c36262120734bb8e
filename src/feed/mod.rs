//! Exchange market-data plumbing (interface collaborator).

mod binance;

pub use binance::{run_feed, SnapshotRequest};
