//! Live L2 order book, maintained from a snapshot plus in-order diffs.

mod book;

pub use book::{BandVolumes, BookError, BookHealth, DepthLevel, OrderBook};
