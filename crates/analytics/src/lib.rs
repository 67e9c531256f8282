//! Delivery analytics sink that batches events into ClickHouse.

pub mod sink;

pub use sink::ClickHouseSink;
