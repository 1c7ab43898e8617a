//! ClickHouse adapters for the metric and segment stores.

pub mod warehouse;

pub use warehouse::ClickHouseStore;
