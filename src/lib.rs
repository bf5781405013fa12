//! Weather station ingestion and data-lifecycle pipeline.
//!
//! Raw readings are averaged per collection cycle, buffered into bulk
//! writes, rolled up into hourly and daily aggregates and expired per tier.
//! Alongside the raw stream the pipeline keeps running records, trend
//! snapshots, a daily rain total and one report per day.
//!
//! Every component takes an explicit store handle (`&dyn Store`); see
//! [`store::connect`] for how the backend is chosen.

pub mod aggregator;
pub mod buffer;
pub mod config;
pub mod downsample;
pub mod error;
pub mod maintenance;
pub mod models;
pub mod pipeline;
pub mod rain;
pub mod records;
pub mod report;
pub mod retention;
pub mod routes;
pub mod schema;
pub mod source;
pub mod store;
pub mod trends;

pub use config::{Config, RunMode};
pub use error::StoreError;
pub use store::{MemoryStore, PgStore, Store};
