//! Measurement store gateway.
//!
//! Every component talks to persistence through the [`Store`] trait and is
//! handed an explicit `&dyn Store`; nothing in the crate holds a global
//! connection. [`PgStore`] is the production backend, [`MemoryStore`] keeps the
//! same semantics in process for tests and dry runs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    CollectionStats, DailyAggregate, DailyReport, HourlyAggregate, MaintenanceStatus, RainState,
    Record, RecordKind, Sample, TrendSnapshot,
};
use crate::retention::{PurgeReport, RetentionPolicy};
use crate::Config;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// Logical collections of the pipeline and the operations run against them.
///
/// Writes are independent: no method spans more than one document except
/// [`Store::insert_samples`], which is a single bulk insert.
#[async_trait]
pub trait Store: Send + Sync {
    // ---
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Health check run before each unit of work.
    async fn ping(&self) -> Result<()>;

    /// Release connections. Further calls fail.
    async fn close(&self);

    // --- schema and retention

    async fn ensure_collections(&self) -> Result<()>;
    async fn ensure_indexes(&self) -> Result<()>;
    async fn declare_retention(&self, policies: &[RetentionPolicy]) -> Result<()>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport>;

    /// Size and declared expiry of every collection in [`crate::schema::COLLECTIONS`].
    async fn collection_stats(&self) -> Result<Vec<CollectionStats>>;

    // --- raw samples

    /// Bulk insert; returns the number of rows written.
    async fn insert_samples(&self, samples: &[Sample]) -> Result<u64>;

    /// Samples with `start_ns <= timestamp_ns < end_ns`, oldest first.
    async fn samples_between(
        &self,
        location: Option<&str>,
        start_ns: i64,
        end_ns: i64,
    ) -> Result<Vec<Sample>>;

    // --- hourly tier

    async fn hourly_exists(&self, hour_timestamp_ns: i64, location: &str) -> Result<bool>;

    /// Returns `false` when an aggregate for the same (hour, location) exists.
    async fn insert_hourly(&self, aggregate: &HourlyAggregate) -> Result<bool>;

    /// Aggregates with `start <= hour_start < end`, oldest first.
    async fn hourly_between(
        &self,
        location: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyAggregate>>;

    // --- daily tier

    async fn daily_exists(&self, day_timestamp_ns: i64, location: &str) -> Result<bool>;
    async fn insert_daily(&self, aggregate: &DailyAggregate) -> Result<bool>;
    async fn daily_between(
        &self,
        location: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyAggregate>>;

    // --- records

    async fn get_record(
        &self,
        field: &str,
        location: &str,
        kind: RecordKind,
    ) -> Result<Option<Record>>;
    async fn upsert_record(&self, record: &Record) -> Result<()>;
    async fn records_for(&self, location: &str) -> Result<Vec<Record>>;

    // --- trends

    async fn insert_trend(&self, snapshot: &TrendSnapshot) -> Result<()>;
    async fn latest_trend(&self, location: &str) -> Result<Option<TrendSnapshot>>;

    // --- maintenance status

    async fn maintenance_status(&self, task: &str) -> Result<Option<MaintenanceStatus>>;
    async fn upsert_maintenance_status(&self, status: &MaintenanceStatus) -> Result<()>;

    // --- rain state singleton

    async fn load_rain_state(&self) -> Result<Option<RainState>>;
    async fn save_rain_state(&self, state: &RainState) -> Result<()>;

    // --- daily reports

    async fn daily_report(&self, date: &str, location: &str) -> Result<Option<DailyReport>>;

    /// Returns `false` when a report for the same (date, location) exists.
    async fn insert_daily_report(&self, report: &DailyReport) -> Result<bool>;
}

/// Open the backend selected by `DATABASE_URL`.
///
/// PostgreSQL connections are retried per the configured attempts and fixed
/// delay; exhaustion yields [`crate::StoreError::Connection`].
pub async fn connect(cfg: &Config) -> Result<Arc<dyn Store>> {
    // ---
    if cfg.uses_memory_store() {
        tracing::warn!("Using in-memory store; nothing will be persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = PgStore::connect_with_retry(
        &cfg.db_url,
        cfg.db_pool_max,
        cfg.db_connect_attempts,
        cfg.db_connect_retry,
    )
    .await?;
    Ok(Arc::new(store))
}
