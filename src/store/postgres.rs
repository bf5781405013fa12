//! PostgreSQL backend.
//!
//! Field maps, trend trees, report bodies and maintenance results live in
//! JSONB columns; everything queried or indexed is a plain column.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::models::{
    CollectionStats, DailyAggregate, DailyReport, FieldMap, HourlyAggregate, MaintenanceStatus,
    RainState, Record, RecordKind, Sample, Tags, TrendSnapshot,
};
use crate::retention::{PurgeReport, RetentionPolicy, Tier};
use crate::schema;

use super::Store;

/// Per-attempt bound on establishing a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Primary key of the rain-state singleton row.
const RAIN_STATE_ID: &str = "rain_accumulation";

// ---

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // ---
    /// Connect with a fixed number of attempts and a fixed delay between them.
    pub async fn connect_with_retry(
        db_url: &str,
        max_connections: u32,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        // ---
        let mut last_error = String::from("no connection attempt made");

        for attempt in 1..=attempts {
            info!("Connecting to database (attempt {}/{})", attempt, attempts);

            let result = PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(CONNECT_TIMEOUT)
                .connect(db_url)
                .await;

            match result {
                Ok(pool) => {
                    info!("Successfully connected to database");
                    return Ok(Self { pool });
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        warn!(
                            "Database connection attempt {} failed: {}. Retrying in {}s...",
                            attempt,
                            e,
                            retry_delay.as_secs()
                        );
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }

        Err(StoreError::connection(attempts, last_error))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SampleRow {
    timestamp_ns: i64,
    timestamp_date: DateTime<Utc>,
    location: String,
    sensor_type: String,
    fields: Json<FieldMap>,
    wind_direction_cardinal: Option<String>,
}

impl From<SampleRow> for Sample {
    fn from(row: SampleRow) -> Self {
        Sample {
            timestamp_ns: row.timestamp_ns,
            timestamp_date: row.timestamp_date,
            fields: row.fields.0,
            wind_direction_cardinal: row.wind_direction_cardinal,
            tags: Tags::new(row.location, row.sensor_type),
        }
    }
}

#[derive(sqlx::FromRow)]
struct HourlyRow {
    hour_timestamp_ns: i64,
    hour_start: DateTime<Utc>,
    location: String,
    sensor_type: String,
    fields: Json<std::collections::BTreeMap<String, crate::models::FieldStats>>,
    sample_count: i64,
}

impl From<HourlyRow> for HourlyAggregate {
    fn from(row: HourlyRow) -> Self {
        HourlyAggregate {
            hour_start: row.hour_start,
            hour_timestamp_ns: row.hour_timestamp_ns,
            fields: row.fields.0,
            sample_count: row.sample_count,
            tags: Tags::new(row.location, row.sensor_type),
        }
    }
}

#[derive(sqlx::FromRow)]
struct DailyRow {
    day_timestamp_ns: i64,
    day_start: DateTime<Utc>,
    date: String,
    location: String,
    sensor_type: String,
    fields: Json<std::collections::BTreeMap<String, crate::models::FieldStats>>,
    hour_count: i64,
}

impl From<DailyRow> for DailyAggregate {
    fn from(row: DailyRow) -> Self {
        DailyAggregate {
            day_start: row.day_start,
            day_timestamp_ns: row.day_timestamp_ns,
            date: row.date,
            fields: row.fields.0,
            hour_count: row.hour_count,
            tags: Tags::new(row.location, row.sensor_type),
        }
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    field: String,
    location: String,
    record_type: String,
    value: f64,
    timestamp_ns: i64,
    date_str: String,
}

impl RecordRow {
    fn into_record(self) -> Option<Record> {
        // ---
        let Some(kind) = RecordKind::parse(&self.record_type) else {
            warn!("Ignoring record row with unknown type '{}'", self.record_type);
            return None;
        };
        Some(Record {
            field: self.field,
            location: self.location,
            record_type: kind,
            value: self.value,
            timestamp_ns: self.timestamp_ns,
            date_str: self.date_str,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TrendRow {
    timestamp_ns: i64,
    timestamp_date: DateTime<Utc>,
    date_str: String,
    location: String,
    trends: Json<std::collections::BTreeMap<String, crate::models::FieldTrends>>,
}

#[derive(sqlx::FromRow)]
struct MaintenanceRow {
    task: String,
    last_run: f64,
    last_result: Option<Json<serde_json::Value>>,
    last_error: Option<String>,
    last_run_date: String,
}

#[derive(sqlx::FromRow)]
struct ReportRow {
    date: String,
    location: String,
    data_points: i64,
    summary: Json<std::collections::BTreeMap<String, crate::models::SummaryStats>>,
    hourly: Json<std::collections::BTreeMap<String, crate::models::HourBreakdown>>,
}

fn tier_for_collection(collection: &str) -> Option<Tier> {
    [Tier::Raw, Tier::Trend, Tier::Hourly, Tier::Daily]
        .into_iter()
        .find(|t| t.collection() == collection)
}

#[async_trait]
impl Store for PgStore {
    // ---
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        // ---
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::connection(1, e.to_string()))
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Database connection closed");
    }

    async fn ensure_collections(&self) -> Result<()> {
        schema::create_schema(&self.pool).await
    }

    async fn ensure_indexes(&self) -> Result<()> {
        schema::create_indexes(&self.pool).await
    }

    async fn declare_retention(&self, policies: &[RetentionPolicy]) -> Result<()> {
        // ---
        for policy in policies {
            sqlx::query(
                r#"
                INSERT INTO retention_policies (collection, date_field, ttl_days)
                VALUES ($1, $2, $3)
                ON CONFLICT (collection) DO UPDATE SET
                    date_field  = EXCLUDED.date_field,
                    ttl_days    = EXCLUDED.ttl_days,
                    declared_at = NOW()
                "#,
            )
            .bind(policy.tier.collection())
            .bind(policy.tier.date_field())
            .bind(policy.ttl_days)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        // ---
        let declared: Vec<(String, i64)> =
            sqlx::query_as("SELECT collection, ttl_days FROM retention_policies")
                .fetch_all(&self.pool)
                .await?;

        let mut report = PurgeReport::new();
        for (collection, ttl_days) in declared {
            let Some(tier) = tier_for_collection(&collection) else {
                warn!("Skipping retention policy for unknown collection '{}'", collection);
                continue;
            };
            let policy = RetentionPolicy::new(tier, ttl_days);

            // Table and column names come from `Tier`, never from the row
            let sql = format!(
                "DELETE FROM {} WHERE {} < $1",
                tier.collection(),
                tier.date_field()
            );
            let result = sqlx::query(&sql)
                .bind(policy.cutoff(now))
                .execute(&self.pool)
                .await?;
            report.insert(collection, result.rows_affected());
        }
        Ok(report)
    }

    async fn collection_stats(&self) -> Result<Vec<CollectionStats>> {
        // ---
        let declared: Vec<(String, i64)> =
            sqlx::query_as("SELECT collection, ttl_days FROM retention_policies")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = Vec::with_capacity(schema::COLLECTIONS.len());
        for name in schema::COLLECTIONS {
            // Table names come from `COLLECTIONS`, never from input
            let sql = format!(
                "SELECT COUNT(*), pg_total_relation_size('{}') FROM {}",
                name, name
            );
            let (rows, size_bytes): (i64, i64) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
            stats.push(CollectionStats {
                collection: name.to_string(),
                rows: u64::try_from(rows).unwrap_or(0),
                size_bytes: u64::try_from(size_bytes).ok(),
                ttl_days: declared.iter().find(|(c, _)| c == name).map(|(_, d)| *d),
            });
        }
        Ok(stats)
    }

    async fn insert_samples(&self, samples: &[Sample]) -> Result<u64> {
        // ---
        if samples.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO measurements (timestamp_ns, timestamp_date, location, \
             sensor_type, fields, wind_direction_cardinal) ",
        );
        builder.push_values(samples, |mut row, sample| {
            row.push_bind(sample.timestamp_ns)
                .push_bind(sample.timestamp_date)
                .push_bind(sample.tags.location.clone())
                .push_bind(sample.tags.sensor_type.clone())
                .push_bind(Json(sample.fields.clone()))
                .push_bind(sample.wind_direction_cardinal.clone());
        });

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn samples_between(
        &self,
        location: Option<&str>,
        start_ns: i64,
        end_ns: i64,
    ) -> Result<Vec<Sample>> {
        // ---
        let rows: Vec<SampleRow> = sqlx::query_as(
            r#"
            SELECT timestamp_ns, timestamp_date, location, sensor_type, fields,
                   wind_direction_cardinal
            FROM measurements
            WHERE timestamp_ns >= $1 AND timestamp_ns < $2
              AND ($3::TEXT IS NULL OR location = $3)
            ORDER BY timestamp_ns ASC
            "#,
        )
        .bind(start_ns)
        .bind(end_ns)
        .bind(location)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Sample::from).collect())
    }

    async fn hourly_exists(&self, hour_timestamp_ns: i64, location: &str) -> Result<bool> {
        // ---
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM hourly_measurements
                WHERE hour_timestamp_ns = $1 AND location = $2
            )
            "#,
        )
        .bind(hour_timestamp_ns)
        .bind(location)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_hourly(&self, aggregate: &HourlyAggregate) -> Result<bool> {
        // ---
        let result = sqlx::query(
            r#"
            INSERT INTO hourly_measurements (
                hour_timestamp_ns, hour_start, location, sensor_type, fields, sample_count
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (hour_timestamp_ns, location) DO NOTHING
            "#,
        )
        .bind(aggregate.hour_timestamp_ns)
        .bind(aggregate.hour_start)
        .bind(&aggregate.tags.location)
        .bind(&aggregate.tags.sensor_type)
        .bind(Json(&aggregate.fields))
        .bind(aggregate.sample_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn hourly_between(
        &self,
        location: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyAggregate>> {
        // ---
        let rows: Vec<HourlyRow> = sqlx::query_as(
            r#"
            SELECT hour_timestamp_ns, hour_start, location, sensor_type, fields, sample_count
            FROM hourly_measurements
            WHERE hour_start >= $1 AND hour_start < $2
              AND ($3::TEXT IS NULL OR location = $3)
            ORDER BY hour_start ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(location)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(HourlyAggregate::from).collect())
    }

    async fn daily_exists(&self, day_timestamp_ns: i64, location: &str) -> Result<bool> {
        // ---
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM daily_measurements
                WHERE day_timestamp_ns = $1 AND location = $2
            )
            "#,
        )
        .bind(day_timestamp_ns)
        .bind(location)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_daily(&self, aggregate: &DailyAggregate) -> Result<bool> {
        // ---
        let result = sqlx::query(
            r#"
            INSERT INTO daily_measurements (
                day_timestamp_ns, day_start, date, location, sensor_type, fields, hour_count
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (day_timestamp_ns, location) DO NOTHING
            "#,
        )
        .bind(aggregate.day_timestamp_ns)
        .bind(aggregate.day_start)
        .bind(&aggregate.date)
        .bind(&aggregate.tags.location)
        .bind(&aggregate.tags.sensor_type)
        .bind(Json(&aggregate.fields))
        .bind(aggregate.hour_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn daily_between(
        &self,
        location: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyAggregate>> {
        // ---
        let rows: Vec<DailyRow> = sqlx::query_as(
            r#"
            SELECT day_timestamp_ns, day_start, date, location, sensor_type, fields, hour_count
            FROM daily_measurements
            WHERE day_start >= $1 AND day_start < $2
              AND ($3::TEXT IS NULL OR location = $3)
            ORDER BY day_start ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(location)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DailyAggregate::from).collect())
    }

    async fn get_record(
        &self,
        field: &str,
        location: &str,
        kind: RecordKind,
    ) -> Result<Option<Record>> {
        // ---
        let row: Option<RecordRow> = sqlx::query_as(
            r#"
            SELECT field, location, record_type, value, timestamp_ns, date_str
            FROM records
            WHERE field = $1 AND location = $2 AND record_type = $3
            "#,
        )
        .bind(field)
        .bind(location)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(RecordRow::into_record))
    }

    async fn upsert_record(&self, record: &Record) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO records (field, location, record_type, value, timestamp_ns, date_str)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (field, location, record_type) DO UPDATE SET
                value        = EXCLUDED.value,
                timestamp_ns = EXCLUDED.timestamp_ns,
                date_str     = EXCLUDED.date_str
            "#,
        )
        .bind(&record.field)
        .bind(&record.location)
        .bind(record.record_type.as_str())
        .bind(record.value)
        .bind(record.timestamp_ns)
        .bind(&record.date_str)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn records_for(&self, location: &str) -> Result<Vec<Record>> {
        // ---
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT field, location, record_type, value, timestamp_ns, date_str
            FROM records
            WHERE location = $1
            ORDER BY field, record_type
            "#,
        )
        .bind(location)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(RecordRow::into_record).collect())
    }

    async fn insert_trend(&self, snapshot: &TrendSnapshot) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO trends (timestamp_ns, timestamp_date, date_str, location, trends)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(snapshot.timestamp_ns)
        .bind(snapshot.timestamp_date)
        .bind(&snapshot.date_str)
        .bind(&snapshot.location)
        .bind(Json(&snapshot.trends))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_trend(&self, location: &str) -> Result<Option<TrendSnapshot>> {
        // ---
        let row: Option<TrendRow> = sqlx::query_as(
            r#"
            SELECT timestamp_ns, timestamp_date, date_str, location, trends
            FROM trends
            WHERE location = $1
            ORDER BY timestamp_ns DESC
            LIMIT 1
            "#,
        )
        .bind(location)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TrendSnapshot {
            timestamp_ns: r.timestamp_ns,
            timestamp_date: r.timestamp_date,
            date_str: r.date_str,
            location: r.location,
            trends: r.trends.0,
        }))
    }

    async fn maintenance_status(&self, task: &str) -> Result<Option<MaintenanceStatus>> {
        // ---
        let row: Option<MaintenanceRow> = sqlx::query_as(
            r#"
            SELECT task, last_run, last_result, last_error, last_run_date
            FROM maintenance_status
            WHERE task = $1
            "#,
        )
        .bind(task)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| MaintenanceStatus {
            task: r.task,
            last_run: r.last_run,
            last_result: r.last_result.map(|j| j.0),
            last_error: r.last_error,
            last_run_date: r.last_run_date,
        }))
    }

    async fn upsert_maintenance_status(&self, status: &MaintenanceStatus) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO maintenance_status (task, last_run, last_result, last_error, last_run_date)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (task) DO UPDATE SET
                last_run      = EXCLUDED.last_run,
                last_result   = EXCLUDED.last_result,
                last_error    = EXCLUDED.last_error,
                last_run_date = EXCLUDED.last_run_date
            "#,
        )
        .bind(&status.task)
        .bind(status.last_run)
        .bind(status.last_result.as_ref().map(Json))
        .bind(&status.last_error)
        .bind(&status.last_run_date)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_rain_state(&self) -> Result<Option<RainState>> {
        // ---
        let row: Option<(f64, i64, f64)> = sqlx::query_as(
            r#"
            SELECT accumulated_rain, last_reset_time, last_rain_count
            FROM rain_state
            WHERE id = $1
            "#,
        )
        .bind(RAIN_STATE_ID)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(accumulated_rain, last_reset_time, last_rain_count)| RainState {
            accumulated_rain,
            last_reset_time,
            last_rain_count,
        }))
    }

    async fn save_rain_state(&self, state: &RainState) -> Result<()> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO rain_state (id, accumulated_rain, last_reset_time, last_rain_count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                accumulated_rain = EXCLUDED.accumulated_rain,
                last_reset_time  = EXCLUDED.last_reset_time,
                last_rain_count  = EXCLUDED.last_rain_count
            "#,
        )
        .bind(RAIN_STATE_ID)
        .bind(state.accumulated_rain)
        .bind(state.last_reset_time)
        .bind(state.last_rain_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_report(&self, date: &str, location: &str) -> Result<Option<DailyReport>> {
        // ---
        let row: Option<ReportRow> = sqlx::query_as(
            r#"
            SELECT date, location, data_points, summary, hourly
            FROM daily_reports
            WHERE date = $1 AND location = $2
            "#,
        )
        .bind(date)
        .bind(location)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| DailyReport {
            date: r.date,
            location: r.location,
            data_points: usize::try_from(r.data_points).unwrap_or(0),
            summary: r.summary.0,
            hourly: r.hourly.0,
        }))
    }

    async fn insert_daily_report(&self, report: &DailyReport) -> Result<bool> {
        // ---
        let result = sqlx::query(
            r#"
            INSERT INTO daily_reports (date, location, data_points, summary, hourly)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (date, location) DO NOTHING
            "#,
        )
        .bind(&report.date)
        .bind(&report.location)
        .bind(report.data_points as i64)
        .bind(Json(&report.summary))
        .bind(Json(&report.hourly))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_tier_for_collection() {
        // ---
        assert_eq!(tier_for_collection("measurements"), Some(Tier::Raw));
        assert_eq!(tier_for_collection("daily_measurements"), Some(Tier::Daily));
        assert_eq!(tier_for_collection("users; DROP TABLE x"), None);
    }

    #[test]
    fn test_record_row_with_unknown_type_is_dropped() {
        // ---
        let row = RecordRow {
            field: "temperature".to_string(),
            location: "backyard".to_string(),
            record_type: "median".to_string(),
            value: 1.0,
            timestamp_ns: 0,
            date_str: String::new(),
        };
        assert!(row.into_record().is_none());
    }
}
