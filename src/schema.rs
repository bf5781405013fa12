//! Database schema management for `weatherhat-pipeline`.
//!
//! Ensures required tables and indexes exist before the first cycle.
//! Applied on startup through the Retention Manager (EMBP: single gateway call
//! per concern).

use sqlx::PgPool;

use crate::error::Result;

/// Data tables created by [`create_schema`], as reported by the `maintain` run.
pub const COLLECTIONS: [&str; 8] = [
    "measurements",
    "hourly_measurements",
    "daily_measurements",
    "trends",
    "records",
    "maintenance_status",
    "rain_state",
    "daily_reports",
];

// ---

/// Create or update the database schema (idempotent).
///
/// Creates one table per logical collection plus `retention_policies`, which
/// holds the declared expiry per tier. `weather_predictions` is owned by the
/// external predictor and is not created here. Safe to call on every startup;
/// no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Raw samples; `timestamp_date` mirrors `timestamp_ns` for expiry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measurements (
            id                      BIGSERIAL PRIMARY KEY,
            timestamp_ns            BIGINT      NOT NULL,
            timestamp_date          TIMESTAMPTZ NOT NULL,
            location                TEXT        NOT NULL,
            sensor_type             TEXT        NOT NULL,
            fields                  JSONB       NOT NULL,
            wind_direction_cardinal TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Hourly rollups, unique per (hour, location)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hourly_measurements (
            id                BIGSERIAL PRIMARY KEY,
            hour_timestamp_ns BIGINT      NOT NULL,
            hour_start        TIMESTAMPTZ NOT NULL,
            location          TEXT        NOT NULL,
            sensor_type       TEXT        NOT NULL,
            fields            JSONB       NOT NULL,
            sample_count      BIGINT      NOT NULL,
            created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (hour_timestamp_ns, location)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Daily rollups, unique per (day, location)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_measurements (
            id               BIGSERIAL PRIMARY KEY,
            day_timestamp_ns BIGINT      NOT NULL,
            day_start        TIMESTAMPTZ NOT NULL,
            date             TEXT        NOT NULL,
            location         TEXT        NOT NULL,
            sensor_type      TEXT        NOT NULL,
            fields           JSONB       NOT NULL,
            hour_count       BIGINT      NOT NULL,
            created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (day_timestamp_ns, location)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trends (
            id             BIGSERIAL PRIMARY KEY,
            timestamp_ns   BIGINT      NOT NULL,
            timestamp_date TIMESTAMPTZ NOT NULL,
            date_str       TEXT        NOT NULL,
            location       TEXT        NOT NULL,
            trends         JSONB       NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            field        TEXT             NOT NULL,
            location     TEXT             NOT NULL,
            record_type  TEXT             NOT NULL,
            value        DOUBLE PRECISION NOT NULL,
            timestamp_ns BIGINT           NOT NULL,
            date_str     TEXT             NOT NULL,
            PRIMARY KEY (field, location, record_type)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS maintenance_status (
            task          TEXT PRIMARY KEY,
            last_run      DOUBLE PRECISION NOT NULL,
            last_result   JSONB,
            last_error    TEXT,
            last_run_date TEXT NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rain_state (
            id               TEXT PRIMARY KEY,
            accumulated_rain DOUBLE PRECISION NOT NULL,
            last_reset_time  BIGINT           NOT NULL,
            last_rain_count  DOUBLE PRECISION NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daily_reports (
            date        TEXT        NOT NULL,
            location    TEXT        NOT NULL,
            data_points BIGINT      NOT NULL,
            summary     JSONB       NOT NULL,
            hourly      JSONB       NOT NULL,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (date, location)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retention_policies (
            collection  TEXT PRIMARY KEY,
            date_field  TEXT        NOT NULL,
            ttl_days    BIGINT      NOT NULL,
            declared_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Secondary indexes for location+time range queries, trend scans and the
/// expiry reaper. Safe to call repeatedly.
pub async fn create_indexes(pool: &PgPool) -> Result<()> {
    // ---
    const INDEXES: [&str; 7] = [
        "CREATE INDEX IF NOT EXISTS idx_measurements_location_ts
            ON measurements (location, timestamp_ns)",
        "CREATE INDEX IF NOT EXISTS idx_measurements_ts_location
            ON measurements (timestamp_ns, location)",
        "CREATE INDEX IF NOT EXISTS idx_measurements_date
            ON measurements (timestamp_date)",
        "CREATE INDEX IF NOT EXISTS idx_hourly_location_start
            ON hourly_measurements (location, hour_start)",
        "CREATE INDEX IF NOT EXISTS idx_daily_location_start
            ON daily_measurements (location, day_start)",
        "CREATE INDEX IF NOT EXISTS idx_trends_location_ts
            ON trends (location, timestamp_ns DESC)",
        "CREATE INDEX IF NOT EXISTS idx_trends_date
            ON trends (timestamp_date)",
    ];

    let mut tx = pool.begin().await?;
    for ddl in INDEXES {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}
