//! Downsampler: raw samples into hourly aggregates, hourly into daily.
//!
//! Each rollup targets one completed period, checks existence per
//! (period, location) and writes one document per surviving group. A crash
//! mid-loop leaves some locations aggregated and others not; the next run
//! only fills the missing ones. Groups below the minimum count are skipped
//! entirely, never partially written.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::models::{
    floor_to_day, floor_to_hour, to_nanos, DailyAggregate, FieldStats, HourlyAggregate, Sample,
    Tags,
};
use crate::store::Store;

/// Fewest raw samples that make an hour.
pub const MIN_HOURLY_SAMPLES: usize = 5;

/// Fewest hourly aggregates that make a day.
pub const MIN_DAILY_HOURS: usize = 12;

/// (field, keep min, keep max) rolled up from raw samples.
const HOURLY_FIELDS: [(&str, bool, bool); 5] = [
    ("temperature", true, true),
    ("humidity", false, false),
    ("pressure", false, false),
    ("wind_speed", false, true),
    ("lux", false, false),
];

// ---

/// Counts from one rollup run, stored as the maintenance result payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupOutcome {
    /// Start of the targeted period, RFC 3339.
    pub period: String,
    pub created: usize,
    pub skipped_existing: usize,
    pub skipped_sparse: usize,
    pub failed: usize,
}

pub async fn rollup_hourly(store: &dyn Store) -> Result<RollupOutcome> {
    rollup_hourly_at(store, Utc::now()).await
}

/// Aggregate the hour before the one containing `now`.
pub async fn rollup_hourly_at(store: &dyn Store, now: DateTime<Utc>) -> Result<RollupOutcome> {
    // ---
    let hour_end = floor_to_hour(now);
    let hour_start = hour_end - TimeDelta::hours(1);
    let hour_ns = to_nanos(hour_start);

    let mut outcome = RollupOutcome {
        period: hour_start.to_rfc3339(),
        ..Default::default()
    };

    let samples = store
        .samples_between(None, hour_ns, to_nanos(hour_end))
        .await?;
    debug!("Hourly rollup {}: {} raw sample(s)", outcome.period, samples.len());

    for (tags, group) in group_by_tags(&samples, |s| &s.tags) {
        // ---
        if store.hourly_exists(hour_ns, &tags.location).await? {
            debug!(location = %tags.location, "Hour {} already aggregated", outcome.period);
            outcome.skipped_existing += 1;
            continue;
        }

        if group.len() < MIN_HOURLY_SAMPLES {
            info!(
                location = %tags.location,
                "Skipping hour {}: {} sample(s), need {}",
                outcome.period,
                group.len(),
                MIN_HOURLY_SAMPLES
            );
            outcome.skipped_sparse += 1;
            continue;
        }

        let aggregate = HourlyAggregate {
            hour_start,
            hour_timestamp_ns: hour_ns,
            fields: hourly_fields(&group),
            sample_count: group.len() as i64,
            tags: tags.clone(),
        };

        match store.insert_hourly(&aggregate).await {
            Ok(true) => outcome.created += 1,
            Ok(false) => outcome.skipped_existing += 1,
            Err(e) => {
                error!(location = %tags.location, "Failed to store hourly aggregate: {}", e);
                outcome.failed += 1;
            }
        }
    }

    info!(
        "Hourly rollup {}: {} created, {} existing, {} sparse",
        outcome.period, outcome.created, outcome.skipped_existing, outcome.skipped_sparse
    );
    Ok(outcome)
}

pub async fn rollup_daily(store: &dyn Store) -> Result<RollupOutcome> {
    rollup_daily_at(store, Utc::now()).await
}

/// Aggregate the UTC day before the one containing `now`.
pub async fn rollup_daily_at(store: &dyn Store, now: DateTime<Utc>) -> Result<RollupOutcome> {
    // ---
    let day_end = floor_to_day(now);
    let day_start = day_end - TimeDelta::days(1);
    let day_ns = to_nanos(day_start);

    let mut outcome = RollupOutcome {
        period: day_start.to_rfc3339(),
        ..Default::default()
    };

    let hours = store.hourly_between(None, day_start, day_end).await?;
    debug!("Daily rollup {}: {} hourly aggregate(s)", outcome.period, hours.len());

    for (tags, group) in group_by_tags(&hours, |h| &h.tags) {
        // ---
        if store.daily_exists(day_ns, &tags.location).await? {
            debug!(location = %tags.location, "Day {} already aggregated", outcome.period);
            outcome.skipped_existing += 1;
            continue;
        }

        if group.len() < MIN_DAILY_HOURS {
            info!(
                location = %tags.location,
                "Skipping day {}: {} hour(s), need {}",
                outcome.period,
                group.len(),
                MIN_DAILY_HOURS
            );
            outcome.skipped_sparse += 1;
            continue;
        }

        let aggregate = DailyAggregate {
            day_start,
            day_timestamp_ns: day_ns,
            date: day_start.format("%Y-%m-%d").to_string(),
            fields: daily_fields(&group),
            hour_count: group.len() as i64,
            tags: tags.clone(),
        };

        match store.insert_daily(&aggregate).await {
            Ok(true) => outcome.created += 1,
            Ok(false) => outcome.skipped_existing += 1,
            Err(e) => {
                error!(location = %tags.location, "Failed to store daily aggregate: {}", e);
                outcome.failed += 1;
            }
        }
    }

    info!(
        "Daily rollup {}: {} created, {} existing, {} sparse",
        outcome.period, outcome.created, outcome.skipped_existing, outcome.skipped_sparse
    );
    Ok(outcome)
}

/// Hourly aggregates of the last `hours` hours, oldest first.
pub async fn get_hourly_measurements(
    store: &dyn Store,
    location: Option<&str>,
    hours: u32,
) -> Result<Vec<HourlyAggregate>> {
    get_hourly_measurements_at(store, location, hours, Utc::now()).await
}

pub async fn get_hourly_measurements_at(
    store: &dyn Store,
    location: Option<&str>,
    hours: u32,
    now: DateTime<Utc>,
) -> Result<Vec<HourlyAggregate>> {
    // ---
    let start = now - TimeDelta::hours(i64::from(hours));
    store.hourly_between(location, start, now).await
}

// --- helpers

fn group_by_tags<'a, T>(
    items: &'a [T],
    tags: impl Fn(&T) -> &Tags,
) -> BTreeMap<&'a Tags, Vec<&'a T>> {
    // ---
    let mut groups: BTreeMap<&Tags, Vec<&T>> = BTreeMap::new();
    for item in items {
        groups.entry(tags(item)).or_default().push(item);
    }
    groups
}

fn hourly_fields(samples: &[&Sample]) -> BTreeMap<String, FieldStats> {
    // ---
    let mut fields = BTreeMap::new();
    for (name, keep_min, keep_max) in HOURLY_FIELDS {
        let values: Vec<f64> = samples.iter().filter_map(|s| s.field(name)).collect();
        if values.is_empty() {
            continue;
        }
        fields.insert(
            name.to_string(),
            FieldStats {
                avg: mean(&values),
                min: keep_min.then(|| fold_min(&values)),
                max: keep_max.then(|| fold_max(&values)),
            },
        );
    }
    fields
}

/// Mean of hourly averages; min of hourly minimums; max of hourly maximums.
fn daily_fields(hours: &[&HourlyAggregate]) -> BTreeMap<String, FieldStats> {
    // ---
    let mut per_field: BTreeMap<&str, Vec<&FieldStats>> = BTreeMap::new();
    for hour in hours {
        for (name, stats) in &hour.fields {
            per_field.entry(name.as_str()).or_default().push(stats);
        }
    }

    per_field
        .into_iter()
        .map(|(name, stats)| {
            let avgs: Vec<f64> = stats.iter().map(|s| s.avg).collect();
            let mins: Vec<f64> = stats.iter().filter_map(|s| s.min).collect();
            let maxes: Vec<f64> = stats.iter().filter_map(|s| s.max).collect();
            let rolled = FieldStats {
                avg: mean(&avgs),
                min: (!mins.is_empty()).then(|| fold_min(&mins)),
                max: (!maxes.is_empty()).then(|| fold_max(&maxes)),
            };
            (name.to_string(), rolled)
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn fold_min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}

fn fold_max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 10, h, m, 0).unwrap()
    }

    fn raw(location: &str, when: DateTime<Utc>, temperature: f64, wind: f64) -> Sample {
        // ---
        let fields = [
            ("temperature".to_string(), temperature),
            ("humidity".to_string(), 50.0),
            ("wind_speed".to_string(), wind),
        ]
        .into_iter()
        .collect();
        Sample::new(fields, Tags::new(location, "weatherhat"), when)
    }

    async fn seed_hour(store: &MemoryStore, location: &str, hour: u32, temps: &[f64]) {
        // ---
        let samples: Vec<Sample> = temps
            .iter()
            .enumerate()
            .map(|(i, t)| raw(location, at(hour, i as u32 * 5), *t, i as f64))
            .collect();
        store.insert_samples(&samples).await.unwrap();
    }

    fn hourly(location: &str, hour: u32, avg: f64, min: f64, max: f64) -> HourlyAggregate {
        // ---
        let start = Utc.with_ymd_and_hms(2025, 8, 9, hour, 0, 0).unwrap();
        let fields = [(
            "temperature".to_string(),
            FieldStats {
                avg,
                min: Some(min),
                max: Some(max),
            },
        )]
        .into_iter()
        .collect();
        HourlyAggregate {
            hour_start: start,
            hour_timestamp_ns: to_nanos(start),
            fields,
            sample_count: 12,
            tags: Tags::new(location, "weatherhat"),
        }
    }

    #[tokio::test]
    async fn test_hourly_rollup_of_five_samples() {
        // ---
        let store = MemoryStore::new();
        seed_hour(&store, "backyard", 9, &[10.0, 12.0, 14.0, 16.0, 18.0]).await;

        let outcome = rollup_hourly_at(&store, at(10, 7)).await.unwrap();
        assert_eq!(outcome.created, 1);

        let rows = store.hourly_between(None, at(9, 0), at(10, 0)).await.unwrap();
        assert_eq!(rows.len(), 1);
        let temp = &rows[0].fields["temperature"];
        assert!((temp.avg - 14.0).abs() < 1e-9);
        assert_eq!(temp.min, Some(10.0));
        assert_eq!(temp.max, Some(18.0));
        assert_eq!(rows[0].sample_count, 5);

        let wind = &rows[0].fields["wind_speed"];
        assert_eq!(wind.min, None);
        assert_eq!(wind.max, Some(4.0));
        assert_eq!(rows[0].fields["humidity"].max, None);
        assert!(!rows[0].fields.contains_key("lux"));
    }

    #[tokio::test]
    async fn test_hourly_rollup_skips_sparse_hour() {
        // ---
        let store = MemoryStore::new();
        seed_hour(&store, "backyard", 9, &[10.0, 12.0, 14.0, 16.0]).await;

        let outcome = rollup_hourly_at(&store, at(10, 7)).await.unwrap();

        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.skipped_sparse, 1);
        assert!(store.hourly_between(None, at(0, 0), at(23, 0)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hourly_rollup_is_idempotent() {
        // ---
        let store = MemoryStore::new();
        seed_hour(&store, "backyard", 9, &[1.0; 6]).await;
        seed_hour(&store, "roof", 9, &[2.0; 5]).await;

        let first = rollup_hourly_at(&store, at(10, 1)).await.unwrap();
        let second = rollup_hourly_at(&store, at(10, 30)).await.unwrap();

        assert_eq!(first.created, 2);
        assert_eq!(second.created, 0);
        assert_eq!(second.skipped_existing, 2);
        assert_eq!(store.hourly_between(None, at(0, 0), at(23, 0)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_hourly_rollup_fills_only_missing_locations() {
        // ---
        let store = MemoryStore::new();
        seed_hour(&store, "backyard", 9, &[1.0; 5]).await;
        rollup_hourly_at(&store, at(10, 0)).await.unwrap();

        // Late samples for a second location in the same hour
        seed_hour(&store, "roof", 9, &[3.0; 5]).await;
        let outcome = rollup_hourly_at(&store, at(10, 45)).await.unwrap();

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.skipped_existing, 1);
    }

    #[tokio::test]
    async fn test_hourly_rollup_ignores_samples_outside_the_hour() {
        // ---
        let store = MemoryStore::new();
        seed_hour(&store, "backyard", 8, &[1.0; 5]).await;
        seed_hour(&store, "backyard", 10, &[1.0; 5]).await;

        let outcome = rollup_hourly_at(&store, at(10, 30)).await.unwrap();
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.skipped_sparse, 0);
    }

    #[tokio::test]
    async fn test_daily_rollup_needs_twelve_hours() {
        // ---
        let store = MemoryStore::new();
        for hour in 0..11 {
            store.insert_hourly(&hourly("backyard", hour, 10.0, 9.0, 11.0)).await.unwrap();
        }

        let now = Utc.with_ymd_and_hms(2025, 8, 10, 0, 30, 0).unwrap();
        let outcome = rollup_daily_at(&store, now).await.unwrap();
        assert_eq!(outcome.created, 0);
        assert_eq!(outcome.skipped_sparse, 1);

        store.insert_hourly(&hourly("backyard", 11, 10.0, 9.0, 11.0)).await.unwrap();
        let outcome = rollup_daily_at(&store, now).await.unwrap();
        assert_eq!(outcome.created, 1);
    }

    #[tokio::test]
    async fn test_daily_rollup_combines_hourly_stats() {
        // ---
        let store = MemoryStore::new();
        for hour in 0..12 {
            let base = f64::from(hour);
            store
                .insert_hourly(&hourly("backyard", hour, base, base - 1.0, base + 2.0))
                .await
                .unwrap();
        }

        let now = Utc.with_ymd_and_hms(2025, 8, 10, 3, 0, 0).unwrap();
        rollup_daily_at(&store, now).await.unwrap();
        let again = rollup_daily_at(&store, now).await.unwrap();
        assert_eq!(again.skipped_existing, 1);

        let day_start = Utc.with_ymd_and_hms(2025, 8, 9, 0, 0, 0).unwrap();
        let rows = store.daily_between(Some("backyard"), day_start, now).await.unwrap();
        assert_eq!(rows.len(), 1);

        let day = &rows[0];
        assert_eq!(day.date, "2025-08-09");
        assert_eq!(day.hour_count, 12);
        let temp = &day.fields["temperature"];
        assert!((temp.avg - 5.5).abs() < 1e-9);
        assert_eq!(temp.min, Some(-1.0));
        assert_eq!(temp.max, Some(13.0));
    }

    #[tokio::test]
    async fn test_get_hourly_measurements_window() {
        // ---
        let store = MemoryStore::new();
        for hour in [1, 20, 22] {
            store.insert_hourly(&hourly("backyard", hour, 1.0, 1.0, 1.0)).await.unwrap();
        }

        let now = Utc.with_ymd_and_hms(2025, 8, 9, 23, 30, 0).unwrap();
        let rows = get_hourly_measurements_at(&store, Some("backyard"), 4, now).await.unwrap();

        assert_eq!(rows.len(), 2);
        assert!(rows[0].hour_start < rows[1].hour_start);
    }
}
