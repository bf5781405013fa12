//! Daily Report Generator.
//!
//! Summarises yesterday's raw samples for one location, local calendar day.
//! At most one report per (date, location). The report waits until local
//! 01:00 so late samples can land, and a day with no samples gets no report.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, TimeDelta, TimeZone, Timelike, Utc};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::models::{
    to_nanos, DailyReport, HourBreakdown, HourStats, Sample, SummaryStats, REPORT_FIELDS,
};
use crate::store::Store;

const NANOS_PER_HOUR: i64 = 3_600_000_000_000;

pub async fn generate_daily_report(
    store: &dyn Store,
    location: &str,
    offset: FixedOffset,
) -> Result<Option<DailyReport>> {
    generate_daily_report_at(store, location, offset, Utc::now()).await
}

/// Build and store the report for the local day before `now`.
///
/// `Ok(None)` when the report exists, it is before 01:00 local time, or the
/// day has no samples.
pub async fn generate_daily_report_at(
    store: &dyn Store,
    location: &str,
    offset: FixedOffset,
    now: DateTime<Utc>,
) -> Result<Option<DailyReport>> {
    // ---
    let local_now = now.with_timezone(&offset);
    let today = local_now.date_naive();
    let yesterday = today
        .pred_opt()
        .ok_or_else(|| StoreError::InvalidTimestamp(today.to_string()))?;
    let date = yesterday.format("%Y-%m-%d").to_string();

    if store.daily_report(&date, location).await?.is_some() {
        debug!(location, "Daily report for {} already exists", date);
        return Ok(None);
    }

    if local_now.hour() < 1 {
        debug!(location, "Daily report for {} deferred until 01:00 local", date);
        return Ok(None);
    }

    let start = local_midnight(yesterday, offset)?;
    let end = start + TimeDelta::days(1);
    let start_ns = to_nanos(start);
    let samples = store
        .samples_between(Some(location), start_ns, to_nanos(end))
        .await?;

    if samples.is_empty() {
        info!(location, "No data available for daily report on {}", date);
        return Ok(None);
    }

    let report = build_report(&date, location, &samples, start_ns);
    if store.insert_daily_report(&report).await? {
        info!(location, data_points = report.data_points, "Generated daily report for {}", date);
        Ok(Some(report))
    } else {
        Ok(None)
    }
}

/// Summary and 24 hourly buckets starting at `day_start_ns`.
pub fn build_report(
    date: &str,
    location: &str,
    samples: &[Sample],
    day_start_ns: i64,
) -> DailyReport {
    // ---
    let mut summary = BTreeMap::new();
    for field in REPORT_FIELDS {
        let values: Vec<f64> = samples.iter().filter_map(|s| s.field(field)).collect();
        if let Some(stats) = summary_stats(values) {
            summary.insert(field.to_string(), stats);
        }
    }

    let mut buckets: Vec<Vec<&Sample>> = vec![Vec::new(); 24];
    for sample in samples {
        let hour = (sample.timestamp_ns - day_start_ns) / NANOS_PER_HOUR;
        if let Some(bucket) = usize::try_from(hour).ok().and_then(|h| buckets.get_mut(h)) {
            bucket.push(sample);
        }
    }

    let hourly = buckets
        .iter()
        .enumerate()
        .map(|(hour, bucket)| {
            let mut breakdown = HourBreakdown {
                data_points: bucket.len(),
                ..Default::default()
            };
            for field in REPORT_FIELDS {
                let values: Vec<f64> = bucket.iter().filter_map(|s| s.field(field)).collect();
                if let Some(stats) = hour_stats(&values) {
                    breakdown.fields.insert(field.to_string(), stats);
                }
            }
            (hour.to_string(), breakdown)
        })
        .collect();

    DailyReport {
        date: date.to_string(),
        location: location.to_string(),
        data_points: samples.len(),
        summary,
        hourly,
    }
}

fn summary_stats(mut values: Vec<f64>) -> Option<SummaryStats> {
    // ---
    let stats = hour_stats(&values)?;
    values.sort_by(f64::total_cmp);

    let mid = values.len() / 2;
    let median = if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    };

    Some(SummaryStats {
        min: stats.min,
        max: stats.max,
        avg: stats.avg,
        median,
    })
}

fn hour_stats(values: &[f64]) -> Option<HourStats> {
    // ---
    if values.is_empty() {
        return None;
    }
    Some(HourStats {
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        avg: values.iter().sum::<f64>() / values.len() as f64,
    })
}

fn local_midnight(date: chrono::NaiveDate, offset: FixedOffset) -> Result<DateTime<Utc>> {
    // ---
    date.and_hms_opt(0, 0, 0)
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| StoreError::InvalidTimestamp(format!("no local midnight for {date}")))
}
