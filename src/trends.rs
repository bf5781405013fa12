//! Trend Engine and adaptive sampling.
//!
//! [`calculate_trends`] summarises how each tracked field moved over the
//! lookback windows ending at a new sample. Callers throttle it; every call
//! appends one snapshot.
//!
//! [`sampling_config`] looks at the last hour of raw samples and picks how
//! aggressively the next cycle should sample and batch.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{from_nanos, to_nanos, FieldTrends, Sample, TrendSnapshot, WindowStats};
use crate::records::local_date_str;
use crate::store::Store;

/// Fields with trends.
pub const TREND_FIELDS: [&str; 4] = ["temperature", "pressure", "humidity", "wind_speed"];

/// Lookback windows as (name, hours).
pub const TREND_WINDOWS: [(&str, i64); 5] = [
    ("hour_1", 1),
    ("hour_3", 3),
    ("hour_6", 6),
    ("hour_12", 12),
    ("hour_24", 24),
];

const NANOS_PER_HOUR: f64 = 3_600_000_000_000.0;

// ---

/// Compute and store the trend snapshot for `sample`.
///
/// Each window covers stored samples of the same location with
/// `now - window <= timestamp < now`, where `now` is the sample's timestamp.
/// Windows without data are omitted.
pub async fn calculate_trends(
    store: &dyn Store,
    sample: &Sample,
    offset: FixedOffset,
) -> Result<TrendSnapshot> {
    // ---
    let now_ns = sample.timestamp_ns;
    let now = from_nanos(now_ns);
    let longest = TREND_WINDOWS.iter().map(|(_, h)| *h).max().unwrap_or(24);
    let start_ns = to_nanos(now - TimeDelta::hours(longest));

    let history = store
        .samples_between(Some(sample.tags.location.as_str()), start_ns, now_ns)
        .await?;
    debug!("Trend history for {}: {} sample(s)", sample.tags.location, history.len());

    let mut trends = BTreeMap::new();
    for field in TREND_FIELDS {
        let Some(current) = sample.field(field) else {
            continue;
        };

        let mut per_window = FieldTrends::new();
        for (name, hours) in TREND_WINDOWS {
            let window_start = to_nanos(now - TimeDelta::hours(hours));
            let series: Vec<(i64, f64)> = history
                .iter()
                .filter(|s| s.timestamp_ns >= window_start)
                .filter_map(|s| s.field(field).map(|v| (s.timestamp_ns, v)))
                .collect();

            if let Some(stats) = window_stats(&series, current, now_ns) {
                per_window.insert(name.to_string(), stats);
            }
        }
        trends.insert(field.to_string(), per_window);
    }

    let snapshot = TrendSnapshot {
        timestamp_ns: now_ns,
        timestamp_date: now,
        date_str: local_date_str(now_ns, offset),
        location: sample.tags.location.clone(),
        trends,
    };

    store.insert_trend(&snapshot).await?;
    info!("Stored trend data for {}", snapshot.date_str);
    Ok(snapshot)
}

/// Most recent snapshot for `location`.
pub async fn latest_trends(store: &dyn Store, location: &str) -> Result<Option<TrendSnapshot>> {
    store.latest_trend(location).await
}

/// Stats for one window; `series` is `(timestamp_ns, value)` oldest first.
///
/// The rate is the change divided by the hours between the first sample in
/// the window and `now_ns`.
pub fn window_stats(series: &[(i64, f64)], current: f64, now_ns: i64) -> Option<WindowStats> {
    // ---
    let (first_ns, first) = *series.first()?;
    let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();

    let change = current - first;
    let change_pct = if first == 0.0 { 0.0 } else { change / first * 100.0 };
    let elapsed_hours = (now_ns - first_ns) as f64 / NANOS_PER_HOUR;
    let rate_per_hour = if elapsed_hours > 0.0 { change / elapsed_hours } else { 0.0 };

    Some(WindowStats {
        count: values.len(),
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        avg: values.iter().sum::<f64>() / values.len() as f64,
        change,
        change_pct,
        rate_per_hour,
    })
}

// --- adaptive sampling

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variability {
    High,
    Moderate,
    Low,
}

/// Sampling and batching parameters for the next cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingConfig {
    pub variability: Variability,
    pub interval: Duration,
    pub readings: u32,
    pub buffer_max_items: usize,
    pub buffer_max_age: Duration,
}

impl SamplingConfig {
    // ---
    pub fn for_variability(variability: Variability) -> Self {
        // ---
        let (interval, readings, buffer_max_items, max_age) = match variability {
            Variability::High => (30, 5, 5, 60),
            Variability::Moderate => (60, 3, 10, 300),
            Variability::Low => (120, 3, 20, 600),
        };
        Self {
            variability,
            interval: Duration::from_secs(interval),
            readings,
            buffer_max_items,
            buffer_max_age: Duration::from_secs(max_age),
        }
    }
}

/// Observed spread over the last hour.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Conditions {
    pub temperature_range: f64,
    pub pressure_change: f64,
    pub max_wind: f64,
}

impl Conditions {
    // ---
    pub fn from_samples(samples: &[Sample]) -> Self {
        // ---
        let temps: Vec<f64> = samples.iter().filter_map(|s| s.field("temperature")).collect();
        let pressures: Vec<f64> = samples.iter().filter_map(|s| s.field("pressure")).collect();

        let temperature_range = if temps.is_empty() {
            0.0
        } else {
            temps.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                - temps.iter().copied().fold(f64::INFINITY, f64::min)
        };
        let pressure_change = match (pressures.first(), pressures.last()) {
            (Some(first), Some(last)) => (last - first).abs(),
            _ => 0.0,
        };
        let max_wind = samples
            .iter()
            .filter_map(|s| s.field("wind_speed"))
            .fold(0.0, f64::max);

        Self {
            temperature_range,
            pressure_change,
            max_wind,
        }
    }

    pub fn classify(&self) -> Variability {
        // ---
        if self.temperature_range > 3.0 || self.pressure_change > 2.0 || self.max_wind > 15.0 {
            Variability::High
        } else if self.temperature_range < 1.0
            && self.pressure_change < 0.5
            && self.max_wind < 5.0
        {
            Variability::Low
        } else {
            Variability::Moderate
        }
    }
}

pub async fn sampling_config(store: &dyn Store, location: &str) -> Result<SamplingConfig> {
    sampling_config_at(store, location, Utc::now()).await
}

/// Classify the last hour for `location`. No data means moderate.
pub async fn sampling_config_at(
    store: &dyn Store,
    location: &str,
    now: DateTime<Utc>,
) -> Result<SamplingConfig> {
    // ---
    let start = now - TimeDelta::hours(1);
    let samples = store
        .samples_between(Some(location), to_nanos(start), to_nanos(now))
        .await?;

    let variability = if samples.is_empty() {
        Variability::Moderate
    } else {
        Conditions::from_samples(&samples).classify()
    };
    debug!(location, ?variability, samples = samples.len(), "Sampling conditions");
    Ok(SamplingConfig::for_variability(variability))
}
