//! Data models for the weather pipeline.
//!
//! One type per logical collection: raw [`Sample`]s, the two rollup tiers,
//! running [`Record`]s, [`TrendSnapshot`]s, [`MaintenanceStatus`] rows, the
//! [`RainState`] singleton and [`DailyReport`]s. Field maps use `BTreeMap` so
//! serialized documents have a stable key order.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

// ---

/// Per-field scalar values of a sample, keyed by field name.
pub type FieldMap = BTreeMap<String, f64>;

/// Fields tracked by the Record Tracker.
pub const RECORD_FIELDS: [&str; 5] = ["temperature", "humidity", "wind_speed", "pressure", "lux"];

/// Fields summarised by the daily report.
pub const REPORT_FIELDS: [&str; 6] = [
    "temperature",
    "humidity",
    "pressure",
    "wind_speed",
    "rain",
    "lux",
];

/// Raw snapshot produced by the reading source for one sensor poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    // ---
    pub device_temperature: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub dewpoint: f64,
    pub lux: f64,
    pub pressure: f64,
    pub wind_speed: f64,
    pub rain: f64,
    pub wind_direction: f64,
}

impl RawReading {
    // ---
    pub fn to_fields(&self) -> FieldMap {
        // ---
        BTreeMap::from([
            ("device_temperature".to_string(), self.device_temperature),
            ("temperature".to_string(), self.temperature),
            ("humidity".to_string(), self.humidity),
            ("dewpoint".to_string(), self.dewpoint),
            ("lux".to_string(), self.lux),
            ("pressure".to_string(), self.pressure),
            ("wind_speed".to_string(), self.wind_speed),
            ("rain".to_string(), self.rain),
            ("wind_direction".to_string(), self.wind_direction),
        ])
    }
}

/// Location and sensor identity attached to every stored document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tags {
    // ---
    pub location: String,
    pub sensor_type: String,
}

impl Tags {
    pub fn new(location: impl Into<String>, sensor_type: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            sensor_type: sensor_type.into(),
        }
    }
}

/// One raw measurement after within-cycle averaging.
///
/// `timestamp_ns` orders and windows samples; `timestamp_date` is the same
/// instant as a date-typed value, used only for expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    // ---
    pub timestamp_ns: i64,
    pub timestamp_date: DateTime<Utc>,
    pub fields: FieldMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_direction_cardinal: Option<String>,
    pub tags: Tags,
}

impl Sample {
    // ---
    pub fn new(fields: FieldMap, tags: Tags, at: DateTime<Utc>) -> Self {
        // ---
        Self {
            timestamp_ns: to_nanos(at),
            timestamp_date: at,
            fields,
            wind_direction_cardinal: None,
            tags,
        }
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}

/// Aggregated statistics of one field over a rollup period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    // ---
    pub avg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Rollup of raw samples for one hour, location and sensor type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAggregate {
    // ---
    pub hour_start: DateTime<Utc>,
    pub hour_timestamp_ns: i64,
    pub fields: BTreeMap<String, FieldStats>,
    pub sample_count: i64,
    pub tags: Tags,
}

/// Rollup of hourly aggregates for one UTC day, location and sensor type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    // ---
    pub day_start: DateTime<Utc>,
    pub day_timestamp_ns: i64,
    /// `YYYY-MM-DD`
    pub date: String,
    pub fields: BTreeMap<String, FieldStats>,
    pub hour_count: i64,
    pub tags: Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Highest,
    Lowest,
}

impl RecordKind {
    // ---
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Highest => "highest",
            RecordKind::Lowest => "lowest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "highest" => Some(RecordKind::Highest),
            "lowest" => Some(RecordKind::Lowest),
            _ => None,
        }
    }

    /// True when `candidate` beats `current` for this kind of record.
    pub fn is_improved_by(&self, current: f64, candidate: f64) -> bool {
        match self {
            RecordKind::Highest => candidate > current,
            RecordKind::Lowest => candidate < current,
        }
    }
}

/// Running extreme for one (field, location, kind).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    // ---
    pub field: String,
    pub location: String,
    pub record_type: RecordKind,
    pub value: f64,
    pub timestamp_ns: i64,
    pub date_str: String,
}

/// Statistics for one field over one lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    // ---
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub change: f64,
    pub change_pct: f64,
    pub rate_per_hour: f64,
}

/// Window name (`hour_1`, `hour_3`, ...) to stats.
pub type FieldTrends = BTreeMap<String, WindowStats>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSnapshot {
    // ---
    pub timestamp_ns: i64,
    pub timestamp_date: DateTime<Utc>,
    pub date_str: String,
    pub location: String,
    pub trends: BTreeMap<String, FieldTrends>,
}

/// Persisted outcome of the last attempt of a maintenance task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceStatus {
    // ---
    pub task: String,
    /// Epoch seconds of the last attempt, successful or not.
    pub last_run: f64,
    pub last_result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub last_run_date: String,
}

/// Daily rain accumulation carried across cycles and process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RainState {
    // ---
    /// Millimetres accumulated since `last_reset_time`.
    pub accumulated_rain: f64,
    /// Epoch seconds of the last reset (local midnight).
    pub last_reset_time: i64,
    /// Increment applied by the most recent cycle.
    pub last_rain_count: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    // ---
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourStats {
    // ---
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HourBreakdown {
    // ---
    pub data_points: usize,
    #[serde(flatten)]
    pub fields: BTreeMap<String, HourStats>,
}

/// Summary of one completed local day of raw samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyReport {
    // ---
    /// `YYYY-MM-DD`
    pub date: String,
    pub location: String,
    pub data_points: usize,
    pub summary: BTreeMap<String, SummaryStats>,
    /// Keys `"0"` through `"23"`.
    pub hourly: BTreeMap<String, HourBreakdown>,
}

/// Row count, on-disk size and declared expiry of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub collection: String,
    pub rows: u64,
    /// Table plus index size; `None` for the in-memory store.
    pub size_bytes: Option<u64>,
    /// `None` when no expiry policy is declared for the collection.
    pub ttl_days: Option<i64>,
}

// --- time helpers

/// Nanoseconds since the epoch. Saturates outside the representable range.
pub fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(if at.timestamp() < 0 { i64::MIN } else { i64::MAX })
}

pub fn from_nanos(ns: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(ns)
}

/// Epoch seconds with sub-second precision.
pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64 + f64::from(at.timestamp_subsec_nanos()) / 1e9
}

/// Top of the hour containing `at`.
pub fn floor_to_hour(at: DateTime<Utc>) -> DateTime<Utc> {
    // ---
    Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), at.hour(), 0, 0)
        .single()
        .unwrap_or(at)
}

/// UTC midnight of the day containing `at`.
pub fn floor_to_day(at: DateTime<Utc>) -> DateTime<Utc> {
    // ---
    Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), 0, 0, 0)
        .single()
        .unwrap_or(at)
}
