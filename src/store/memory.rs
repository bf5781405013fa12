//! In-process store with the same semantics as the PostgreSQL backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{Result, StoreError};
use crate::models::{
    CollectionStats, DailyAggregate, DailyReport, HourlyAggregate, MaintenanceStatus, RainState,
    Record, RecordKind, Sample, TrendSnapshot,
};
use crate::retention::{PurgeReport, RetentionPolicy, Tier};
use crate::schema::COLLECTIONS;

use super::Store;

#[derive(Default)]
struct Collections {
    closed: bool,
    policies: BTreeMap<Tier, RetentionPolicy>,
    samples: Vec<Sample>,
    hourly: Vec<HourlyAggregate>,
    daily: Vec<DailyAggregate>,
    records: HashMap<(String, String, RecordKind), Record>,
    trends: Vec<TrendSnapshot>,
    maintenance: HashMap<String, MaintenanceStatus>,
    rain: Option<RainState>,
    reports: Vec<DailyReport>,
}

/// Mutex-guarded collections. Cheap to construct, one per test.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Collections>,
    unavailable: AtomicBool,
    purge_failing: AtomicBool,
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`]
    /// until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make only the expiry reaper fail, leaving every other call working.
    pub fn set_purge_failing(&self, failing: bool) {
        self.purge_failing.store(failing, Ordering::SeqCst);
    }

    pub async fn declared_policies(&self) -> Vec<RetentionPolicy> {
        self.inner.lock().await.policies.values().copied().collect()
    }

    async fn open(&self) -> Result<tokio::sync::MutexGuard<'_, Collections>> {
        // ---
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated outage".to_string()));
        }
        let guard = self.inner.lock().await;
        if guard.closed {
            return Err(StoreError::connection(0, "store has been closed"));
        }
        Ok(guard)
    }
}

fn location_matches(filter: Option<&str>, location: &str) -> bool {
    filter.map_or(true, |l| l == location)
}

#[async_trait]
impl Store for MemoryStore {
    // ---
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<()> {
        self.open().await.map(|_| ())
    }

    async fn close(&self) {
        self.inner.lock().await.closed = true;
    }

    async fn ensure_collections(&self) -> Result<()> {
        self.open().await.map(|_| ())
    }

    async fn ensure_indexes(&self) -> Result<()> {
        self.open().await.map(|_| ())
    }

    async fn declare_retention(&self, policies: &[RetentionPolicy]) -> Result<()> {
        // ---
        let mut db = self.open().await?;
        for policy in policies {
            db.policies.insert(policy.tier, *policy);
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<PurgeReport> {
        // ---
        let mut db = self.open().await?;
        if self.purge_failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated purge failure".to_string()));
        }
        let mut report = PurgeReport::new();
        let policies: Vec<RetentionPolicy> = db.policies.values().copied().collect();

        for policy in policies {
            let cutoff = policy.cutoff(now);
            let removed = match policy.tier {
                Tier::Raw => retain_count(&mut db.samples, |s| s.timestamp_date >= cutoff),
                Tier::Trend => retain_count(&mut db.trends, |t| t.timestamp_date >= cutoff),
                Tier::Hourly => retain_count(&mut db.hourly, |h| h.hour_start >= cutoff),
                Tier::Daily => retain_count(&mut db.daily, |d| d.day_start >= cutoff),
            };
            report.insert(policy.tier.collection().to_string(), removed);
        }
        Ok(report)
    }

    async fn collection_stats(&self) -> Result<Vec<CollectionStats>> {
        // ---
        let db = self.open().await?;
        let stats = COLLECTIONS
            .iter()
            .map(|name| {
                let rows = match *name {
                    "measurements" => db.samples.len(),
                    "hourly_measurements" => db.hourly.len(),
                    "daily_measurements" => db.daily.len(),
                    "trends" => db.trends.len(),
                    "records" => db.records.len(),
                    "maintenance_status" => db.maintenance.len(),
                    "rain_state" => usize::from(db.rain.is_some()),
                    "daily_reports" => db.reports.len(),
                    _ => 0,
                };
                CollectionStats {
                    collection: name.to_string(),
                    rows: rows as u64,
                    size_bytes: None,
                    ttl_days: db
                        .policies
                        .values()
                        .find(|p| p.tier.collection() == *name)
                        .map(|p| p.ttl_days),
                }
            })
            .collect();
        Ok(stats)
    }

    async fn insert_samples(&self, samples: &[Sample]) -> Result<u64> {
        // ---
        let mut db = self.open().await?;
        db.samples.extend_from_slice(samples);
        db.samples.sort_by_key(|s| s.timestamp_ns);
        Ok(samples.len() as u64)
    }

    async fn samples_between(
        &self,
        location: Option<&str>,
        start_ns: i64,
        end_ns: i64,
    ) -> Result<Vec<Sample>> {
        // ---
        let db = self.open().await?;
        Ok(db
            .samples
            .iter()
            .filter(|s| s.timestamp_ns >= start_ns && s.timestamp_ns < end_ns)
            .filter(|s| location_matches(location, &s.tags.location))
            .cloned()
            .collect())
    }

    async fn hourly_exists(&self, hour_timestamp_ns: i64, location: &str) -> Result<bool> {
        // ---
        let db = self.open().await?;
        Ok(db
            .hourly
            .iter()
            .any(|h| h.hour_timestamp_ns == hour_timestamp_ns && h.tags.location == location))
    }

    async fn insert_hourly(&self, aggregate: &HourlyAggregate) -> Result<bool> {
        // ---
        let mut db = self.open().await?;
        let duplicate = db.hourly.iter().any(|h| {
            h.hour_timestamp_ns == aggregate.hour_timestamp_ns
                && h.tags.location == aggregate.tags.location
        });
        if duplicate {
            return Ok(false);
        }
        db.hourly.push(aggregate.clone());
        db.hourly.sort_by_key(|h| h.hour_timestamp_ns);
        Ok(true)
    }

    async fn hourly_between(
        &self,
        location: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<HourlyAggregate>> {
        // ---
        let db = self.open().await?;
        Ok(db
            .hourly
            .iter()
            .filter(|h| h.hour_start >= start && h.hour_start < end)
            .filter(|h| location_matches(location, &h.tags.location))
            .cloned()
            .collect())
    }

    async fn daily_exists(&self, day_timestamp_ns: i64, location: &str) -> Result<bool> {
        // ---
        let db = self.open().await?;
        Ok(db
            .daily
            .iter()
            .any(|d| d.day_timestamp_ns == day_timestamp_ns && d.tags.location == location))
    }

    async fn insert_daily(&self, aggregate: &DailyAggregate) -> Result<bool> {
        // ---
        let mut db = self.open().await?;
        let duplicate = db.daily.iter().any(|d| {
            d.day_timestamp_ns == aggregate.day_timestamp_ns
                && d.tags.location == aggregate.tags.location
        });
        if duplicate {
            return Ok(false);
        }
        db.daily.push(aggregate.clone());
        db.daily.sort_by_key(|d| d.day_timestamp_ns);
        Ok(true)
    }

    async fn daily_between(
        &self,
        location: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DailyAggregate>> {
        // ---
        let db = self.open().await?;
        Ok(db
            .daily
            .iter()
            .filter(|d| d.day_start >= start && d.day_start < end)
            .filter(|d| location_matches(location, &d.tags.location))
            .cloned()
            .collect())
    }

    async fn get_record(
        &self,
        field: &str,
        location: &str,
        kind: RecordKind,
    ) -> Result<Option<Record>> {
        // ---
        let db = self.open().await?;
        Ok(db
            .records
            .get(&(field.to_string(), location.to_string(), kind))
            .cloned())
    }

    async fn upsert_record(&self, record: &Record) -> Result<()> {
        // ---
        let mut db = self.open().await?;
        let key = (record.field.clone(), record.location.clone(), record.record_type);
        db.records.insert(key, record.clone());
        Ok(())
    }

    async fn records_for(&self, location: &str) -> Result<Vec<Record>> {
        // ---
        let db = self.open().await?;
        let mut records: Vec<Record> = db
            .records
            .values()
            .filter(|r| r.location == location)
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            let key = |r: &Record| (r.field.clone(), r.record_type.as_str());
            key(a).cmp(&key(b))
        });
        Ok(records)
    }

    async fn insert_trend(&self, snapshot: &TrendSnapshot) -> Result<()> {
        // ---
        let mut db = self.open().await?;
        db.trends.push(snapshot.clone());
        Ok(())
    }

    async fn latest_trend(&self, location: &str) -> Result<Option<TrendSnapshot>> {
        // ---
        let db = self.open().await?;
        Ok(db
            .trends
            .iter()
            .filter(|t| t.location == location)
            .max_by_key(|t| t.timestamp_ns)
            .cloned())
    }

    async fn maintenance_status(&self, task: &str) -> Result<Option<MaintenanceStatus>> {
        let db = self.open().await?;
        Ok(db.maintenance.get(task).cloned())
    }

    async fn upsert_maintenance_status(&self, status: &MaintenanceStatus) -> Result<()> {
        // ---
        let mut db = self.open().await?;
        db.maintenance.insert(status.task.clone(), status.clone());
        Ok(())
    }

    async fn load_rain_state(&self) -> Result<Option<RainState>> {
        let db = self.open().await?;
        Ok(db.rain.clone())
    }

    async fn save_rain_state(&self, state: &RainState) -> Result<()> {
        let mut db = self.open().await?;
        db.rain = Some(state.clone());
        Ok(())
    }

    async fn daily_report(&self, date: &str, location: &str) -> Result<Option<DailyReport>> {
        // ---
        let db = self.open().await?;
        Ok(db
            .reports
            .iter()
            .find(|r| r.date == date && r.location == location)
            .cloned())
    }

    async fn insert_daily_report(&self, report: &DailyReport) -> Result<bool> {
        // ---
        let mut db = self.open().await?;
        if db
            .reports
            .iter()
            .any(|r| r.date == report.date && r.location == report.location)
        {
            return Ok(false);
        }
        db.reports.push(report.clone());
        Ok(true)
    }
}

/// `Vec::retain` that reports how many items were dropped.
fn retain_count<T>(items: &mut Vec<T>, keep: impl FnMut(&T) -> bool) -> u64 {
    let before = items.len();
    items.retain(keep);
    (before - items.len()) as u64
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Tags;
    use chrono::TimeZone;

    fn sample_at(location: &str, at: DateTime<Utc>) -> Sample {
        Sample::new(Default::default(), Tags::new(location, "weatherhat"), at)
    }

    #[tokio::test]
    async fn test_samples_between_is_half_open_and_filtered() {
        // ---
        let store = MemoryStore::new();
        let t0 = Utc.with_ymd_and_hms(2025, 5, 1, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 5, 1, 11, 0, 0).unwrap();
        let samples = [
            sample_at("backyard", t1),
            sample_at("backyard", t0),
            sample_at("roof", t0),
        ];
        store.insert_samples(&samples).await.unwrap();

        let (start, end) = (t0.timestamp_nanos_opt().unwrap(), t1.timestamp_nanos_opt().unwrap());
        let all = store.samples_between(None, start, end).await.unwrap();
        assert_eq!(all.len(), 2);

        let backyard = store
            .samples_between(Some("backyard"), i64::MIN, i64::MAX)
            .await
            .unwrap();
        assert_eq!(backyard.len(), 2);
        assert!(backyard[0].timestamp_ns < backyard[1].timestamp_ns);
    }

    #[tokio::test]
    async fn test_outage_and_close() {
        // ---
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));

        store.set_unavailable(false);
        tokio_test::assert_ok!(store.ping().await);

        store.close().await;
        assert!(store.ping().await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn test_report_insert_is_at_most_once() {
        // ---
        let store = MemoryStore::new();
        let report = DailyReport {
            date: "2025-05-01".to_string(),
            location: "backyard".to_string(),
            data_points: 1,
            summary: Default::default(),
            hourly: Default::default(),
        };

        assert!(store.insert_daily_report(&report).await.unwrap());
        assert!(!store.insert_daily_report(&report).await.unwrap());
        assert!(store.daily_report("2025-05-01", "backyard").await.unwrap().is_some());
    }
}
