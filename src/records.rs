//! Record Tracker: running highest/lowest value per field and location.

use chrono::FixedOffset;
use tracing::{error, info};

use crate::error::Result;
use crate::models::{from_nanos, Record, RecordKind, Sample, RECORD_FIELDS};
use crate::store::Store;

/// Human-readable local time stored alongside each record.
pub fn local_date_str(timestamp_ns: i64, offset: FixedOffset) -> String {
    from_nanos(timestamp_ns)
        .with_timezone(&offset)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// Compare `sample` against the stored extremes and overwrite any it beats.
///
/// Failures are logged per comparison and never abort the caller. Returns the
/// number of records written.
pub async fn update_records(store: &dyn Store, sample: &Sample, offset: FixedOffset) -> usize {
    // ---
    let location = sample.tags.location.as_str();
    let mut updated = 0;

    for field in RECORD_FIELDS {
        let Some(value) = sample.field(field) else {
            continue;
        };

        for kind in [RecordKind::Highest, RecordKind::Lowest] {
            match check_record(store, sample, field, value, kind, offset).await {
                Ok(true) => {
                    info!(location, "New {} record for {}: {}", kind.as_str(), field, value);
                    updated += 1;
                }
                Ok(false) => {}
                Err(e) => error!(
                    location,
                    "Failed to update {} {} record: {}",
                    kind.as_str(),
                    field,
                    e
                ),
            }
        }
    }
    updated
}

async fn check_record(
    store: &dyn Store,
    sample: &Sample,
    field: &str,
    value: f64,
    kind: RecordKind,
    offset: FixedOffset,
) -> Result<bool> {
    // ---
    let location = &sample.tags.location;
    let current = store.get_record(field, location, kind).await?;

    let beaten = match current {
        None => true,
        Some(ref record) => kind.is_improved_by(record.value, value),
    };
    if !beaten {
        return Ok(false);
    }

    let record = Record {
        field: field.to_string(),
        location: location.clone(),
        record_type: kind,
        value,
        timestamp_ns: sample.timestamp_ns,
        date_str: local_date_str(sample.timestamp_ns, offset),
    };
    store.upsert_record(&record).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::Tags;
    use crate::store::MemoryStore;
    use chrono::{TimeDelta, TimeZone, Utc};

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn sample(minute: i64, temperature: f64) -> Sample {
        // ---
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).unwrap() + TimeDelta::minutes(minute);
        let fields = [("temperature".to_string(), temperature)].into_iter().collect();
        Sample::new(fields, Tags::new("backyard", "weatherhat"), at)
    }

    async fn extremes(store: &MemoryStore) -> (f64, f64) {
        // ---
        let high = store.get_record("temperature", "backyard", RecordKind::Highest).await.unwrap();
        let low = store.get_record("temperature", "backyard", RecordKind::Lowest).await.unwrap();
        (high.unwrap().value, low.unwrap().value)
    }

    #[tokio::test]
    async fn test_first_sample_sets_both_records() {
        // ---
        let store = MemoryStore::new();
        let written = update_records(&store, &sample(0, 4.5), utc()).await;

        assert_eq!(written, 2);
        assert_eq!(extremes(&store).await, (4.5, 4.5));
    }

    #[tokio::test]
    async fn test_records_track_max_and_min_in_any_order() {
        // ---
        let orders: [&[f64]; 3] = [
            &[3.0, -2.5, 7.25, 0.0, 7.0],
            &[7.25, 7.0, 3.0, 0.0, -2.5],
            &[0.0, -2.5, 3.0, 7.0, 7.25],
        ];

        for values in orders {
            let store = MemoryStore::new();
            for (i, v) in values.iter().enumerate() {
                update_records(&store, &sample(i as i64, *v), utc()).await;
            }
            assert_eq!(extremes(&store).await, (7.25, -2.5), "order {:?}", values);
        }
    }

    #[tokio::test]
    async fn test_equal_value_does_not_overwrite() {
        // ---
        let store = MemoryStore::new();
        update_records(&store, &sample(0, 5.0), utc()).await;
        let written = update_records(&store, &sample(10, 5.0), utc()).await;

        assert_eq!(written, 0);
        let high = store
            .get_record("temperature", "backyard", RecordKind::Highest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(high.date_str, "2025-01-15 06:00:00");
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        // ---
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert_eq!(update_records(&store, &sample(0, 1.0), utc()).await, 0);
    }

    #[test]
    fn test_local_date_str_uses_offset() {
        // ---
        let ns = sample(0, 0.0).timestamp_ns;
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(local_date_str(ns, offset), "2025-01-15 08:00:00");
    }
}
