use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use weatherhat_pipeline::aggregator::{average_readings, WIND_DIRECTION};
use weatherhat_pipeline::config::load_with;
use weatherhat_pipeline::downsample::rollup_hourly_at;
use weatherhat_pipeline::maintenance::{MaintenanceTracker, HOURLY_INTERVAL_SECS, HOURLY_TASK};
use weatherhat_pipeline::models::{
    epoch_seconds, floor_to_hour, FieldMap, MaintenanceStatus, RecordKind, Sample, Tags,
};
use weatherhat_pipeline::records::update_records;
use weatherhat_pipeline::routes;
use weatherhat_pipeline::trends::calculate_trends;
use weatherhat_pipeline::{Config, MemoryStore, Store};

fn utc_offset() -> chrono::FixedOffset {
    chrono::FixedOffset::east_opt(0).unwrap()
}

fn hour_h() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 20, 14, 0, 0).unwrap()
}

fn temperature_sample(at: DateTime<Utc>, temperature: f64) -> Sample {
    let fields: FieldMap = [("temperature".to_string(), temperature)].into_iter().collect();
    Sample::new(fields, Tags::new("backyard", "weatherhat"), at)
}

async fn seed_hour(store: &MemoryStore, temps: &[f64]) {
    // ---
    let samples: Vec<Sample> = temps
        .iter()
        .enumerate()
        .map(|(i, t)| temperature_sample(hour_h() + TimeDelta::minutes(i as i64 * 10), *t))
        .collect();
    store.insert_samples(&samples).await.unwrap();
}

fn memory_config() -> Config {
    // ---
    load_with(|name| match name {
        "DATABASE_URL" => Some("memory://".to_string()),
        "SENSOR_URL" => Some("http://sensor.invalid/reading".to_string()),
        _ => None,
    })
    .unwrap()
}

#[test]
fn wind_direction_averages_across_north() {
    // ---
    let readings: Vec<FieldMap> = [350.0, 10.0, 370.0]
        .iter()
        .map(|d| [(WIND_DIRECTION.to_string(), *d)].into_iter().collect())
        .collect();

    let direction = average_readings(&readings)[WIND_DIRECTION];

    assert!(
        (350.0..360.0).contains(&direction) || (0.0..10.0).contains(&direction),
        "direction={}",
        direction
    );
}

#[tokio::test]
async fn hourly_rollup_of_five_samples() -> Result<()> {
    // ---
    let store = MemoryStore::new();
    seed_hour(&store, &[10.0, 12.0, 14.0, 16.0, 18.0]).await;

    rollup_hourly_at(&store, hour_h() + TimeDelta::minutes(75)).await?;

    let rows = store
        .hourly_between(Some("backyard"), hour_h(), hour_h() + TimeDelta::hours(1))
        .await?;
    assert_eq!(rows.len(), 1);
    let temp = &rows[0].fields["temperature"];
    assert!((temp.avg - 14.0).abs() < 1e-9);
    assert_eq!(temp.min, Some(10.0));
    assert_eq!(temp.max, Some(18.0));
    assert_eq!(rows[0].sample_count, 5);

    // Running again changes nothing
    rollup_hourly_at(&store, hour_h() + TimeDelta::minutes(90)).await?;
    let again = store.hourly_between(None, hour_h(), hour_h() + TimeDelta::hours(1)).await?;
    assert_eq!(again.len(), 1);
    Ok(())
}

#[tokio::test]
async fn hourly_rollup_skips_four_samples() -> Result<()> {
    // ---
    let store = MemoryStore::new();
    seed_hour(&store, &[10.0, 12.0, 14.0, 16.0]).await;

    let outcome = rollup_hourly_at(&store, hour_h() + TimeDelta::minutes(75)).await?;

    assert_eq!(outcome.created, 0);
    let rows = store.hourly_between(None, hour_h(), hour_h() + TimeDelta::hours(1)).await?;
    assert!(rows.is_empty());
    Ok(())
}

#[tokio::test]
async fn stale_hourly_maintenance_runs_and_updates_last_run() -> Result<()> {
    // ---
    let store = MemoryStore::new();
    let now = Utc::now();
    store
        .upsert_maintenance_status(&MaintenanceStatus {
            task: HOURLY_TASK.to_string(),
            last_run: epoch_seconds(now) - 7200.0,
            last_result: None,
            last_error: None,
            last_run_date: (now - TimeDelta::hours(2)).to_rfc3339(),
        })
        .await?;

    let tracker = MaintenanceTracker::new(&store);
    assert!(tracker.should_run_hourly_maintenance().await?);

    tracker.run_hourly_maintenance().await;

    let status = store.maintenance_status(HOURLY_TASK).await?.unwrap();
    assert!((epoch_seconds(Utc::now()) - status.last_run).abs() < 5.0);
    assert!(!tracker.should_run_hourly_maintenance().await?);
    assert!(epoch_seconds(Utc::now()) - status.last_run < HOURLY_INTERVAL_SECS);
    Ok(())
}

#[tokio::test]
async fn records_converge_to_extremes() -> Result<()> {
    // ---
    let store = MemoryStore::new();
    let values = [4.0, -1.5, 9.25, 3.0, 9.0, -1.0];

    for (i, v) in values.iter().enumerate() {
        let sample = temperature_sample(hour_h() + TimeDelta::minutes(i as i64), *v);
        update_records(&store, &sample, utc_offset()).await;
    }

    let high = store.get_record("temperature", "backyard", RecordKind::Highest).await?.unwrap();
    let low = store.get_record("temperature", "backyard", RecordKind::Lowest).await?.unwrap();
    assert_eq!(high.value, 9.25);
    assert_eq!(low.value, -1.5);
    Ok(())
}

async fn serve(store: Arc<dyn Store>) -> Result<String> {
    // ---
    let app = routes::router(store, memory_config());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok(format!("http://{}", addr))
}

#[tokio::test]
async fn read_api_serves_prediction_inputs() -> Result<()> {
    // ---
    let memory = Arc::new(MemoryStore::new());
    let now = Utc::now();
    let hour_start = floor_to_hour(now - TimeDelta::hours(2));
    let samples: Vec<Sample> = (0..5)
        .map(|i| temperature_sample(hour_start + TimeDelta::minutes(i), 20.0 + i as f64))
        .collect();
    memory.insert_samples(&samples).await?;
    rollup_hourly_at(memory.as_ref(), hour_start + TimeDelta::minutes(61)).await?;

    let latest = temperature_sample(now, 25.0);
    update_records(memory.as_ref(), &latest, utc_offset()).await;
    calculate_trends(memory.as_ref(), &latest, utc_offset()).await?;

    let base = serve(memory.clone()).await?;
    let client = Client::new();

    let health = client.get(format!("{}/health", base)).send().await?;
    assert_eq!(health.status(), StatusCode::OK);
    let body: Value = health.json().await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "memory");

    let hourly: Vec<Value> = client
        .get(format!("{}/hourly?hours=24&location=backyard", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0]["sample_count"], 5);

    let trends: Value = client.get(format!("{}/trends/latest", base)).send().await?.json().await?;
    assert_eq!(trends["location"], "backyard");
    assert!(trends["trends"]["temperature"]["hour_24"]["count"].as_u64().unwrap() >= 5);

    let missing = client.get(format!("{}/trends/latest?location=roof", base)).send().await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let records: Vec<Value> = client.get(format!("{}/records", base)).send().await?.json().await?;
    assert_eq!(records.len(), 2);

    let maintenance: Value = client
        .get(format!("{}/maintenance", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(maintenance["hourly_downsample"]["last_run_date"], "Never");
    assert_eq!(maintenance["daily_maintenance"]["last_run"], 0.0);

    memory.set_unavailable(true);
    let down = client.get(format!("{}/health", base)).send().await?;
    assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
    Ok(())
}
