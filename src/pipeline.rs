//! Top-level orchestration.
//!
//! [`Pipeline`] owns the store handle, the reading source, the write buffer
//! and the rain state for one process. [`run_once`] performs a single
//! scheduled invocation; [`run_service`] loops on coarse one-second ticks with
//! independent timers for measurements, maintenance and reports, and serves
//! the read API alongside. Both always run [`Pipeline::shutdown`] before
//! returning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::aggregator::{average_readings, degrees_to_cardinal, WIND_DIRECTION};
use crate::buffer::{FlushOutcome, WriteBuffer};
use crate::maintenance::{maintain_database_at, MaintenanceTracker};
use crate::models::{FieldMap, RainState, Sample, Tags};
use crate::records::update_records;
use crate::report::generate_daily_report;
use crate::retention::{setup_indexes, setup_retention_policies};
use crate::source::{take_readings, ReadingSource, READING_SPACING};
use crate::store::{self, Store};
use crate::trends::{calculate_trends, sampling_config};
use crate::{rain, routes, Config};

/// Service-mode cadence of maintenance due-checks.
pub const MAINTENANCE_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Service-mode cadence of daily report attempts.
pub const REPORT_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

const TICK: Duration = Duration::from_secs(1);

// ---

pub struct Pipeline {
    store: Arc<dyn Store>,
    source: Arc<dyn ReadingSource>,
    config: Config,
    buffer: WriteBuffer,
    rain: RainState,
    readings_per_cycle: u32,
    last_trend: Option<DateTime<Utc>>,
}

impl Pipeline {
    // ---
    /// Prepare collections, restore leftover buffer contents and the rain
    /// state. Fails only when the store cannot be set up.
    pub async fn start(
        store: Arc<dyn Store>,
        source: Arc<dyn ReadingSource>,
        config: Config,
    ) -> Result<Self> {
        // ---
        setup_retention_policies(store.as_ref(), &config.retention)
            .await
            .context("Failed to set up collections and retention policies")?;

        if let Err(e) = setup_indexes(store.as_ref()).await {
            warn!("Index setup failed, queries may be slow: {}", e);
        }

        let buffer = match WriteBuffer::restore(
            config.buffer_max_items,
            config.buffer_max_age,
            &config.buffer_cache_path,
        )
        .await
        {
            Ok(buffer) => buffer,
            Err(e) => {
                error!("Could not restore buffer cache: {}", e);
                WriteBuffer::new(
                    config.buffer_max_items,
                    config.buffer_max_age,
                    &config.buffer_cache_path,
                )
            }
        };

        let rain = match store.load_rain_state().await {
            Ok(Some(state)) => state,
            Ok(None) => rain::initial_state(Utc::now(), config.local_offset),
            Err(e) => {
                warn!("Could not load rain state, starting from zero: {}", e);
                rain::initial_state(Utc::now(), config.local_offset)
            }
        };

        Ok(Self {
            store,
            source,
            readings_per_cycle: config.readings_per_cycle,
            config,
            buffer,
            rain,
            last_trend: None,
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn buffer(&self) -> &WriteBuffer {
        &self.buffer
    }

    pub fn rain_state(&self) -> &RainState {
        &self.rain
    }

    /// Read the sensor and process one sample.
    ///
    /// `None` when no reading could be taken this cycle.
    pub async fn measurement_cycle(&mut self) -> Option<Sample> {
        // ---
        let readings = match take_readings(
            self.source.as_ref(),
            self.readings_per_cycle,
            true,
            READING_SPACING,
        )
        .await
        {
            Ok(readings) => readings,
            Err(e) => {
                error!("No measurement this cycle: {}", e);
                return None;
            }
        };

        self.process_readings(&readings, Utc::now()).await
    }

    /// Average `readings` into a sample at `now`, then update rain, records,
    /// trends and the write buffer. Failures of those steps are logged and
    /// do not stop the others.
    pub async fn process_readings(
        &mut self,
        readings: &[FieldMap],
        now: DateTime<Utc>,
    ) -> Option<Sample> {
        // ---
        let mut fields = average_readings(readings);
        if fields.is_empty() {
            warn!("No readings to average; skipping cycle");
            return None;
        }

        if let Some(increment) = fields.get("rain").copied() {
            self.rain = rain::accumulate(&self.rain, increment, now, self.config.local_offset);
            fields.insert("rain".to_string(), self.rain.accumulated_rain);
            fields.insert("rain_rate".to_string(), self.rain.last_rain_count);
            if let Err(e) = self.store.save_rain_state(&self.rain).await {
                error!("Failed to save rain state: {}", e);
            }
        }

        let cardinal = fields.get(WIND_DIRECTION).map(|deg| degrees_to_cardinal(*deg).to_string());
        let tags = Tags::new(&self.config.location, &self.config.sensor_type);
        let mut sample = Sample::new(fields, tags, now);
        sample.wind_direction_cardinal = cardinal;

        if let Err(e) = self.store.ping().await {
            warn!("Store health check failed, sample will be buffered: {}", e);
        }

        update_records(self.store.as_ref(), &sample, self.config.local_offset).await;

        if self.trend_due(now) {
            match calculate_trends(self.store.as_ref(), &sample, self.config.local_offset).await {
                Ok(_) => self.last_trend = Some(now),
                Err(e) => error!("Failed to calculate trends: {}", e),
            }
        }

        let added = self.buffer.add(sample.clone(), self.store.as_ref()).await;
        if let Some(FlushOutcome::Deferred { buffered, .. }) = added {
            warn!("{} sample(s) waiting for the store", buffered);
        }
        Some(sample)
    }

    fn trend_due(&self, now: DateTime<Utc>) -> bool {
        // ---
        match self.last_trend {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map_or(false, |elapsed| elapsed >= self.config.trend_interval),
        }
    }

    /// Re-tune cadence and batching from recent variability.
    async fn adapt_sampling(&mut self) -> Duration {
        // ---
        match sampling_config(self.store.as_ref(), &self.config.location).await {
            Ok(sampling) => {
                debug!("Adaptive sampling: {:?}", sampling);
                self.readings_per_cycle = sampling.readings;
                self.buffer.resize(sampling.buffer_max_items, sampling.buffer_max_age);
                sampling.interval
            }
            Err(e) => {
                warn!("Adaptive sampling unavailable: {}", e);
                self.config.interval
            }
        }
    }

    async fn run_maintenance(&self) {
        // ---
        let tracker = MaintenanceTracker::new(self.store.as_ref());
        let ran = tracker.check_and_run_maintenance().await;
        if !ran.is_empty() {
            info!("Maintenance tasks run: {:?}", ran);
        }
    }

    async fn run_report(&self) {
        // ---
        let location = &self.config.location;
        let offset = self.config.local_offset;
        if let Err(e) = generate_daily_report(self.store.as_ref(), location, offset).await {
            error!("Daily report failed: {}", e);
        }
    }

    /// Flush the buffer, persist the rain state, release the sensor and
    /// close the store. Safe to call after partial failures.
    pub async fn shutdown(&mut self) {
        // ---
        info!("Shutting down pipeline");
        match self.buffer.flush(self.store.as_ref()).await {
            FlushOutcome::Deferred { buffered, cached } => warn!(
                "{} sample(s) not written at shutdown (cached to disk: {})",
                buffered, cached
            ),
            FlushOutcome::Flushed(n) => debug!("Flushed {} sample(s) at shutdown", n),
            FlushOutcome::Idle => {}
        }
        if let Err(e) = self.store.save_rain_state(&self.rain).await {
            warn!("Failed to save rain state at shutdown: {}", e);
        }
        self.source.close().await;
        self.store.close().await;
    }
}

/// One scheduled invocation: report, due maintenance, one measurement.
///
/// The stored sample is printed to stdout as JSON.
pub async fn run_once(config: Config, source: Arc<dyn ReadingSource>) -> Result<()> {
    // ---
    let store = store::connect(&config).await.context("Could not reach the store")?;
    let mut pipeline = match Pipeline::start(store.clone(), source.clone(), config).await {
        Ok(p) => p,
        Err(e) => {
            source.close().await;
            store.close().await;
            return Err(e);
        }
    };

    pipeline.run_report().await;
    pipeline.run_maintenance().await;

    let sample = pipeline.measurement_cycle().await;
    pipeline.shutdown().await;

    if let Some(sample) = sample {
        println!("{}", serde_json::to_string(&sample)?);
    }
    Ok(())
}

/// On-demand maintenance: setup, forced rollups and expiry, collection sizes.
///
/// The report is printed to stdout as JSON. The sensor is not touched.
pub async fn run_maintain(config: Config) -> Result<()> {
    // ---
    let store = store::connect(&config).await.context("Could not reach the store")?;
    let result = maintain_database_at(store.as_ref(), &config.retention, Utc::now()).await;
    store.close().await;

    let report = result.context("Maintenance pass failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Long-running mode until SIGINT or SIGTERM.
pub async fn run_service(config: Config, source: Arc<dyn ReadingSource>) -> Result<()> {
    // ---
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        flag.store(false, Ordering::SeqCst);
    });

    serve_until(config, source, running).await
}

/// Service loop that runs while `running` is set.
///
/// The current iteration always completes before the loop exits.
pub async fn serve_until(
    config: Config,
    source: Arc<dyn ReadingSource>,
    running: Arc<AtomicBool>,
) -> Result<()> {
    // ---
    // Bind before the pipeline takes over the buffer cache
    let listener = tokio::net::TcpListener::bind(config.api_bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.api_bind))?;
    let local_addr = listener.local_addr()?;

    let store = store::connect(&config).await.context("Could not reach the store")?;
    let app = routes::router(store.clone(), config.clone());
    let mut pipeline = Pipeline::start(store, source, config).await?;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    info!("Read API listening on {}", local_addr);
    let api = tokio::spawn(async move {
        let shutdown = async {
            stop_rx.await.ok();
        };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            error!("Read API stopped: {}", e);
        }
    });

    let mut measure_every = pipeline.config.interval;
    let mut last_measure: Option<Instant> = None;
    let mut last_maintenance: Option<Instant> = None;
    let mut last_report: Option<Instant> = None;
    let mut ticker = tokio::time::interval(TICK);

    info!("Service loop started");
    while running.load(Ordering::SeqCst) {
        ticker.tick().await;
        let now = Instant::now();

        if elapsed(last_maintenance, now, MAINTENANCE_CHECK_INTERVAL) {
            pipeline.run_maintenance().await;
            last_maintenance = Some(now);
        }

        if elapsed(last_report, now, REPORT_CHECK_INTERVAL) {
            pipeline.run_report().await;
            last_report = Some(now);
        }

        if elapsed(last_measure, now, measure_every) {
            pipeline.measurement_cycle().await;
            last_measure = Some(Instant::now());
            if pipeline.config.adaptive_sampling {
                measure_every = pipeline.adapt_sampling().await;
            }
        } else if pipeline.buffer.is_due() {
            pipeline.buffer.flush(pipeline.store.as_ref()).await;
        }
    }

    info!("Service loop stopping");
    let _ = stop_tx.send(());
    if let Err(e) = api.await {
        warn!("Read API task ended abnormally: {}", e);
    }
    pipeline.shutdown().await;
    Ok(())
}

fn elapsed(last: Option<Instant>, now: Instant, every: Duration) -> bool {
    last.map_or(true, |t| now.duration_since(t) >= every)
}

async fn shutdown_signal() {
    // ---
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{RawReading, RecordKind};
    use crate::source::SourceError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone};

    struct FixedSource;

    #[async_trait]
    impl ReadingSource for FixedSource {
        async fn read(&self) -> std::result::Result<RawReading, SourceError> {
            Ok(RawReading {
                device_temperature: 30.0,
                temperature: 18.0,
                humidity: 60.0,
                dewpoint: 10.0,
                lux: 500.0,
                pressure: 1008.0,
                wind_speed: 2.0,
                rain: 0.4,
                wind_direction: 180.0,
            })
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> Config {
        config_with(dir, &[])
    }

    fn config_with(dir: &tempfile::TempDir, extra: &[(&str, String)]) -> Config {
        // ---
        let mut vars = vec![
            ("DATABASE_URL", "memory://".to_string()),
            ("SENSOR_URL", "http://sensor.invalid/reading".to_string()),
            ("BUFFER_MAX_ITEMS", "2".to_string()),
            (
                "BUFFER_CACHE_PATH",
                dir.path().join("cache.json").display().to_string(),
            ),
        ];
        vars.extend(extra.iter().cloned());
        crate::config::load_with(|name| {
            vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    fn reading(temperature: f64, rain: f64, direction: f64) -> FieldMap {
        [
            ("temperature".to_string(), temperature),
            ("rain".to_string(), rain),
            (WIND_DIRECTION.to_string(), direction),
        ]
        .into_iter()
        .collect()
    }

    async fn pipeline(dir: &tempfile::TempDir) -> (Arc<MemoryStore>, Pipeline) {
        // ---
        let store = Arc::new(MemoryStore::new());
        let p = Pipeline::start(store.clone(), Arc::new(FixedSource), test_config(dir))
            .await
            .unwrap();
        (store, p)
    }

    #[tokio::test]
    async fn test_process_readings_builds_sample() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (store, mut p) = pipeline(&dir).await;
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();

        let sample = p
            .process_readings(&[reading(10.0, 0.2, 350.0), reading(12.0, 0.4, 10.0)], now)
            .await
            .unwrap();

        assert!((sample.fields["temperature"] - 11.0).abs() < 1e-9);
        assert!((sample.fields["rain"] - 0.3).abs() < 1e-9);
        assert!((sample.fields["rain_rate"] - 0.3).abs() < 1e-9);
        assert_eq!(sample.wind_direction_cardinal.as_deref(), Some("N"));
        assert_eq!(sample.tags, Tags::new("backyard", "weatherhat"));

        // Records and the first trend snapshot are written right away
        let high = store.get_record("temperature", "backyard", RecordKind::Highest).await.unwrap();
        assert_eq!(high.map(|r| r.value), Some(11.0));
        assert!(store.latest_trend("backyard").await.unwrap().is_some());
        assert_eq!(store.load_rain_state().await.unwrap(), Some(p.rain_state().clone()));
    }

    #[tokio::test]
    async fn test_empty_cycle_writes_nothing() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (store, mut p) = pipeline(&dir).await;

        assert!(p.process_readings(&[], Utc::now()).await.is_none());
        assert!(p.buffer().is_empty());
        assert!(store.load_rain_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trends_are_throttled() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (store, mut p) = pipeline(&dir).await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();

        p.process_readings(&[reading(10.0, 0.0, 0.0)], t0).await;
        p.process_readings(&[reading(11.0, 0.0, 0.0)], t0 + TimeDelta::minutes(30)).await;
        let latest = store.latest_trend("backyard").await.unwrap().unwrap();
        assert_eq!(latest.timestamp_date, t0);

        p.process_readings(&[reading(12.0, 0.0, 0.0)], t0 + TimeDelta::minutes(61)).await;
        let latest = store.latest_trend("backyard").await.unwrap().unwrap();
        assert_eq!(latest.timestamp_date, t0 + TimeDelta::minutes(61));
    }

    #[tokio::test]
    async fn test_buffer_flushes_and_shutdown_drains() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (store, mut p) = pipeline(&dir).await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();

        for i in 0..3 {
            p.process_readings(&[reading(10.0, 0.0, 0.0)], t0 + TimeDelta::minutes(i)).await;
        }
        let stored = store.samples_between(None, i64::MIN, i64::MAX).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(p.buffer().len(), 1);

        p.shutdown().await;
        assert!(p.buffer().is_empty());
        assert!(store.ping().await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn test_outage_caches_then_restart_recovers() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (store, mut p) = pipeline(&dir).await;
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();

        store.set_unavailable(true);
        for i in 0..2 {
            p.process_readings(&[reading(10.0, 0.0, 0.0)], t0 + TimeDelta::minutes(i)).await;
        }
        assert_eq!(p.buffer().len(), 2);
        assert!(dir.path().join("cache.json").exists());
        drop(p);

        store.set_unavailable(false);
        let mut restarted = Pipeline::start(store.clone(), Arc::new(FixedSource), test_config(&dir))
            .await
            .unwrap();
        assert_eq!(restarted.buffer().len(), 2);

        restarted.shutdown().await;
        assert_eq!(restarted.buffer().len(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_keeps_buffer_cache() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache.json");
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let cached = vec![Sample::new(
            reading(10.0, 0.0, 0.0),
            Tags::new("backyard", "weatherhat"),
            t0,
        )];
        tokio::fs::write(&cache, serde_json::to_vec(&cached).unwrap())
            .await
            .unwrap();

        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().to_string();
        let config = config_with(&dir, &[("API_BIND", port)]);

        let running = Arc::new(AtomicBool::new(true));
        let result = serve_until(config, Arc::new(FixedSource), running).await;

        assert!(result.unwrap_err().to_string().contains("Failed to bind"));
        let bytes = tokio::fs::read(&cache).await.unwrap();
        let restored: Vec<Sample> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored, cached);
    }

    #[tokio::test]
    async fn test_run_maintain_against_memory_store() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        assert!(run_maintain(test_config(&dir)).await.is_ok());
    }
}
