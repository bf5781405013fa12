//! Reading source: where raw sensor snapshots come from.
//!
//! The sensor itself sits behind a small HTTP endpoint that returns one
//! [`RawReading`] as JSON per request; each request triggers a fresh poll.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{FieldMap, RawReading};

/// Pause between consecutive readings of one cycle.
pub const READING_SPACING: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("sensor request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sensor returned no readings")]
    Empty,
}

#[async_trait]
pub trait ReadingSource: Send + Sync {
    /// Poll the sensor once.
    async fn read(&self) -> Result<RawReading, SourceError>;

    /// Release the sensor. Called once during shutdown.
    async fn close(&self) {}
}

// ---

pub struct HttpReadingSource {
    client: reqwest::Client,
    url: String,
}

impl HttpReadingSource {
    // ---
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        // ---
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ReadingSource for HttpReadingSource {
    // ---
    async fn read(&self) -> Result<RawReading, SourceError> {
        // ---
        debug!("Fetching reading from: {}", self.url);
        let reading = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json::<RawReading>()
            .await?;
        Ok(reading)
    }

    async fn close(&self) {
        debug!("Sensor client for {} released", self.url);
    }
}

/// Take `count` readings `spacing` apart, after an optional warm-up reading
/// that is thrown away.
///
/// A failed reading is logged and skipped; [`SourceError::Empty`] only when
/// every reading failed.
pub async fn take_readings(
    source: &dyn ReadingSource,
    count: u32,
    discard_first: bool,
    spacing: Duration,
) -> Result<Vec<FieldMap>, SourceError> {
    // ---
    if discard_first {
        debug!("Taking warm-up reading (discarded)");
        if let Err(e) = source.read().await {
            warn!("Warm-up reading failed: {}", e);
        }
        tokio::time::sleep(spacing).await;
    }

    let mut readings = Vec::with_capacity(count as usize);
    for i in 0..count {
        match source.read().await {
            Ok(reading) => {
                debug!(
                    "Reading {}/{}: temperature={} humidity={}",
                    i + 1,
                    count,
                    reading.temperature,
                    reading.humidity
                );
                readings.push(reading.to_fields());
            }
            Err(e) => warn!("Reading {}/{} failed: {}", i + 1, count, e),
        }
        if i + 1 < count {
            tokio::time::sleep(spacing).await;
        }
    }

    if readings.is_empty() {
        return Err(SourceError::Empty);
    }
    info!("Collected {} of {} reading(s)", readings.len(), count);
    Ok(readings)
}
