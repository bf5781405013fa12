//! Write Buffer: batches raw samples into bulk inserts.
//!
//! A flush is triggered once the buffer holds `max_items` samples or
//! `max_age` has passed since the last successful flush. A failed flush keeps
//! every sample in memory and mirrors the whole buffer to an on-disk cache
//! file (overwriting the previous one); [`WriteBuffer::restore`] loads that
//! file back on the next start and deletes it. Delivery is at-least-once: a
//! crash between a successful insert and the cache removal replays the batch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::models::Sample;
use crate::store::Store;

// ---

/// What a flush attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered.
    Idle,
    /// All buffered samples were written.
    Flushed(u64),
    /// The insert failed; samples stay buffered. `cached` tells whether the
    /// on-disk copy was written.
    Deferred { buffered: usize, cached: bool },
}

pub struct WriteBuffer {
    items: Vec<Sample>,
    max_items: usize,
    max_age: Duration,
    last_flush: Instant,
    cache_path: PathBuf,
}

impl WriteBuffer {
    // ---
    pub fn new(max_items: usize, max_age: Duration, cache_path: impl Into<PathBuf>) -> Self {
        // ---
        Self {
            items: Vec::new(),
            max_items: max_items.max(1),
            max_age,
            last_flush: Instant::now(),
            cache_path: cache_path.into(),
        }
    }

    /// Create a buffer pre-filled from a leftover cache file, then delete it.
    pub async fn restore(
        max_items: usize,
        max_age: Duration,
        cache_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        // ---
        let mut buffer = Self::new(max_items, max_age, cache_path);

        let bytes = match tokio::fs::read(&buffer.cache_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(buffer),
            Err(e) => return Err(e.into()),
        };

        buffer.items = serde_json::from_slice(&bytes)?;
        tokio::fs::remove_file(&buffer.cache_path).await?;
        info!(
            "Restored {} buffered sample(s) from {}",
            buffer.items.len(),
            buffer.cache_path.display()
        );
        Ok(buffer)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Sample] {
        &self.items
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Apply new thresholds, e.g. from the adaptive sampling config.
    pub fn resize(&mut self, max_items: usize, max_age: Duration) {
        // ---
        if max_items != self.max_items || max_age != self.max_age {
            debug!(
                "Write buffer resized: {} items / {}s",
                max_items,
                max_age.as_secs()
            );
        }
        self.max_items = max_items.max(1);
        self.max_age = max_age;
    }

    /// True once either threshold has been reached with something buffered.
    pub fn is_due(&self) -> bool {
        !self.items.is_empty()
            && (self.items.len() >= self.max_items || self.last_flush.elapsed() >= self.max_age)
    }

    /// Buffer `sample`, flushing if a threshold is now reached.
    ///
    /// Returns the flush outcome when a flush was attempted.
    pub async fn add(&mut self, sample: Sample, store: &dyn Store) -> Option<FlushOutcome> {
        // ---
        self.items.push(sample);
        if self.is_due() {
            Some(self.flush(store).await)
        } else {
            None
        }
    }

    /// Bulk-insert everything buffered.
    ///
    /// Never returns an error: failures fall back to the on-disk cache.
    pub async fn flush(&mut self, store: &dyn Store) -> FlushOutcome {
        // ---
        if self.items.is_empty() {
            return FlushOutcome::Idle;
        }

        match store.insert_samples(&self.items).await {
            Ok(written) => {
                debug!("Flushed {} sample(s) to {}", written, store.backend());
                self.items.clear();
                self.last_flush = Instant::now();
                self.discard_cache().await;
                FlushOutcome::Flushed(written)
            }
            Err(e) => {
                warn!("Write buffer flush failed: {}; keeping {} sample(s)", e, self.items.len());
                let cached = match self.write_cache().await {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Failed to write buffer cache {}: {}", self.cache_path.display(), e);
                        false
                    }
                };
                FlushOutcome::Deferred {
                    buffered: self.items.len(),
                    cached,
                }
            }
        }
    }

    async fn write_cache(&self) -> Result<()> {
        // ---
        let bytes = serde_json::to_vec(&self.items)?;
        tokio::fs::write(&self.cache_path, bytes).await?;
        info!(
            "Cached {} sample(s) to {}",
            self.items.len(),
            self.cache_path.display()
        );
        Ok(())
    }

    async fn discard_cache(&self) {
        // ---
        match tokio::fs::remove_file(&self.cache_path).await {
            Ok(()) => debug!("Removed stale buffer cache {}", self.cache_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove buffer cache {}: {}", self.cache_path.display(), e),
        }
    }
}
