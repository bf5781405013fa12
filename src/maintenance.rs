//! Maintenance Tracker: due-checks and status bookkeeping for periodic tasks.
//!
//! A task is due when it has never run or its interval has elapsed since the
//! last recorded attempt. Every attempt records `last_run`, failed ones
//! included, so a persistent failure waits a full interval before retrying.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::downsample::{rollup_daily_at, rollup_hourly_at, RollupOutcome};
use crate::error::{Result, StoreError};
use crate::models::{epoch_seconds, CollectionStats, MaintenanceStatus};
use crate::retention::{
    enforce_retention, setup_indexes, setup_retention_policies, PurgeReport, RetentionConfig,
};
use crate::store::Store;

pub const HOURLY_TASK: &str = "hourly_downsample";
pub const DAILY_TASK: &str = "daily_maintenance";

pub const HOURLY_INTERVAL_SECS: f64 = 3600.0;
pub const DAILY_INTERVAL_SECS: f64 = 86400.0;

pub const TASKS: [(&str, f64); 2] = [
    (HOURLY_TASK, HOURLY_INTERVAL_SECS),
    (DAILY_TASK, DAILY_INTERVAL_SECS),
];

// ---

/// Result payload of the daily task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMaintenanceResult {
    pub rollup: RollupOutcome,
    pub purged: PurgeReport,
}

/// Outcome of an on-demand [`maintain_database_at`] pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintainReport {
    pub hourly: Option<RollupOutcome>,
    pub daily: Option<DailyMaintenanceResult>,
    pub collections: Vec<CollectionStats>,
}

pub struct MaintenanceTracker<'a> {
    store: &'a dyn Store,
}

impl<'a> MaintenanceTracker<'a> {
    // ---
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    pub async fn should_run_hourly_maintenance(&self) -> Result<bool> {
        self.is_due(HOURLY_TASK, HOURLY_INTERVAL_SECS, Utc::now()).await
    }

    pub async fn should_run_daily_maintenance(&self) -> Result<bool> {
        self.is_due(DAILY_TASK, DAILY_INTERVAL_SECS, Utc::now()).await
    }

    /// True when `task` has no status row or `now - last_run >= interval_secs`.
    pub async fn is_due(&self, task: &str, interval_secs: f64, now: DateTime<Utc>) -> Result<bool> {
        // ---
        let due = match self.store.maintenance_status(task).await? {
            None => true,
            Some(status) => epoch_seconds(now) - status.last_run >= interval_secs,
        };
        Ok(due)
    }

    pub async fn run_hourly_maintenance(&self) -> Option<RollupOutcome> {
        self.run_hourly_maintenance_at(Utc::now()).await
    }

    /// Roll up the previous hour and record the attempt.
    pub async fn run_hourly_maintenance_at(&self, now: DateTime<Utc>) -> Option<RollupOutcome> {
        // ---
        info!("Running hourly maintenance");
        let outcome = rollup_hourly_at(self.store, now).await;
        self.record_attempt(HOURLY_TASK, now, outcome).await
    }

    pub async fn run_daily_maintenance(&self) -> Option<DailyMaintenanceResult> {
        self.run_daily_maintenance_at(Utc::now()).await
    }

    /// Roll up yesterday, purge expired documents and record the attempt.
    pub async fn run_daily_maintenance_at(
        &self,
        now: DateTime<Utc>,
    ) -> Option<DailyMaintenanceResult> {
        // ---
        info!("Running daily maintenance");
        let outcome = async {
            let rollup = rollup_daily_at(self.store, now).await?;
            let purged = enforce_retention(self.store, now).await?;
            Ok::<_, StoreError>(DailyMaintenanceResult { rollup, purged })
        }
        .await;
        self.record_attempt(DAILY_TASK, now, outcome).await
    }

    pub async fn check_and_run_maintenance(&self) -> Vec<&'static str> {
        self.check_and_run_maintenance_at(Utc::now()).await
    }

    /// Run every due task, hourly before daily. Returns the tasks attempted,
    /// whether or not they succeeded.
    pub async fn check_and_run_maintenance_at(&self, now: DateTime<Utc>) -> Vec<&'static str> {
        // ---
        let mut executed = Vec::new();

        match self.is_due(HOURLY_TASK, HOURLY_INTERVAL_SECS, now).await {
            Ok(true) => {
                self.run_hourly_maintenance_at(now).await;
                executed.push(HOURLY_TASK);
            }
            Ok(false) => {}
            Err(e) => error!("Could not check {}: {}", HOURLY_TASK, e),
        }

        match self.is_due(DAILY_TASK, DAILY_INTERVAL_SECS, now).await {
            Ok(true) => {
                self.run_daily_maintenance_at(now).await;
                executed.push(DAILY_TASK);
            }
            Ok(false) => {}
            Err(e) => error!("Could not check {}: {}", DAILY_TASK, e),
        }

        executed
    }

    /// Status of both tasks; tasks that never ran get a zeroed entry.
    pub async fn get_maintenance_status(&self) -> Result<BTreeMap<String, MaintenanceStatus>> {
        // ---
        let mut statuses = BTreeMap::new();
        for (task, _) in TASKS {
            let status = self
                .store
                .maintenance_status(task)
                .await?
                .unwrap_or_else(|| never_run(task));
            statuses.insert(task.to_string(), status);
        }
        Ok(statuses)
    }

    async fn record_attempt<T: Serialize>(
        &self,
        task: &str,
        now: DateTime<Utc>,
        outcome: Result<T>,
    ) -> Option<T> {
        // ---
        let (last_result, last_error, value) = match outcome {
            Ok(value) => match serde_json::to_value(&value) {
                Ok(json) => (Some(json), None, Some(value)),
                Err(e) => (None, Some(format!("result not serializable: {e}")), Some(value)),
            },
            Err(e) => {
                error!("Error in {}: {}", task, e);
                (None, Some(e.to_string()), None)
            }
        };

        let status = MaintenanceStatus {
            task: task.to_string(),
            last_run: epoch_seconds(now),
            last_result,
            last_error,
            last_run_date: now.to_rfc3339(),
        };
        if let Err(e) = self.store.upsert_maintenance_status(&status).await {
            warn!("Failed to record {} status: {}", task, e);
        }
        value
    }
}

fn never_run(task: &str) -> MaintenanceStatus {
    MaintenanceStatus {
        task: task.to_string(),
        last_run: 0.0,
        last_result: None,
        last_error: None,
        last_run_date: "Never".to_string(),
    }
}

/// Force setup and both periodic tasks regardless of due-checks, then
/// report per-collection sizes.
///
/// Fails only when the collections or retention policies cannot be set up,
/// or the sizes cannot be read. Task failures are recorded in their status
/// rows and show up as `None` in the report.
pub async fn maintain_database_at(
    store: &dyn Store,
    retention: &RetentionConfig,
    now: DateTime<Utc>,
) -> Result<MaintainReport> {
    // ---
    setup_retention_policies(store, retention).await?;
    if let Err(e) = setup_indexes(store).await {
        warn!("Index setup failed: {}", e);
    }

    let tracker = MaintenanceTracker::new(store);
    let hourly = tracker.run_hourly_maintenance_at(now).await;
    let daily = tracker.run_daily_maintenance_at(now).await;

    let collections = store.collection_stats().await?;
    for c in &collections {
        info!(
            collection = %c.collection,
            rows = c.rows,
            ttl_days = ?c.ttl_days,
            "Collection size"
        );
    }

    Ok(MaintainReport {
        hourly,
        daily,
        collections,
    })
}
