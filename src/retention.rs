//! Retention Manager: tiered expiry policy per resolution.
//!
//! The manager only *declares* policy. Expiry itself is enforced by the store
//! ([`Store::purge_expired`]), which the daily maintenance task drives since
//! PostgreSQL has no native TTL reaper. Declaring is idempotent: re-running
//! with the same policy is a no-op, re-running with a new TTL replaces it.

use std::collections::BTreeMap;

use anyhow::bail;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::store::Store;

// ---

/// Longest retention a tier may declare (about a century).
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Per-collection count of rows removed by one reaper pass.
pub type PurgeReport = BTreeMap<String, u64>;

/// Retention lengths in days per tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    pub raw_days: i64,
    pub trend_days: i64,
    pub hourly_days: i64,
    pub daily_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_days: 90,
            trend_days: 90,
            hourly_days: 90,
            daily_days: 365,
        }
    }
}

impl RetentionConfig {
    // ---
    /// Retention must be positive, at most [`MAX_RETENTION_DAYS`] and never
    /// shrink from raw → trend → hourly → daily.
    pub fn validate(&self) -> anyhow::Result<()> {
        // ---
        let tiers = [
            ("RETENTION_RAW_DAYS", self.raw_days),
            ("RETENTION_TREND_DAYS", self.trend_days),
            ("RETENTION_HOURLY_DAYS", self.hourly_days),
            ("RETENTION_DAILY_DAYS", self.daily_days),
        ];
        for (name, days) in tiers {
            if days <= 0 {
                bail!("{} must be positive, got {}", name, days);
            }
            if days > MAX_RETENTION_DAYS {
                bail!("{} must be at most {} days, got {}", name, MAX_RETENTION_DAYS, days);
            }
        }
        for pair in tiers.windows(2) {
            let ((shorter, a), (longer, b)) = (pair[0], pair[1]);
            if b < a {
                bail!("{} ({}) must not be shorter than {} ({})", longer, b, shorter, a);
            }
        }
        Ok(())
    }

    pub fn policies(&self) -> Vec<RetentionPolicy> {
        vec![
            RetentionPolicy::new(Tier::Raw, self.raw_days),
            RetentionPolicy::new(Tier::Trend, self.trend_days),
            RetentionPolicy::new(Tier::Hourly, self.hourly_days),
            RetentionPolicy::new(Tier::Daily, self.daily_days),
        ]
    }
}

/// A retention/resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Raw,
    Trend,
    Hourly,
    Daily,
}

impl Tier {
    // ---
    pub fn collection(&self) -> &'static str {
        match self {
            Tier::Raw => "measurements",
            Tier::Trend => "trends",
            Tier::Hourly => "hourly_measurements",
            Tier::Daily => "daily_measurements",
        }
    }

    /// Date-typed column the expiry is keyed on.
    pub fn date_field(&self) -> &'static str {
        match self {
            Tier::Raw | Tier::Trend => "timestamp_date",
            Tier::Hourly => "hour_start",
            Tier::Daily => "day_start",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetentionPolicy {
    pub tier: Tier,
    pub ttl_days: i64,
}

impl RetentionPolicy {
    // ---
    pub fn new(tier: Tier, ttl_days: i64) -> Self {
        Self { tier, ttl_days }
    }

    pub fn ttl(&self) -> TimeDelta {
        TimeDelta::try_days(self.ttl_days).unwrap_or(TimeDelta::MAX)
    }

    /// Documents dated strictly before this instant are expired.
    ///
    /// Saturates at the earliest representable instant, so an oversized TTL
    /// expires nothing.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.ttl()).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Ensure the aggregate collections exist and declare expiry for every tier.
///
/// Safe to call on every startup.
pub async fn setup_retention_policies(store: &dyn Store, config: &RetentionConfig) -> Result<()> {
    // ---
    store.ensure_collections().await?;

    let policies = config.policies();
    store.declare_retention(&policies).await?;

    for policy in &policies {
        info!(
            collection = policy.tier.collection(),
            field = policy.tier.date_field(),
            ttl_days = policy.ttl_days,
            "Retention policy declared"
        );
    }
    Ok(())
}

/// Declare the secondary indexes used by range queries and trend scans.
///
/// Performance only; correctness does not depend on them.
pub async fn setup_indexes(store: &dyn Store) -> Result<()> {
    // ---
    store.ensure_indexes().await?;
    info!("Secondary indexes ensured");
    Ok(())
}

/// Run the store's expiry reaper once.
pub async fn enforce_retention(store: &dyn Store, now: DateTime<Utc>) -> Result<PurgeReport> {
    // ---
    let report = store.purge_expired(now).await?;
    let total: u64 = report.values().sum();
    info!(removed = total, "Expired documents purged: {:?}", report);
    Ok(report)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{Sample, Tags};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    #[test]
    fn test_default_policy_lengths() {
        // ---
        let policies = RetentionConfig::default().policies();
        let days: Vec<_> = policies.iter().map(|p| (p.tier, p.ttl_days)).collect();

        assert_eq!(
            days,
            vec![(Tier::Raw, 90), (Tier::Trend, 90), (Tier::Hourly, 90), (Tier::Daily, 365)]
        );
        assert!(RetentionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_shrinking_tiers() {
        // ---
        let cfg = RetentionConfig {
            hourly_days: 30,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = RetentionConfig {
            raw_days: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_retention() {
        // ---
        let cfg = RetentionConfig {
            daily_days: 100_000_000,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("RETENTION_DAILY_DAYS"), "{}", err);

        let cfg = RetentionConfig {
            daily_days: MAX_RETENTION_DAYS,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_policy_expires_nothing() {
        // ---
        let store = MemoryStore::new();
        let cfg = RetentionConfig {
            daily_days: 100_000_000,
            ..Default::default()
        };
        setup_retention_policies(&store, &cfg).await.unwrap();

        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let policy = RetentionPolicy::new(Tier::Daily, 100_000_000);
        assert_eq!(policy.cutoff(now), DateTime::<Utc>::MIN_UTC);

        let report = tokio_test::assert_ok!(enforce_retention(&store, now).await);
        assert_eq!(report.get("daily_measurements"), Some(&0));
    }

    #[test]
    fn test_cutoff() {
        // ---
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let policy = RetentionPolicy::new(Tier::Daily, 365);
        assert_eq!(policy.cutoff(now), Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        // ---
        let store = MemoryStore::new();
        let cfg = RetentionConfig::default();

        setup_retention_policies(&store, &cfg).await.unwrap();
        setup_retention_policies(&store, &cfg).await.unwrap();
        setup_indexes(&store).await.unwrap();
        setup_indexes(&store).await.unwrap();

        assert_eq!(store.declared_policies().await.len(), 4);
    }

    #[tokio::test]
    async fn test_enforce_retention_purges_only_expired_raw_samples() {
        // ---
        let store = MemoryStore::new();
        setup_retention_policies(&store, &RetentionConfig::default()).await.unwrap();

        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let tags = Tags::new("backyard", "weatherhat");
        let old = Sample::new(Default::default(), tags.clone(), now - TimeDelta::days(91));
        let fresh = Sample::new(Default::default(), tags, now - TimeDelta::days(89));
        store.insert_samples(&[old, fresh]).await.unwrap();

        let report = enforce_retention(&store, now).await.unwrap();

        assert_eq!(report.get("measurements"), Some(&1));
        let left = store.samples_between(None, i64::MIN, i64::MAX).await.unwrap();
        assert_eq!(left.len(), 1);
    }
}
