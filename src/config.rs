//! Configuration loader for the `weatherhat-pipeline` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{anyhow, bail, Result};
use chrono::FixedOffset;

use crate::retention::RetentionConfig;

/// Parse an optional environment variable with a default value.
macro_rules! parse_env {
    ($lookup:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $lookup($var_name)
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($lookup:expr, $var_name:expr) => {
        $lookup($var_name)
            .ok_or_else(|| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// How the binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One measurement cycle per invocation, maintenance gated by due-checks.
    Once,
    /// Long-running loop with independent timers and a read API.
    Service,
    /// On-demand setup, forced maintenance and collection sizes; no sensor.
    Maintain,
}

impl std::str::FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "once" => Ok(RunMode::Once),
            "service" => Ok(RunMode::Service),
            "maintain" => Ok(RunMode::Maintain),
            other => Err(anyhow!(
                "expected 'once', 'service' or 'maintain', got '{}'",
                other
            )),
        }
    }
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string, or `memory://` for the in-process store.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Connection attempts before giving up at startup.
    pub db_connect_attempts: u32,

    /// Fixed delay between connection attempts.
    pub db_connect_retry: Duration,

    /// Reading source endpoint returning one JSON snapshot per GET.
    pub sensor_url: String,

    pub location: String,
    pub sensor_type: String,
    pub mode: RunMode,

    /// Service-mode measurement interval.
    pub interval: Duration,

    /// Readings averaged per collection cycle.
    pub readings_per_cycle: u32,

    /// Let observed variability resize sampling and buffering each cycle.
    pub adaptive_sampling: bool,

    pub startup_delay: Duration,

    /// Fixed local offset used for report and rain day boundaries.
    pub local_offset: FixedOffset,

    pub buffer_max_items: usize,
    pub buffer_max_age: Duration,
    pub buffer_cache_path: PathBuf,

    /// Minimum spacing between trend snapshots (caller-side throttle).
    pub trend_interval: Duration,

    pub retention: RetentionConfig,

    /// Bind address of the service-mode read API.
    pub api_bind: SocketAddr,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string (or `memory://`)
/// - `SENSOR_URL` – reading source endpoint
///
/// Everything else is optional; see [`load_with`] for the full list.
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    load_with(|name| env::var(name).ok())
}

/// Load configuration through an arbitrary variable lookup.
///
/// Optional variables and defaults:
/// - `DB_POOL_MAX` (5), `DB_CONNECT_ATTEMPTS` (5), `DB_CONNECT_RETRY_SECS` (5)
/// - `WEATHER_LOCATION` (`backyard`), `WEATHER_SENSOR_TYPE` (`weatherhat`)
/// - `WEATHER_MODE` (`once`), `WEATHER_INTERVAL` (60), `WEATHER_READINGS` (3)
/// - `WEATHER_ADAPTIVE` (false), `STARTUP_DELAY` (0), `UTC_OFFSET_MINUTES` (0)
/// - `BUFFER_MAX_ITEMS` (10), `BUFFER_MAX_AGE_SECS` (300),
///   `BUFFER_CACHE_PATH` (`./weather_buffer_cache.json`)
/// - `TREND_INTERVAL_SECS` (3600)
/// - `RETENTION_RAW_DAYS` (90), `RETENTION_TREND_DAYS` (90),
///   `RETENTION_HOURLY_DAYS` (90), `RETENTION_DAILY_DAYS` (365)
/// - `API_BIND` (`0.0.0.0:8080`)
pub fn load_with<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    // ---
    let db_url = require_env!(lookup, "DATABASE_URL");
    let sensor_url = require_env!(lookup, "SENSOR_URL");

    let db_pool_max = parse_env!(lookup, "DB_POOL_MAX", u32, 5);
    let db_connect_attempts = parse_env!(lookup, "DB_CONNECT_ATTEMPTS", u32, 5);
    let db_connect_retry_secs = parse_env!(lookup, "DB_CONNECT_RETRY_SECS", u64, 5);

    let location = lookup("WEATHER_LOCATION").unwrap_or_else(|| "backyard".to_string());
    let sensor_type = lookup("WEATHER_SENSOR_TYPE").unwrap_or_else(|| "weatherhat".to_string());
    let mode = parse_env!(lookup, "WEATHER_MODE", RunMode, RunMode::Once);
    let interval_secs = parse_env!(lookup, "WEATHER_INTERVAL", u64, 60);
    let readings_per_cycle = parse_env!(lookup, "WEATHER_READINGS", u32, 3);
    let adaptive_sampling = parse_env!(lookup, "WEATHER_ADAPTIVE", bool, false);
    let startup_delay_secs = parse_env!(lookup, "STARTUP_DELAY", u64, 0);
    let offset_minutes = parse_env!(lookup, "UTC_OFFSET_MINUTES", i32, 0);

    let buffer_max_items = parse_env!(lookup, "BUFFER_MAX_ITEMS", usize, 10);
    let buffer_max_age_secs = parse_env!(lookup, "BUFFER_MAX_AGE_SECS", u64, 300);
    let buffer_cache_path = lookup("BUFFER_CACHE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./weather_buffer_cache.json"));

    let trend_interval_secs = parse_env!(lookup, "TREND_INTERVAL_SECS", u64, 3600);

    let defaults = RetentionConfig::default();
    let retention = RetentionConfig {
        raw_days: parse_env!(lookup, "RETENTION_RAW_DAYS", i64, defaults.raw_days),
        trend_days: parse_env!(lookup, "RETENTION_TREND_DAYS", i64, defaults.trend_days),
        hourly_days: parse_env!(lookup, "RETENTION_HOURLY_DAYS", i64, defaults.hourly_days),
        daily_days: parse_env!(lookup, "RETENTION_DAILY_DAYS", i64, defaults.daily_days),
    };

    let api_bind = parse_env!(
        lookup,
        "API_BIND",
        SocketAddr,
        SocketAddr::from(([0, 0, 0, 0], 8080))
    );

    let local_offset = FixedOffset::east_opt(offset_minutes * 60)
        .ok_or_else(|| anyhow!("Invalid UTC_OFFSET_MINUTES: {}", offset_minutes))?;

    let cfg = Config {
        db_url,
        db_pool_max,
        db_connect_attempts,
        db_connect_retry: Duration::from_secs(db_connect_retry_secs),
        sensor_url,
        location,
        sensor_type,
        mode,
        interval: Duration::from_secs(interval_secs),
        readings_per_cycle,
        adaptive_sampling,
        startup_delay: Duration::from_secs(startup_delay_secs),
        local_offset,
        buffer_max_items,
        buffer_max_age: Duration::from_secs(buffer_max_age_secs),
        buffer_cache_path,
        trend_interval: Duration::from_secs(trend_interval_secs),
        retention,
        api_bind,
    };
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    // ---
    fn validate(&self) -> Result<()> {
        // ---
        if self.db_pool_max == 0 {
            bail!("DB_POOL_MAX must be at least 1");
        }
        if self.db_connect_attempts == 0 {
            bail!("DB_CONNECT_ATTEMPTS must be at least 1");
        }
        if self.readings_per_cycle == 0 {
            bail!("WEATHER_READINGS must be at least 1");
        }
        if self.buffer_max_items == 0 {
            bail!("BUFFER_MAX_ITEMS must be at least 1");
        }
        if self.interval.is_zero() {
            bail!("WEATHER_INTERVAL must be at least 1 second");
        }
        self.retention.validate()
    }

    /// True when `DATABASE_URL` selects the in-process store.
    pub fn uses_memory_store(&self) -> bool {
        self.db_url.starts_with("memory:")
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL        : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX         : {}", self.db_pool_max);
        tracing::info!(
            "  DB_CONNECT          : {} attempts, {}s apart",
            self.db_connect_attempts,
            self.db_connect_retry.as_secs()
        );
        tracing::info!("  SENSOR_URL          : {}", self.sensor_url);
        tracing::info!("  WEATHER_LOCATION    : {}", self.location);
        tracing::info!("  WEATHER_SENSOR_TYPE : {}", self.sensor_type);
        tracing::info!("  WEATHER_MODE        : {:?}", self.mode);
        tracing::info!("  WEATHER_INTERVAL    : {}s", self.interval.as_secs());
        tracing::info!("  WEATHER_READINGS    : {}", self.readings_per_cycle);
        tracing::info!("  WEATHER_ADAPTIVE    : {}", self.adaptive_sampling);
        tracing::info!("  UTC_OFFSET          : {}", self.local_offset);
        tracing::info!(
            "  BUFFER              : {} items / {}s, cache {}",
            self.buffer_max_items,
            self.buffer_max_age.as_secs(),
            self.buffer_cache_path.display()
        );
        tracing::info!("  TREND_INTERVAL      : {}s", self.trend_interval.as_secs());
        tracing::info!(
            "  RETENTION (days)    : raw {} / trend {} / hourly {} / daily {}",
            self.retention.raw_days,
            self.retention.trend_days,
            self.retention.hourly_days,
            self.retention.daily_days
        );
        tracing::info!("  API_BIND            : {}", self.api_bind);
    }
}

/// Mask the password in a database URL for logging.
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            // `postgres://host@...` has only the scheme colon before '@'
            let scheme = &db_url[..colon_pos];
            if !scheme.ends_with("postgres") && !scheme.ends_with("postgresql") {
                return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
            }
        }
    }
    db_url.to_string()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        // ---
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DATABASE_URL", "postgres://weather:secret@db:5432/weather_data"),
            ("SENSOR_URL", "http://sensor.local/reading"),
        ]
    }

    #[test]
    fn test_defaults() {
        // ---
        let cfg = load_with(lookup_from(&required())).unwrap();

        assert_eq!(cfg.db_pool_max, 5);
        assert_eq!(cfg.db_connect_attempts, 5);
        assert_eq!(cfg.db_connect_retry, Duration::from_secs(5));
        assert_eq!(cfg.location, "backyard");
        assert_eq!(cfg.sensor_type, "weatherhat");
        assert_eq!(cfg.mode, RunMode::Once);
        assert_eq!(cfg.readings_per_cycle, 3);
        assert_eq!(cfg.retention.raw_days, 90);
        assert_eq!(cfg.retention.daily_days, 365);
        assert_eq!(cfg.local_offset, FixedOffset::east_opt(0).unwrap());
        assert!(!cfg.uses_memory_store());
    }

    #[test]
    fn test_missing_required_variable() {
        // ---
        let err = load_with(lookup_from(&[("SENSOR_URL", "http://x")])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_invalid_number_is_reported() {
        // ---
        let mut pairs = required();
        pairs.push(("WEATHER_INTERVAL", "soon"));
        let err = load_with(lookup_from(&pairs)).unwrap_err();
        assert!(err.to_string().contains("WEATHER_INTERVAL"));
    }

    #[test]
    fn test_overrides() {
        // ---
        let mut pairs = required();
        pairs.extend([
            ("WEATHER_MODE", "service"),
            ("UTC_OFFSET_MINUTES", "-300"),
            ("BUFFER_MAX_ITEMS", "25"),
            ("API_BIND", "127.0.0.1:9000"),
        ]);
        let cfg = load_with(lookup_from(&pairs)).unwrap();

        assert_eq!(cfg.mode, RunMode::Service);
        assert_eq!(cfg.local_offset, FixedOffset::west_opt(5 * 3600).unwrap());
        assert_eq!(cfg.buffer_max_items, 25);
        assert_eq!(cfg.api_bind.port(), 9000);
    }

    #[test]
    fn test_retention_must_not_shrink_across_tiers() {
        // ---
        let mut pairs = required();
        pairs.push(("RETENTION_DAILY_DAYS", "30"));
        assert!(load_with(lookup_from(&pairs)).is_err());
    }

    #[test]
    fn test_maintain_mode_and_retention_bound() {
        // ---
        let mut pairs = required();
        pairs.push(("WEATHER_MODE", "maintain"));
        assert_eq!(load_with(lookup_from(&pairs)).unwrap().mode, RunMode::Maintain);

        pairs.push(("RETENTION_DAILY_DAYS", "100000000"));
        let err = format!("{:#}", load_with(lookup_from(&pairs)).unwrap_err());
        assert!(err.contains("RETENTION_DAILY_DAYS"), "{}", err);
    }

    #[test]
    fn test_mask_db_url() {
        // ---
        assert_eq!(
            mask_db_url("postgres://weather:secret@db:5432/weather_data"),
            "postgres://weather:****@db:5432/weather_data"
        );
        assert_eq!(mask_db_url("memory://"), "memory://");
    }
}
