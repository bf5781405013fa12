//! Application entry point for the `weatherhat-pipeline` binary.
//!
//! Startup sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Building the HTTP reading source for the sensor
//! - Dispatching to a single scheduled run or the long-running service
//!
//! # Environment Variables
//! - `DATABASE_URL` (**required**) – PostgreSQL connection string, or `memory://`
//! - `SENSOR_URL` (**required**) – sensor endpoint returning one reading as JSON
//! - `WEATHER_MODE` (optional) – `once` (default), `service` or `maintain`
//! - `WEATHER_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `WEATHER_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See `config.rs` for the rest. The process exits non-zero only when a run
//! fails before it could do any work, e.g. the store stays unreachable.
use std::{env, io::IsTerminal, sync::Arc, time::Duration};

use anyhow::Result;
use dotenvy::dotenv;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use weatherhat_pipeline::config;
use weatherhat_pipeline::pipeline::{run_maintain, run_once, run_service};
use weatherhat_pipeline::source::{HttpReadingSource, ReadingSource};
use weatherhat_pipeline::RunMode;

const SENSOR_TIMEOUT: Duration = Duration::from_secs(10);

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    if !cfg.startup_delay.is_zero() {
        tracing::info!("Waiting {}s before starting", cfg.startup_delay.as_secs());
        tokio::time::sleep(cfg.startup_delay).await;
    }

    let result = match cfg.mode {
        RunMode::Maintain => run_maintain(cfg).await,
        mode => {
            let source: Arc<dyn ReadingSource> =
                Arc::new(HttpReadingSource::new(&cfg.sensor_url, SENSOR_TIMEOUT)?);
            match mode {
                RunMode::Service => run_service(cfg, source).await,
                _ => run_once(cfg, source).await,
            }
        }
    };

    if let Err(ref e) = result {
        tracing::error!("Run failed: {:#}", e);
    }
    result
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `WEATHER_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `WEATHER_LOG_LEVEL` env var
///
/// Logs go to stderr so a single run's JSON on stdout stays machine-readable.
fn init_tracing() {
    // ---
    let span_events = match env::var("WEATHER_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stderr().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to WEATHER_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("WEATHER_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
