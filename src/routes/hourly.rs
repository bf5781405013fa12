use axum::{extract::Query, extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Deserialize;
use tracing::debug;

use super::{store_error, AppState};
use crate::downsample::get_hourly_measurements;

const DEFAULT_HOURS: u32 = 24;
const MAX_HOURS: u32 = 24 * 90;

#[derive(Debug, Deserialize)]
struct HourlyQuery {
    hours: Option<u32>,
    location: Option<String>,
}

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/hourly", get(handler))
}

/// `GET /hourly?hours=&location=`: hourly aggregates, oldest first.
async fn handler(
    Query(params): Query<HourlyQuery>,
    State((store, config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    let hours = params.hours.unwrap_or(DEFAULT_HOURS).clamp(1, MAX_HOURS);
    let location = params.location.unwrap_or_else(|| config.location.clone());
    debug!("GET /hourly - {} hour(s) for {}", hours, location);

    match get_hourly_measurements(store.as_ref(), Some(location.as_str()), hours).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}
