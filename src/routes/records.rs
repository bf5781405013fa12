use axum::{extract::Query, extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Deserialize;

use super::{store_error, AppState};

#[derive(Debug, Deserialize)]
struct LocationQuery {
    location: Option<String>,
}

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/records", get(handler))
}

/// `GET /records?location=`: every stored extreme for the location.
async fn handler(
    Query(params): Query<LocationQuery>,
    State((store, config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    let location = params.location.unwrap_or_else(|| config.location.clone());

    match store.records_for(&location).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}
