use axum::{
    extract::Query, extract::State, http::StatusCode, response::IntoResponse, routing::get, Json,
    Router,
};
use serde::Deserialize;
use serde_json::json;

use super::{store_error, AppState};
use crate::trends::latest_trends;

#[derive(Debug, Deserialize)]
struct LocationQuery {
    location: Option<String>,
}

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/trends/latest", get(handler))
}

/// `GET /trends/latest?location=`: the newest trend snapshot, 404 if none.
async fn handler(
    Query(params): Query<LocationQuery>,
    State((store, config)): State<AppState>,
) -> impl IntoResponse {
    // ---
    let location = params.location.unwrap_or_else(|| config.location.clone());

    match latest_trends(store.as_ref(), &location).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no trends for {}", location) })),
        )
            .into_response(),
        Err(e) => store_error(e).into_response(),
    }
}
