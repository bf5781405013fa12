// src/routes/health.rs
//! API health check endpoint.
//!
//! `/health` answers 200 while the store responds to a ping and 503 once it
//! does not, so orchestrators can tell a running process from a working one.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    store: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Handle `GET /health`.
async fn health(State((store, _)): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    // ---
    match store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                store: store.backend(),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                    store: store.backend(),
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
