//! Read-only HTTP API gateway.
//!
//! Each sibling module owns one concern and exports a subrouter; this file
//! merges them and attaches the shared state.

use std::sync::Arc;

use axum::{http::StatusCode, Json, Router};
use serde_json::json;

use crate::store::Store;
use crate::Config;

mod health;
mod hourly;
mod maintenance;
mod records;
mod trends;

/// Shared handler state: the store handle and the loaded configuration.
pub type AppState = (Arc<dyn Store>, Config);

// ---

pub fn router(store: Arc<dyn Store>, config: Config) -> Router {
    // ---
    Router::new()
        .merge(health::router())
        .merge(hourly::router())
        .merge(trends::router())
        .merge(records::router())
        .merge(maintenance::router())
        .with_state((store, config))
}

/// Uniform 500 body for store failures.
fn store_error(e: crate::StoreError) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!("Store query failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}
