use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};

use super::{store_error, AppState};
use crate::maintenance::MaintenanceTracker;

pub fn router() -> Router<AppState> {
    Router::new().route("/maintenance", get(handler))
}

/// `GET /maintenance`: last attempt of each periodic task.
async fn handler(State((store, _)): State<AppState>) -> impl IntoResponse {
    // ---
    let tracker = MaintenanceTracker::new(store.as_ref());
    match tracker.get_maintenance_status().await {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => store_error(e).into_response(),
    }
}
