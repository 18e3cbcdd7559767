//! HTTP route composition.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::AppState;

pub mod pipelines;
pub mod runs;
pub mod webhooks;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/drivers", get(drivers))
        .nest("/api/pipelines", pipelines::router())
        .nest("/api/runs", runs::router())
        .nest("/api/webhooks", webhooks::router())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn drivers(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    Json(json!({ "drivers": state.config.allowed_drivers.entries() }))
}
