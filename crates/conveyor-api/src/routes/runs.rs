//! Run status and task-store readout.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use conveyor_store::tree;
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(show))
        .route("/{id}/results", get(results))
}

async fn show(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<conveyor_store::RunRecord>, ApiError> {
    Ok(Json(state.store.get_run(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ResultParams {
    /// Path prefix under the run, e.g. `tasks`. Empty means everything.
    #[serde(default)]
    prefix: String,
    /// Optional full-text query over task output.
    q: Option<String>,
}

async fn results(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ResultParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run = state.store.get_run(&id).await?;
    let tasks = state.store.tasks(&run.pipeline_id);

    let prefix = if params.prefix.is_empty() {
        format!("/pipeline/{}/", run.id)
    } else {
        format!("/pipeline/{}/{}", run.id, params.prefix.trim_start_matches('/'))
    };

    let rows = match params.q.as_deref() {
        Some(query) => tasks.search(&prefix, query).await?,
        None => tasks.get_all(&prefix, &[]).await?,
    };

    let flattened = tree::as_tree(&rows);
    Ok(Json(json!({
        "results": rows
            .iter()
            .map(|r| json!({ "id": r.id, "path": r.path, "payload": r.payload }))
            .collect::<Vec<_>>(),
        "tree": flattened,
    })))
}
