//! Pipeline registration and triggering.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_driver::validate_dsn;
use conveyor_store::{NewPipeline, Page, PipelineRecord};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create).get(list))
        .route("/{id}", get(show).delete(remove))
        .route("/{id}/trigger", post(trigger))
        .route("/{id}/runs", get(runs))
}

/// Pipeline shape returned by the API; the webhook secret never leaves the
/// server.
#[derive(Debug, Serialize)]
pub struct PipelineView {
    pub id: String,
    pub name: String,
    pub content: String,
    pub driver_dsn: String,
    pub has_webhook_secret: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<PipelineRecord> for PipelineView {
    fn from(record: PipelineRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            content: record.content,
            driver_dsn: record.driver_dsn,
            has_webhook_secret: record
                .webhook_secret
                .as_deref()
                .is_some_and(|s| !s.is_empty()),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageParams {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_per_page")]
    per_page: u32,
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

async fn create(
    State(state): State<AppState>,
    Json(new): Json<NewPipeline>,
) -> Result<(StatusCode, Json<PipelineView>), ApiError> {
    if new.name.trim().is_empty() {
        return Err(ApiError::BadRequest("pipeline name is required".to_string()));
    }
    if new.content.trim().is_empty() {
        return Err(ApiError::BadRequest("pipeline content is required".to_string()));
    }

    if !new.driver_dsn.is_empty() {
        validate_dsn(&new.driver_dsn, &state.config.allowed_drivers).map_err(ApiError::from)?;
    }

    if new.webhook_secret.as_deref().is_some_and(|s| !s.is_empty())
        && !state.config.features.allows("webhooks")
    {
        return Err(ApiError::BadRequest(
            "webhook_secret requires the webhooks feature".to_string(),
        ));
    }

    let record = state.store.create_pipeline(new).await?;
    info!(pipeline = %record.id, name = %record.name, "pipeline registered");
    Ok((StatusCode::CREATED, Json(record.into())))
}

async fn list(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<Page<PipelineView>>, ApiError> {
    let page = state
        .store
        .list_pipelines(params.page, params.per_page)
        .await?;
    Ok(Json(Page {
        items: page.items.into_iter().map(PipelineView::from).collect(),
        page: page.page,
        per_page: page.per_page,
        total_items: page.total_items,
        total_pages: page.total_pages,
        has_next: page.has_next,
    }))
}

async fn show(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineView>, ApiError> {
    Ok(Json(state.store.get_pipeline(&id).await?.into()))
}

async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_pipeline(&id).await?;
    info!(pipeline = %id, "pipeline deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let pipeline = state.store.get_pipeline(&id).await?;
    let run = state
        .executions
        .trigger_pipeline(&pipeline)
        .await
        .map_err(ApiError::from)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": run.id, "pipeline_id": run.pipeline_id })),
    ))
}

async fn runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Page<conveyor_store::RunRecord>>, ApiError> {
    // 404 for unknown pipelines rather than an empty page.
    state.store.get_pipeline(&id).await?;
    Ok(Json(
        state.store.list_runs(&id, params.page, params.per_page).await?,
    ))
}
