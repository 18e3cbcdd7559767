//! Pipeline records.

use chrono::{DateTime, Utc};
use conveyor_core::PipelineId;
use serde::{Deserialize, Serialize};

use crate::pagination::{Page, limit_offset};
use crate::{Store, StoreError, StoreResult};

/// A registered pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PipelineRecord {
    pub id: String,
    pub name: String,
    pub content: String,
    pub driver_dsn: String,
    pub webhook_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPipeline {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub driver_dsn: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

impl Store {
    /// Register a pipeline. The id is derived from `(name, content)`, so
    /// re-registering identical content is idempotent; a content change
    /// mints a new id and a new row.
    pub async fn create_pipeline(&self, new: NewPipeline) -> StoreResult<PipelineRecord> {
        let id = PipelineId::derive(&new.name, &new.content);
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO pipelines (id, name, content, driver_dsn, webhook_secret, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                driver_dsn = excluded.driver_dsn,
                webhook_secret = excluded.webhook_secret,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(id.as_str())
        .bind(&new.name)
        .bind(&new.content)
        .bind(&new.driver_dsn)
        .bind(&new.webhook_secret)
        .bind(now)
        .bind(now)
        .execute(self.writer())
        .await?;

        self.get_pipeline(id.as_str()).await
    }

    pub async fn get_pipeline(&self, id: &str) -> StoreResult<PipelineRecord> {
        sqlx::query_as::<_, PipelineRecord>("SELECT * FROM pipelines WHERE id = ?")
            .bind(id)
            .fetch_optional(self.reader())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("pipeline {id}")))
    }

    pub async fn list_pipelines(&self, page: u32, per_page: u32) -> StoreResult<Page<PipelineRecord>> {
        let (limit, offset) = limit_offset(page, per_page);
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pipelines")
            .fetch_one(self.reader())
            .await?;

        let items = sqlx::query_as::<_, PipelineRecord>(
            "SELECT * FROM pipelines ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.reader())
        .await?;

        Ok(Page::new(items, page.max(1), limit as u32, total.0 as u64))
    }

    /// Delete a pipeline and everything scoped to it: run rows plus every
    /// task-store record under `/pipeline/<runId>/`, in one transaction.
    /// Task records live under the pipeline's own namespace.
    pub async fn delete_pipeline(&self, id: &str) -> StoreResult<()> {
        let namespace = id;
        let mut tx = self.writer().begin().await?;

        let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM pipelines WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("pipeline {id}")));
        }

        let runs: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM pipeline_runs WHERE pipeline_id = ?")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;

        for (run_id,) in &runs {
            let prefix = format!("/{namespace}/pipeline/{run_id}/");
            sqlx::query(
                r#"
                DELETE FROM task_results_fts WHERE rowid IN
                    (SELECT id FROM task_results WHERE path LIKE ? || '%')
                "#,
            )
            .bind(&prefix)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM task_results WHERE path LIKE ? || '%'")
                .bind(&prefix)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM pipeline_runs WHERE pipeline_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pipelines WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
