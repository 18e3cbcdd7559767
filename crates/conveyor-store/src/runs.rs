//! Pipeline run records and their status lifecycle.

use chrono::{DateTime, Utc};
use conveyor_core::RunId;
use serde::{Deserialize, Serialize};

use crate::pagination::{Page, limit_offset};
use crate::{Store, StoreError, StoreResult};

/// Run lifecycle: `queued -> running -> (success | failed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {other:?}")),
        }
    }
}

/// One execution of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunRecord {
    pub id: String,
    pub pipeline_id: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn run_status(&self) -> RunStatus {
        self.status.parse().unwrap_or(RunStatus::Failed)
    }
}

impl Store {
    pub async fn create_run(&self, pipeline_id: &str) -> StoreResult<RunRecord> {
        let id = RunId::generate();
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, pipeline_id, status, created_at)
            VALUES (?, ?, 'queued', ?)
            "#,
        )
        .bind(id.as_str())
        .bind(pipeline_id)
        .bind(Utc::now())
        .execute(self.writer())
        .await?;

        self.get_run(id.as_str()).await
    }

    pub async fn get_run(&self, id: &str) -> StoreResult<RunRecord> {
        sqlx::query_as::<_, RunRecord>("SELECT * FROM pipeline_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.reader())
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))
    }

    /// Move a queued run to `running`, stamping `started_at`.
    pub async fn mark_run_running(&self, id: &str) -> StoreResult<()> {
        sqlx::query(
            "UPDATE pipeline_runs SET status = 'running', started_at = ? WHERE id = ? AND status = 'queued'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(self.writer())
        .await?;
        Ok(())
    }

    /// Move a run to a terminal status, stamping `completed_at` and, for
    /// failures, the error message. Terminal statuses are irreversible:
    /// the update only applies to non-terminal rows.
    pub async fn mark_run_finished(
        &self,
        id: &str,
        status: RunStatus,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        debug_assert!(status.is_terminal());
        sqlx::query(
            r#"
            UPDATE pipeline_runs
            SET status = ?, completed_at = ?, error_message = ?
            WHERE id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(error_message)
        .bind(id)
        .execute(self.writer())
        .await?;
        Ok(())
    }

    pub async fn list_runs(
        &self,
        pipeline_id: &str,
        page: u32,
        per_page: u32,
    ) -> StoreResult<Page<RunRecord>> {
        let (limit, offset) = limit_offset(page, per_page);
        let total: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pipeline_runs WHERE pipeline_id = ?")
                .bind(pipeline_id)
                .fetch_one(self.reader())
                .await?;

        let items = sqlx::query_as::<_, RunRecord>(
            "SELECT * FROM pipeline_runs WHERE pipeline_id = ? ORDER BY created_at DESC, id LIMIT ? OFFSET ?",
        )
        .bind(pipeline_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.reader())
        .await?;

        Ok(Page::new(items, page.max(1), limit as u32, total.0 as u64))
    }
}
