//! Resource-version history.
//!
//! Append-only per resource; `(resource_name, version)` is unique, and
//! re-saving a known version only refreshes `job_name` and `fetched_at`.
//! Source plugins use this to answer "versions newer than X".

use chrono::{DateTime, Utc};
use conveyor_core::resource::Version;
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::{Store, StoreError, StoreResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceVersionRecord {
    pub id: i64,
    pub resource_name: String,
    pub version: Version,
    pub job_name: String,
    pub fetched_at: DateTime<Utc>,
}

/// Canonical encoding used for the uniqueness key. `Version` is a BTreeMap,
/// so serialization order is stable.
fn encode_version(version: &Version) -> String {
    serde_json::to_string(version).unwrap_or_default()
}

impl Store {
    pub async fn save_resource_version(
        &self,
        resource_name: &str,
        version: &Version,
        job_name: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_versions (resource_name, version, job_name, fetched_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(resource_name, version) DO UPDATE SET
                job_name = excluded.job_name,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(resource_name)
        .bind(encode_version(version))
        .bind(job_name)
        .bind(Utc::now())
        .execute(self.writer())
        .await?;
        Ok(())
    }

    /// Full history for a resource, oldest first.
    pub async fn list_resource_versions(
        &self,
        resource_name: &str,
    ) -> StoreResult<Vec<ResourceVersionRecord>> {
        let rows = sqlx::query(
            "SELECT id, resource_name, version, job_name, fetched_at FROM resource_versions WHERE resource_name = ? ORDER BY id ASC",
        )
        .bind(resource_name)
        .fetch_all(self.reader())
        .await?;

        rows.into_iter().map(decode_row).collect()
    }

    /// Versions recorded after `since`, oldest first. With `since = None`,
    /// the whole history. An unknown `since` version yields everything,
    /// which lets a plugin recover after history rewrites.
    pub async fn resource_versions_since(
        &self,
        resource_name: &str,
        since: Option<&Version>,
    ) -> StoreResult<Vec<ResourceVersionRecord>> {
        let floor = match since {
            Some(version) => {
                let row: Option<(i64,)> = sqlx::query_as(
                    "SELECT id FROM resource_versions WHERE resource_name = ? AND version = ?",
                )
                .bind(resource_name)
                .bind(encode_version(version))
                .fetch_optional(self.reader())
                .await?;
                row.map(|(id,)| id).unwrap_or(0)
            }
            None => 0,
        };

        let rows = sqlx::query(
            "SELECT id, resource_name, version, job_name, fetched_at FROM resource_versions WHERE resource_name = ? AND id > ? ORDER BY id ASC",
        )
        .bind(resource_name)
        .bind(floor)
        .fetch_all(self.reader())
        .await?;

        rows.into_iter().map(decode_row).collect()
    }
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<ResourceVersionRecord> {
    let encoded: String = row.get("version");
    let version = serde_json::from_str(&encoded).map_err(|source| StoreError::CorruptPayload {
        path: format!("resource_versions/{}", row.get::<String, _>("resource_name")),
        source,
    })?;
    Ok(ResourceVersionRecord {
        id: row.get("id"),
        resource_name: row.get("resource_name"),
        version,
        job_name: row.get("job_name"),
        fetched_at: row.get("fetched_at"),
    })
}
