//! The append/patch task store.
//!
//! Every driver and every pipeline writes JSON records here, keyed by
//! hierarchical path. Writes to an existing path merge top-level keys so
//! independent writers (the driver stamping `status`, the runtime stamping
//! `elapsed`) compose without coordination.

use serde_json::Value;
use sqlx::Row;

use crate::ansi::strip_ansi;
use crate::{Store, StoreError, StoreResult};

/// One row of the task store. `id` is the canonical ordering key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub id: i64,
    pub path: String,
    pub payload: Value,
}

/// A namespaced view over the task-result table.
#[derive(Clone)]
pub struct TaskStore {
    store: Store,
    namespace: String,
}

impl TaskStore {
    pub(crate) fn new(store: Store, namespace: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn full_path(&self, path: &str) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("/{}/{}", self.namespace, path)
    }

    /// Upsert `payload` at `path`. The first write inserts; later writes
    /// patch top-level keys into the stored object, last writer wins per
    /// key. The full-text index row is rebuilt in the same transaction.
    pub async fn set(&self, path: &str, payload: Value) -> StoreResult<()> {
        let full_path = self.full_path(path);

        let mut tx = self.store.writer().begin().await?;

        let existing: Option<(i64, String)> =
            sqlx::query_as("SELECT id, payload FROM task_results WHERE path = ?")
                .bind(&full_path)
                .fetch_optional(&mut *tx)
                .await?;

        let (id, merged) = match existing {
            Some((id, stored)) => {
                let mut stored: Value =
                    serde_json::from_str(&stored).map_err(|source| StoreError::CorruptPayload {
                        path: full_path.clone(),
                        source,
                    })?;
                patch_top_level(&mut stored, payload);
                sqlx::query("UPDATE task_results SET payload = ? WHERE id = ?")
                    .bind(stored.to_string())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                (id, stored)
            }
            None => {
                let result =
                    sqlx::query("INSERT INTO task_results (path, payload) VALUES (?, ?)")
                        .bind(&full_path)
                        .bind(payload.to_string())
                        .execute(&mut *tx)
                        .await?;
                (result.last_insert_rowid(), payload)
            }
        };

        // Rebuild the index row: delete-then-insert inside the transaction
        // so a write failure never leaves a partial FTS row.
        sqlx::query("DELETE FROM task_results_fts WHERE rowid = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let mut text = String::new();
        collect_strings(&merged, &mut text);
        sqlx::query("INSERT INTO task_results_fts (rowid, content, path) VALUES (?, ?, ?)")
            .bind(id)
            .bind(strip_ansi(&text))
            .bind(&full_path)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, path: &str) -> StoreResult<Value> {
        let full_path = self.full_path(path);
        let row: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM task_results WHERE path = ?")
                .bind(&full_path)
                .fetch_optional(self.store.reader())
                .await?;

        let (payload,) = row.ok_or_else(|| StoreError::NotFound(full_path.clone()))?;
        serde_json::from_str(&payload).map_err(|source| StoreError::CorruptPayload {
            path: full_path,
            source,
        })
    }

    /// All records whose path starts with `prefix`, ordered by insertion id.
    /// `fields` projects top-level keys; empty means the whole payload.
    pub async fn get_all(&self, prefix: &str, fields: &[&str]) -> StoreResult<Vec<ResultRow>> {
        let full_prefix = self.full_path(prefix);
        let rows = sqlx::query(
            "SELECT id, path, payload FROM task_results WHERE path LIKE ? || '%' ORDER BY id ASC",
        )
        .bind(&full_prefix)
        .fetch_all(self.store.reader())
        .await?;

        rows.into_iter()
            .map(|row| self.decode_row(row, fields))
            .collect()
    }

    /// Full-text search restricted to rows whose path begins with `prefix`.
    ///
    /// Each whitespace-separated token becomes a quoted prefix term so FTS5
    /// operator words in user input match literally.
    pub async fn search(&self, prefix: &str, query: &str) -> StoreResult<Vec<ResultRow>> {
        let Some(match_expr) = build_match_expr(query) else {
            return Ok(Vec::new());
        };
        let full_prefix = self.full_path(prefix);

        let rows = sqlx::query(
            r#"
            SELECT r.id, r.path, r.payload
            FROM task_results r
            JOIN task_results_fts ON task_results_fts.rowid = r.id
            WHERE task_results_fts MATCH ? AND r.path LIKE ? || '%'
            ORDER BY r.id ASC
            "#,
        )
        .bind(&match_expr)
        .bind(&full_prefix)
        .fetch_all(self.store.reader())
        .await?;

        rows.into_iter().map(|row| self.decode_row(row, &[])).collect()
    }

    fn decode_row(&self, row: sqlx::sqlite::SqliteRow, fields: &[&str]) -> StoreResult<ResultRow> {
        let id: i64 = row.get("id");
        let full_path: String = row.get("path");
        let payload: String = row.get("payload");

        let mut value: Value =
            serde_json::from_str(&payload).map_err(|source| StoreError::CorruptPayload {
                path: full_path.clone(),
                source,
            })?;

        if !fields.is_empty() {
            if let Value::Object(object) = &value {
                let projected = fields
                    .iter()
                    .filter_map(|field| {
                        object
                            .get(*field)
                            .map(|v| ((*field).to_string(), v.clone()))
                    })
                    .collect();
                value = Value::Object(projected);
            }
        }

        // Strip the namespace prefix the store added on write.
        let path = full_path
            .strip_prefix(&format!("/{}", self.namespace))
            .unwrap_or(&full_path)
            .to_string();

        Ok(ResultRow {
            id,
            path,
            payload: value,
        })
    }
}

/// Shallow-merge `patch`'s top-level keys into `target`.
fn patch_top_level(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                target.insert(key, value);
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Concatenate every string leaf of `value`.
fn collect_strings(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(s);
        }
        Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

/// Build an FTS5 MATCH expression where every user token is a quoted prefix
/// term. Returns `None` for an all-whitespace query.
fn build_match_expr(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|token| format!("\"{}\"*", token.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use serde_json::json;

    async fn task_store() -> TaskStore {
        Store::in_memory().await.unwrap().tasks("test")
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let tasks = task_store().await;
        tasks
            .set("/pipeline/r1/tasks/0-build", json!({"status": "running"}))
            .await
            .unwrap();
        let value = tasks.get("/pipeline/r1/tasks/0-build").await.unwrap();
        assert_eq!(value, json!({"status": "running"}));
    }

    #[tokio::test]
    async fn second_set_patches_top_level_keys() {
        let tasks = task_store().await;
        tasks.set("/p", json!({"a": 1})).await.unwrap();
        tasks.set("/p", json!({"b": 2})).await.unwrap();
        assert_eq!(tasks.get("/p").await.unwrap(), json!({"a": 1, "b": 2}));

        tasks.set("/p", json!({"a": 9})).await.unwrap();
        assert_eq!(tasks.get("/p").await.unwrap(), json!({"a": 9, "b": 2}));
    }

    #[tokio::test]
    async fn get_absent_path_is_not_found() {
        let tasks = task_store().await;
        assert!(matches!(
            tasks.get("/missing").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn get_all_orders_by_insertion_and_projects_fields() {
        let tasks = task_store().await;
        tasks
            .set("/pipeline/r/tasks/1-b", json!({"status": "ok", "elapsed": 3}))
            .await
            .unwrap();
        tasks
            .set("/pipeline/r/tasks/0-a", json!({"status": "bad", "elapsed": 1}))
            .await
            .unwrap();

        let rows = tasks.get_all("/pipeline/r", &["status"]).await.unwrap();
        assert_eq!(rows.len(), 2);
        // Insertion order, not path order.
        assert_eq!(rows[0].path, "/pipeline/r/tasks/1-b");
        assert_eq!(rows[1].path, "/pipeline/r/tasks/0-a");
        assert_eq!(rows[0].payload, json!({"status": "ok"}));
        assert!(rows[0].payload.get("elapsed").is_none());
    }

    #[tokio::test]
    async fn get_all_respects_prefix() {
        let tasks = task_store().await;
        tasks.set("/pipeline/r1/tasks/0-a", json!({"x": 1})).await.unwrap();
        tasks.set("/pipeline/r2/tasks/0-a", json!({"x": 2})).await.unwrap();

        let rows = tasks.get_all("/pipeline/r1", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "/pipeline/r1/tasks/0-a");
    }

    #[tokio::test]
    async fn search_is_restricted_to_prefix() {
        let tasks = task_store().await;
        tasks
            .set("/pipeline/r1/tasks/0-a", json!({"stdout": "compile finished"}))
            .await
            .unwrap();
        tasks
            .set("/pipeline/r2/tasks/0-a", json!({"stdout": "compile finished"}))
            .await
            .unwrap();

        let rows = tasks.search("/pipeline/r1", "compile").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "/pipeline/r1/tasks/0-a");
    }

    #[tokio::test]
    async fn search_treats_operator_words_literally() {
        let tasks = task_store().await;
        tasks
            .set("/pipeline/r/tasks/0-a", json!({"stdout": "NOT AND OR NEAR"}))
            .await
            .unwrap();
        tasks
            .set("/pipeline/r/tasks/1-b", json!({"stdout": "something else"}))
            .await
            .unwrap();

        let rows = tasks.search("/pipeline/r", "NOT AND").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].path, "/pipeline/r/tasks/0-a");
    }

    #[tokio::test]
    async fn search_matches_prefixes_of_words() {
        let tasks = task_store().await;
        tasks
            .set("/pipeline/r/tasks/0-a", json!({"stdout": "deployment succeeded"}))
            .await
            .unwrap();
        let rows = tasks.search("/pipeline/r", "deploy").await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn ansi_escapes_are_stripped_before_indexing() {
        let tasks = task_store().await;
        tasks
            .set(
                "/pipeline/r/tasks/0-a",
                json!({"stdout": "\x1b[1m\x1b[32mneedle\x1b[0m"}),
            )
            .await
            .unwrap();

        let rows = tasks.search("/pipeline/r", "needle").await.unwrap();
        assert_eq!(rows.len(), 1);
        // The stored payload keeps the raw escapes for rendering.
        let value = tasks.get("/pipeline/r/tasks/0-a").await.unwrap();
        assert!(value["stdout"].as_str().unwrap().contains('\x1b'));
    }

    #[tokio::test]
    async fn reindex_replaces_old_terms() {
        let tasks = task_store().await;
        tasks.set("/p", json!({"stdout": "alpha"})).await.unwrap();
        tasks.set("/p", json!({"stdout": "omega"})).await.unwrap();

        assert!(tasks.search("/", "alpha").await.unwrap().is_empty());
        assert_eq!(tasks.search("/", "omega").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_query_returns_nothing() {
        let tasks = task_store().await;
        tasks.set("/p", json!({"stdout": "text"})).await.unwrap();
        assert!(tasks.search("/", "   ").await.unwrap().is_empty());
    }

    #[test]
    fn match_expr_quotes_every_token() {
        assert_eq!(
            build_match_expr("one two").as_deref(),
            Some("\"one\"* \"two\"*")
        );
        assert_eq!(
            build_match_expr("say \"hi\"").as_deref(),
            Some("\"say\"* \"\"\"hi\"\"\"*")
        );
        assert_eq!(build_match_expr("  "), None);
    }
}
