//! Persistence layer for Conveyor CI.
//!
//! One SQLite database holds pipelines, runs, resource-version history, and
//! the append/patch task store with its full-text index. Writes go through a
//! single-connection writer pool; reads use a separate read-only pool.

pub mod ansi;
pub mod error;
pub mod pagination;
pub mod pipelines;
pub mod resources;
pub mod runs;
pub mod tasks;
pub mod tree;

pub use error::{StoreError, StoreResult};
pub use pagination::Page;
pub use pipelines::{NewPipeline, PipelineRecord};
pub use resources::ResourceVersionRecord;
pub use runs::{RunRecord, RunStatus};
pub use tasks::{ResultRow, TaskStore};
pub use tree::Node;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Handle to the backing database: one writer connection, a pool of readers.
#[derive(Clone)]
pub struct Store {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Store {
    /// Open (creating if missing) a file-backed store and run migrations.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options.read_only(true).create_if_missing(false))
            .await?;

        sqlx::migrate!("./migrations").run(&writer).await?;

        Ok(Self { writer, reader })
    }

    /// Open an in-memory store. Reads and writes share the single
    /// connection, which keeps the writer discipline trivially intact.
    /// The connection is pinned: an in-memory database dies with it.
    pub async fn in_memory() -> StoreResult<Self> {
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;

        sqlx::migrate!("./migrations").run(&writer).await?;

        Ok(Self {
            reader: writer.clone(),
            writer,
        })
    }

    /// A namespaced view of the task store.
    pub fn tasks(&self, namespace: &str) -> TaskStore {
        TaskStore::new(self.clone(), namespace)
    }

    pub(crate) fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    pub(crate) fn reader(&self) -> &SqlitePool {
        &self.reader
    }
}
