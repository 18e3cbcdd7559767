//! Tar packing for directory-backed volumes.

use conveyor_core::{Error, Result, TarStream};
use std::path::Path;
use tokio_util::io::SyncIoBridge;
use tracing::warn;

/// Unpack a tar stream into `dir`.
pub async fn unpack_into(dir: &Path, data: TarStream) -> Result<()> {
    let dir = dir.to_path_buf();
    let bridge = SyncIoBridge::new(data);
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut archive = tar::Archive::new(bridge);
        archive
            .unpack(&dir)
            .map_err(|e| Error::Transient(format!("unpacking into volume: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("unpack task: {e}")))?
}

/// Stream `dir`'s contents as a tar archive rooted at `.`.
pub fn pack_dir(dir: &Path) -> TarStream {
    let dir = dir.to_path_buf();
    let (reader, writer) = tokio::io::duplex(64 * 1024);
    let bridge = SyncIoBridge::new(writer);
    tokio::task::spawn_blocking(move || {
        let mut builder = tar::Builder::new(bridge);
        let result = builder
            .append_dir_all(".", &dir)
            .and_then(|_| builder.into_inner().map(drop));
        if let Err(e) = result {
            warn!(error = %e, "packing volume archive failed");
        }
    });
    Box::new(reader)
}
