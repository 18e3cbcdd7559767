//! The caching driver decorator.
//!
//! Wraps a driver that exposes volume-data access and turns every named
//! volume into a content-streamed object in the cache store: restored
//! eagerly on create, persisted on cleanup. Cache failures are logged and
//! swallowed; they must never break volume creation or cleanup.

use async_trait::async_trait;
use conveyor_core::{
    ContainerHandle, Driver, Result, TaskSpec, VolumeDataAccessor, VolumeHandle,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

use crate::compression::Compression;
use crate::store::CacheStore;

pub struct CachedDriver {
    inner: Arc<dyn Driver>,
    store: Arc<dyn CacheStore>,
    compression: Compression,
    prefix: String,
    volumes: Mutex<HashMap<String, Arc<CachedVolume>>>,
}

impl CachedDriver {
    /// The caller must have checked that `inner.volume_data()` is present.
    pub fn new(
        inner: Arc<dyn Driver>,
        store: Arc<dyn CacheStore>,
        compression: Compression,
        prefix: String,
    ) -> Self {
        Self {
            inner,
            store,
            compression,
            prefix,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    fn object_name(&self, volume: &str) -> String {
        let key = if self.prefix.is_empty() {
            volume.to_string()
        } else {
            format!("{}/{}", self.prefix, volume)
        };
        format!("{key}.{}", self.compression.extension())
    }
}

#[async_trait]
impl Driver for CachedDriver {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create_volume(&self, name: &str, size_hint_gb: u32) -> Result<Arc<dyn VolumeHandle>> {
        let mut volumes = self.volumes.lock().await;
        if let Some(existing) = volumes.get(name) {
            return Ok(existing.clone() as Arc<dyn VolumeHandle>);
        }

        let inner = self.inner.create_volume(name, size_hint_gb).await?;
        let volume = Arc::new(CachedVolume {
            inner,
            driver: self.inner.clone(),
            store: self.store.clone(),
            compression: self.compression,
            object: self.object_name(name),
            restored: OnceCell::new(),
        });
        volumes.insert(name.to_string(), volume.clone());
        drop(volumes);

        volume.restore_from_cache().await;
        Ok(volume as Arc<dyn VolumeHandle>)
    }

    async fn run_container(&self, task: TaskSpec) -> Result<Arc<dyn ContainerHandle>> {
        self.inner.run_container(task).await
    }

    async fn get_container(&self, id: &str) -> Result<Arc<dyn ContainerHandle>> {
        self.inner.get_container(id).await
    }

    fn volume_data(&self) -> Option<&dyn VolumeDataAccessor> {
        self.inner.volume_data()
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub struct CachedVolume {
    inner: Arc<dyn VolumeHandle>,
    driver: Arc<dyn Driver>,
    store: Arc<dyn CacheStore>,
    compression: Compression,
    object: String,
    restored: OnceCell<()>,
}

impl CachedVolume {
    /// Eagerly restore the volume's contents from the cache. Runs at most
    /// once per volume handle; errors are logged and swallowed.
    pub async fn restore_from_cache(&self) {
        self.restored
            .get_or_init(|| async {
                if let Err(e) = self.try_restore().await {
                    warn!(volume = %self.inner.name(), object = %self.object, error = %e, "cache restore failed");
                }
            })
            .await;
    }

    async fn try_restore(&self) -> Result<()> {
        let Some(accessor) = self.driver.volume_data() else {
            return Ok(());
        };

        if !self.store.exists(&self.object).await? {
            debug!(object = %self.object, "cache miss");
            return Ok(());
        }

        let compressed = self.store.restore(&self.object).await?;
        let tar = self.compression.decompress(compressed);
        accessor.copy_to_volume(self.inner.name(), tar).await?;
        debug!(volume = %self.inner.name(), object = %self.object, "restored volume from cache");
        Ok(())
    }

    async fn try_persist(&self) -> Result<()> {
        let Some(accessor) = self.driver.volume_data() else {
            return Ok(());
        };
        let tar = accessor.copy_from_volume(self.inner.name()).await?;
        let compressed = self.compression.compress(tar);
        self.store.persist(&self.object, compressed).await?;
        debug!(volume = %self.inner.name(), object = %self.object, "persisted volume to cache");
        Ok(())
    }
}

#[async_trait]
impl VolumeHandle for CachedVolume {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn path(&self) -> &str {
        self.inner.path()
    }

    async fn cleanup(&self) -> Result<()> {
        if let Err(e) = self.try_persist().await {
            warn!(volume = %self.inner.name(), object = %self.object, error = %e, "cache persist failed");
        }
        self.inner.cleanup().await
    }
}
