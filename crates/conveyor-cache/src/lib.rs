//! Transparent volume caching for Conveyor drivers.
//!
//! Configured entirely through driver DSN parameters (`cache`,
//! `cache_compression`, `cache_prefix`). Wrapping only engages when the
//! underlying driver exposes volume-data access.

pub mod compression;
pub mod driver;
pub mod s3;
pub mod store;

pub use compression::Compression;
pub use driver::CachedDriver;
pub use store::{CacheStore, MemoryStore, StoreRegistry};

use conveyor_core::{Driver, Dsn, Result};
use std::sync::Arc;
use tracing::warn;

/// Cache parameters extracted from a driver DSN.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub store_url: String,
    pub compression: Compression,
    pub prefix: String,
}

impl CacheConfig {
    /// `Ok(None)` when the DSN carries no `cache` parameter.
    pub fn from_dsn(dsn: &Dsn) -> Result<Option<Self>> {
        let Some(store_url) = dsn.param("cache") else {
            return Ok(None);
        };
        Ok(Some(Self {
            store_url: store_url.to_string(),
            compression: Compression::from_param(dsn.param("cache_compression"))?,
            prefix: dsn.param("cache_prefix").unwrap_or_default().to_string(),
        }))
    }
}

/// Wrap `driver` with the caching layer when the DSN asks for it.
///
/// Drivers without volume-data access pass through unchanged with a
/// warning. Bad cache parameters are a validation error.
pub fn wrap_driver(driver: Arc<dyn Driver>, dsn: &Dsn) -> Result<Arc<dyn Driver>> {
    wrap_driver_with(driver, dsn, &StoreRegistry::default())
}

pub fn wrap_driver_with(
    driver: Arc<dyn Driver>,
    dsn: &Dsn,
    registry: &StoreRegistry,
) -> Result<Arc<dyn Driver>> {
    let Some(config) = CacheConfig::from_dsn(dsn)? else {
        return Ok(driver);
    };

    if driver.volume_data().is_none() {
        warn!(driver = %driver.name(), "driver does not support volume data access, caching disabled");
        return Ok(driver);
    }

    let store = registry.open(&config.store_url)?;
    Ok(Arc::new(CachedDriver::new(
        driver,
        store,
        config.compression,
        config.prefix,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_core::{
        ContainerHandle, Error, TarStream, TaskSpec, VolumeDataAccessor, VolumeHandle,
    };
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    /// Driver whose volumes are plain byte buffers; the "tar stream" is the
    /// buffer itself.
    #[derive(Default)]
    struct MemDriver {
        volumes: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemDriver {
        fn put(&self, name: &str, data: &[u8]) {
            self.volumes.lock().unwrap().insert(name.to_string(), data.to_vec());
        }

        fn contents(&self, name: &str) -> Option<Vec<u8>> {
            self.volumes.lock().unwrap().get(name).cloned()
        }
    }

    struct MemVolume {
        name: String,
    }

    #[async_trait]
    impl VolumeHandle for MemVolume {
        fn name(&self) -> &str {
            &self.name
        }

        fn path(&self) -> &str {
            &self.name
        }

        async fn cleanup(&self) -> conveyor_core::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Driver for MemDriver {
        fn name(&self) -> &str {
            "mem"
        }

        async fn create_volume(
            &self,
            name: &str,
            _size_hint_gb: u32,
        ) -> conveyor_core::Result<Arc<dyn VolumeHandle>> {
            self.volumes
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default();
            Ok(Arc::new(MemVolume {
                name: name.to_string(),
            }))
        }

        async fn run_container(
            &self,
            _task: TaskSpec,
        ) -> conveyor_core::Result<Arc<dyn ContainerHandle>> {
            Err(Error::Internal("not needed".into()))
        }

        async fn get_container(&self, id: &str) -> conveyor_core::Result<Arc<dyn ContainerHandle>> {
            Err(Error::NotFound(id.to_string()))
        }

        fn volume_data(&self) -> Option<&dyn VolumeDataAccessor> {
            Some(self)
        }

        async fn close(&self) -> conveyor_core::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl VolumeDataAccessor for MemDriver {
        async fn copy_to_volume(&self, name: &str, mut data: TarStream) -> conveyor_core::Result<()> {
            let mut buffer = Vec::new();
            data.read_to_end(&mut buffer).await?;
            self.volumes.lock().unwrap().insert(name.to_string(), buffer);
            Ok(())
        }

        async fn copy_from_volume(&self, name: &str) -> conveyor_core::Result<TarStream> {
            let data = self
                .contents(name)
                .ok_or_else(|| Error::NotFound(name.to_string()))?;
            Ok(Box::new(std::io::Cursor::new(data)))
        }
    }

    /// Store wrapper that counts calls, for the restore-skip property.
    struct CountingStore {
        inner: MemoryStore,
        exists_calls: AtomicUsize,
        restore_calls: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::default(),
                exists_calls: AtomicUsize::new(0),
                restore_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CacheStore for CountingStore {
        async fn restore(&self, key: &str) -> conveyor_core::Result<TarStream> {
            self.restore_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.restore(key).await
        }

        async fn persist(&self, key: &str, data: TarStream) -> conveyor_core::Result<()> {
            self.inner.persist(key, data).await
        }

        async fn exists(&self, key: &str) -> conveyor_core::Result<bool> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.exists(key).await
        }

        async fn delete(&self, key: &str) -> conveyor_core::Result<()> {
            self.inner.delete(key).await
        }
    }

    fn cached(
        driver: Arc<MemDriver>,
        store: Arc<dyn CacheStore>,
        compression: Compression,
        prefix: &str,
    ) -> CachedDriver {
        CachedDriver::new(driver, store, compression, prefix.to_string())
    }

    #[tokio::test]
    async fn cleanup_persists_and_create_restores_on_a_fresh_driver() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::default());

        // First driver instance: write contents, cleanup persists them.
        let first = Arc::new(MemDriver::default());
        let wrapper = cached(first.clone(), store.clone(), Compression::default(), "");
        let volume = wrapper.create_volume("v", 1).await.unwrap();
        first.put("v", b"file contents");
        volume.cleanup().await.unwrap();

        // Fresh driver instance with the same cache config sees the bytes.
        let second = Arc::new(MemDriver::default());
        let wrapper = cached(second.clone(), store, Compression::default(), "");
        wrapper.create_volume("v", 1).await.unwrap();
        assert_eq!(second.contents("v").unwrap(), b"file contents");
    }

    #[tokio::test]
    async fn no_compression_stores_the_raw_stream() {
        let memory = Arc::new(MemoryStore::default());
        let store: Arc<dyn CacheStore> = memory.clone();

        let driver = Arc::new(MemDriver::default());
        let wrapper = cached(driver.clone(), store, Compression::None, "");
        let volume = wrapper.create_volume("v", 1).await.unwrap();
        driver.put("v", b"exact bytes");
        volume.cleanup().await.unwrap();

        assert_eq!(memory.object("v.tar").unwrap(), b"exact bytes");
    }

    #[tokio::test]
    async fn prefix_shapes_the_object_name() {
        let memory = Arc::new(MemoryStore::default());
        let driver = Arc::new(MemDriver::default());
        let wrapper = cached(driver.clone(), memory.clone(), Compression::None, "team-a");
        let volume = wrapper.create_volume("deps", 1).await.unwrap();
        volume.cleanup().await.unwrap();

        assert_eq!(memory.keys(), vec!["team-a/deps.tar".to_string()]);
    }

    #[tokio::test]
    async fn restore_skips_on_cache_miss() {
        let store = Arc::new(CountingStore::new());
        let driver = Arc::new(MemDriver::default());
        let wrapper = cached(driver, store.clone(), Compression::default(), "");

        wrapper.create_volume("v", 1).await.unwrap();
        assert_eq!(store.exists_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.restore_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn restore_latch_prevents_reexecution() {
        let store = Arc::new(CountingStore::new());
        let driver = Arc::new(MemDriver::default());
        let wrapper = cached(driver, store.clone(), Compression::default(), "");

        // Same name twice: one handle, one restore attempt.
        let v1 = wrapper.create_volume("v", 1).await.unwrap();
        let v2 = wrapper.create_volume("v", 1).await.unwrap();
        assert_eq!(v1.name(), v2.name());
        assert_eq!(store.exists_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrap_is_identity_without_cache_param() {
        let dsn = Dsn::parse("docker://ns").unwrap();
        let driver: Arc<dyn Driver> = Arc::new(MemDriver::default());
        let wrapped = wrap_driver(driver.clone(), &dsn).unwrap();
        assert!(Arc::ptr_eq(&driver, &wrapped));
    }

    #[tokio::test]
    async fn wrap_rejects_bad_compression() {
        let dsn = Dsn::parse("docker://ns?cache=memory://&cache_compression=bogus").unwrap();
        let driver: Arc<dyn Driver> = Arc::new(MemDriver::default());
        assert!(wrap_driver(driver, &dsn).is_err());
    }

    #[tokio::test]
    async fn compressed_round_trip_through_the_store() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::default());
        let data = b"a larger payload ".repeat(200);

        let first = Arc::new(MemDriver::default());
        let wrapper = cached(first.clone(), store.clone(), Compression::Gzip, "");
        let volume = wrapper.create_volume("v", 1).await.unwrap();
        first.put("v", &data);
        volume.cleanup().await.unwrap();

        let second = Arc::new(MemDriver::default());
        let wrapper = cached(second.clone(), store, Compression::Gzip, "");
        wrapper.create_volume("v", 1).await.unwrap();
        assert_eq!(second.contents("v").unwrap(), data);
    }
}
