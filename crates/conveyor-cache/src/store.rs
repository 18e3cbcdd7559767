//! Object-store contract for cached volume archives.

use async_trait::async_trait;
use conveyor_core::{Error, Result, TarStream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use url::Url;

/// Where volume archives live. Keys map to whole objects; an object is
/// either fully present or absent, never half-written.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Stream the object at `key`. `NotFound` when absent.
    async fn restore(&self, key: &str) -> Result<TarStream>;

    /// Upload the stream as the object at `key`, atomically.
    async fn persist(&self, key: &str, data: TarStream) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}

type StoreFactory = fn(&Url) -> Result<Arc<dyn CacheStore>>;

/// Scheme-keyed registry of cache-store factories.
pub struct StoreRegistry {
    factories: HashMap<&'static str, StoreFactory>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, scheme: &'static str, factory: StoreFactory) {
        self.factories.insert(scheme, factory);
    }

    /// Construct the store for a `scheme://...` URL.
    pub fn open(&self, url: &str) -> Result<Arc<dyn CacheStore>> {
        let parsed = Url::parse(url)
            .map_err(|e| Error::Validation(format!("invalid cache store URL {url:?}: {e}")))?;
        let factory = self
            .factories
            .get(parsed.scheme())
            .ok_or_else(|| {
                Error::Validation(format!("unknown cache store scheme {:?}", parsed.scheme()))
            })?;
        factory(&parsed)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("s3", crate::s3::from_url);
        registry.register("memory", |_| Ok(Arc::new(MemoryStore::default()) as _));
        registry
    }
}

/// In-memory store, used by tests and as a scratch backend.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn restore(&self, key: &str) -> Result<TarStream> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("cache object {key}")))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn persist(&self, key: &str, mut data: TarStream) -> Result<()> {
        use tokio::io::AsyncReadExt;
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer)
            .await
            .map_err(|e| Error::Transient(format!("reading cache upload: {e}")))?;
        // Buffered fully before the map insert, so the object appears
        // all-at-once.
        self.objects.lock().unwrap().insert(key.to_string(), buffer);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryStore::default();
        store
            .persist("k", Box::new(std::io::Cursor::new(b"bytes".to_vec())))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        let mut out = Vec::new();
        store.restore("k").await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bytes");

        store.delete("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
        assert!(store.restore("k").await.is_err());
    }

    #[test]
    fn registry_rejects_unknown_schemes() {
        let registry = StoreRegistry::default();
        assert!(registry.open("memory://x").is_ok());
        assert!(registry.open("ftp://host/bucket").is_err());
        assert!(registry.open("not a url").is_err());
    }
}
