//! S3-compatible cache store.
//!
//! URL shape: `s3://bucket?endpoint=http://minio:9000&region=us-east-1`.
//! Credentials come from the ambient environment.

use async_trait::async_trait;
use conveyor_core::{Error, Result, TarStream};
use opendal::{ErrorKind, Operator, services::S3};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::compat::{FuturesAsyncReadCompatExt, FuturesAsyncWriteCompatExt};
use url::Url;

pub struct S3Store {
    op: Operator,
}

pub fn from_url(url: &Url) -> Result<Arc<dyn super::CacheStore>> {
    let bucket = url
        .host_str()
        .ok_or_else(|| Error::Validation(format!("cache store URL {url} has no bucket")))?;

    let mut builder = S3::default().bucket(bucket);
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "endpoint" => builder = builder.endpoint(&value),
            "region" => builder = builder.region(&value),
            _ => {}
        }
    }

    let op = Operator::new(builder)
        .map_err(|e| Error::Validation(format!("cache store config: {e}")))?
        .finish();

    Ok(Arc::new(S3Store { op }))
}

fn map_err(context: &str, err: opendal::Error) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::NotFound(context.to_string())
    } else {
        Error::Transient(format!("{context}: {err}"))
    }
}

#[async_trait]
impl super::CacheStore for S3Store {
    async fn restore(&self, key: &str) -> Result<TarStream> {
        let meta = self
            .op
            .stat(key)
            .await
            .map_err(|e| map_err(key, e))?;
        let reader = self
            .op
            .reader(key)
            .await
            .map_err(|e| map_err(key, e))?
            .into_futures_async_read(0..meta.content_length())
            .await
            .map_err(|e| map_err(key, e))?;
        Ok(Box::new(reader.compat()))
    }

    async fn persist(&self, key: &str, mut data: TarStream) -> Result<()> {
        // Upload under a temporary key, then rename, so a partial upload is
        // never observable at the real key.
        let tmp_key = format!("{key}.uploading");

        let writer = self
            .op
            .writer(&tmp_key)
            .await
            .map_err(|e| map_err(&tmp_key, e))?;
        let mut writer = writer.into_futures_async_write().compat_write();

        tokio::io::copy(&mut data, &mut writer)
            .await
            .map_err(|e| Error::Transient(format!("uploading {tmp_key}: {e}")))?;
        writer
            .shutdown()
            .await
            .map_err(|e| Error::Transient(format!("finishing {tmp_key}: {e}")))?;

        self.op
            .rename(&tmp_key, key)
            .await
            .map_err(|e| map_err(key, e))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.op
            .exists(key)
            .await
            .map_err(|e| map_err(key, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.op.delete(key).await.map_err(|e| map_err(key, e))
    }
}
