//! Parquet tables in an object store

use crate::columnar;
use crate::config::{CanopyConfig, TableNaming};
use crate::dataset::Dataset;
use crate::error::{CacheError, Result};
use crate::store::{merge_tagged, SidecarMetadata, Store};
use async_trait::async_trait;
use futures::future::join_all;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Stores each key as one Parquet object under `<root>/<prefix><key><ext>`
pub struct ParquetStore {
    store: Arc<dyn ObjectStore>,
    root: String,
    naming: TableNaming,
    /// Human-readable location for log lines (e.g. `s3://bucket`)
    location: String,
}

impl ParquetStore {
    /// Wrap any object store
    pub fn new(store: Arc<dyn ObjectStore>, root: impl Into<String>, naming: TableNaming) -> Self {
        Self {
            store,
            root: root.into(),
            naming,
            location: "object-store".to_string(),
        }
    }

    /// S3 store for the configured bucket; credentials come from the AWS environment
    pub fn from_config(config: &CanopyConfig) -> Result<Self> {
        let bucket = config.object_store.bucket.as_deref().ok_or_else(|| {
            CacheError::ConfigError("CANOPY_BUCKET must be set for the object_store backend".to_string())
        })?;

        let s3 = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| CacheError::ConfigError(format!("Failed to configure S3: {}", e)))?;

        let mut store = Self::new(Arc::new(s3), config.object_store.root.clone(), config.naming.clone());
        store.location = format!("s3://{}", bucket);
        Ok(store)
    }

    fn object_path(&self, name: &str) -> Path {
        if self.root.is_empty() {
            Path::from(name)
        } else {
            Path::from(format!("{}/{}", self.root.trim_end_matches('/'), name))
        }
    }

    fn table_path(&self, key: &str) -> Path {
        self.object_path(&self.naming.table_file(key))
    }

    fn sidecar_path(&self, key: &str) -> Path {
        self.object_path(&self.naming.sidecar_file(key))
    }

    async fn fetch(&self, key: &str) -> Result<Dataset> {
        let path = self.table_path(key);
        let bytes = self.store.get(&path).await?.bytes().await?;
        columnar::from_parquet(bytes)
    }

    async fn write_sidecar(&self, key: &str, data: &Dataset) -> Result<()> {
        let path = self.sidecar_path(key);
        let body = serde_json::to_vec_pretty(&SidecarMetadata::of(data))?;
        self.store.put(&path, PutPayload::from(body)).await?;
        info!(
            store = self.name(),
            key,
            "Stored metadata to {}/{}",
            self.location,
            path
        );
        Ok(())
    }

    /// Remove a sidecar that no longer matches its table
    async fn discard_sidecar(&self, key: &str) {
        let path = self.sidecar_path(key);
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                warn!(store = self.name(), key, "Removed stale metadata at {}", path)
            }
            Err(e) => error!(
                store = self.name(),
                key,
                error = %e,
                "Failed to remove stale metadata at {}",
                path
            ),
        }
    }
}

#[async_trait]
impl Store for ParquetStore {
    fn name(&self) -> &'static str {
        "object_store"
    }

    async fn write(&self, key: &str, data: &Dataset, write_sidecar: bool) -> Result<()> {
        let path = self.table_path(key);
        let bytes = columnar::to_parquet(data)?;

        self.store.put(&path, PutPayload::from(bytes)).await?;
        info!(
            store = self.name(),
            key,
            rows = data.len(),
            "Stored cache to {}/{}",
            self.location,
            path
        );

        if write_sidecar {
            if let Err(e) = self.write_sidecar(key, data).await {
                self.discard_sidecar(key).await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Dataset {
        match self.fetch(key).await {
            Ok(data) => {
                info!(store = self.name(), key, rows = data.len(), "Retrieved cache");
                data
            }
            Err(e) => {
                warn!(store = self.name(), key, error = %e, "Error fetching from cache");
                Dataset::empty()
            }
        }
    }

    async fn read_many(&self, keys: &[String]) -> Dataset {
        let parts = join_all(keys.iter().map(|key| self.read(key))).await;
        merge_tagged(self.name(), keys, parts)
    }

    async fn columns(&self, key: &str) -> Result<Vec<String>> {
        let path = self.sidecar_path(key);
        let result = match self.store.get(&path).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(CacheError::MetadataNotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let bytes = result.bytes().await?;
        let meta: SidecarMetadata = serde_json::from_slice(&bytes)?;
        Ok(meta.columns)
    }
}
