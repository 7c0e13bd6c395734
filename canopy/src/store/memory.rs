//! In-process cache store

use crate::config::TableNaming;
use crate::dataset::Dataset;
use crate::error::{CacheError, Result};
use crate::store::{SidecarMetadata, Store};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Map of key -> dataset held for the life of the process
///
/// Sidecars are recorded in-process under the same names the durable
/// backends would use, so sidecar behavior can be observed in tests.
#[derive(Default)]
pub struct MemoryStore {
    naming: TableNaming,
    tables: RwLock<HashMap<String, Dataset>>,
    sidecars: RwLock<HashMap<String, SidecarMetadata>>,
}

impl MemoryStore {
    /// Create an empty store with the default naming convention
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with a custom naming convention
    pub fn with_naming(naming: TableNaming) -> Self {
        Self {
            naming,
            ..Default::default()
        }
    }

    /// Keys currently held
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.tables.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Sidecar recorded under its artifact name, if any
    pub async fn sidecar(&self, key: &str) -> Option<SidecarMetadata> {
        let name = self.naming.sidecar_file(key);
        self.sidecars.read().await.get(&name).cloned()
    }

    /// Number of sidecar artifacts recorded
    pub async fn sidecar_count(&self) -> usize {
        self.sidecars.read().await.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn write(&self, key: &str, data: &Dataset, write_sidecar: bool) -> Result<()> {
        info!(store = self.name(), key, rows = data.len(), "Storing cache in memory");
        self.tables
            .write()
            .await
            .insert(key.to_string(), data.clone());

        if write_sidecar {
            let name = self.naming.sidecar_file(key);
            info!(store = self.name(), key, sidecar = %name, "Recorded column metadata");
            self.sidecars
                .write()
                .await
                .insert(name, SidecarMetadata::of(data));
        }
        Ok(())
    }

    async fn read(&self, key: &str) -> Dataset {
        debug!(store = self.name(), key, "Fetching cache from memory");
        self.tables
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    async fn columns(&self, key: &str) -> Result<Vec<String>> {
        self.sidecar(key)
            .await
            .map(|meta| meta.columns)
            .ok_or_else(|| CacheError::MetadataNotFound {
                key: key.to_string(),
            })
    }
}
