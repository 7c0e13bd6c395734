//! # Cache Stores
//!
//! Pluggable key -> dataset storage with three interchangeable backends:
//!
//! - [`MemoryStore`]: in-process map, for tests and short-lived runs
//! - [`ParquetStore`]: Parquet objects in an object store (S3 in production)
//! - [`WarehouseStore`]: full-table overwrites in a relational warehouse
//!
//! ## Error policy
//!
//! Reads fail soft: a missing key, an unreachable backend or a corrupt object
//! all come back as an empty [`Dataset`] with a logged warning. Writes fail
//! hard: every write error is returned to the caller, since a silently lost
//! write leaves the cache disagreeing with its sidecar.
//!
//! A sidecar, when present, describes the last dataset successfully written
//! under its key. The warehouse replaces table and sidecar in one
//! transaction; the object store writes the table first and removes the
//! sidecar if rewriting it fails.
//!
//! ## Example
//!
//! ```rust
//! use canopy::store::{MemoryStore, Store};
//! use canopy::Dataset;
//! use serde_json::json;
//!
//! # async fn example() -> canopy::Result<()> {
//! let store = MemoryStore::new();
//! let data = Dataset::from_rows(vec!["subject_id".to_string()], vec![vec![json!("614173")]]);
//!
//! store.write("unique_subject_ids", &data, true).await?;
//! assert_eq!(store.read("unique_subject_ids").await, data);
//! assert!(store.read("never_written").await.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod naming;
pub mod object;
pub mod warehouse;

pub use memory::MemoryStore;
pub use object::ParquetStore;
pub use warehouse::{PostgresWarehouse, Warehouse, WarehouseStore};

use crate::config::{BackendKind, CanopyConfig};
use crate::dataset::Dataset;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Reserved column tagging each row of a multi-key read with its key
pub const MEMBER_COLUMN: &str = "asset_name";

/// Schema record written alongside a stored dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarMetadata {
    pub columns: Vec<String>,
}

impl SidecarMetadata {
    /// Sidecar describing a dataset
    pub fn of(data: &Dataset) -> Self {
        Self {
            columns: data.columns().to_vec(),
        }
    }
}

/// Key -> dataset cache backend
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name used in log fields
    fn name(&self) -> &'static str;

    /// Replace the dataset under `key`, optionally rewriting its sidecar
    ///
    /// On error the sidecar is either left describing the previous dataset
    /// together with the previous table, or removed. It never describes a
    /// dataset other than the one stored beside it.
    async fn write(&self, key: &str, data: &Dataset, write_sidecar: bool) -> Result<()>;

    /// Dataset under `key`; empty on a miss or any backend failure
    async fn read(&self, key: &str) -> Dataset;

    /// Union of several keys, each row tagged with its key in [`MEMBER_COLUMN`]
    ///
    /// Keys that resolve to nothing are skipped. Rows follow key order, then
    /// stored order within a key.
    async fn read_many(&self, keys: &[String]) -> Dataset {
        let mut parts = Vec::with_capacity(keys.len());
        for key in keys {
            parts.push(self.read(key).await);
        }
        merge_tagged(self.name(), keys, parts)
    }

    /// Column names recorded in the sidecar for `key`
    async fn columns(&self, key: &str) -> Result<Vec<String>>;
}

/// Tag and concatenate per-key reads
pub(crate) fn merge_tagged(store: &str, keys: &[String], parts: Vec<Dataset>) -> Dataset {
    let tagged: Vec<Dataset> = keys
        .iter()
        .zip(parts)
        .filter(|(_, part)| !part.is_empty())
        .map(|(key, part)| part.with_column(MEMBER_COLUMN, Value::String(key.clone())))
        .collect();

    if tagged.is_empty() {
        warn!(store, keys = ?keys, "No cached data found among requested tables");
        return Dataset::empty();
    }

    let count = tagged.len();
    let merged = Dataset::concat(tagged);
    info!(store, tables = count, rows = merged.len(), "Merged cached tables");
    merged
}

/// Build the store selected by configuration
pub async fn open_store(config: &CanopyConfig) -> Result<Arc<dyn Store>> {
    config.validate()?;
    info!(backend = %config.backend, "Opening cache store");

    let store: Arc<dyn Store> = match config.backend {
        BackendKind::Memory => Arc::new(MemoryStore::with_naming(config.naming.clone())),
        BackendKind::ObjectStore => Arc::new(ParquetStore::from_config(config)?),
        BackendKind::Warehouse => {
            let warehouse = PostgresWarehouse::connect(&config.warehouse)?;
            Arc::new(WarehouseStore::new(Arc::new(warehouse), config.naming.clone()))
        }
    };
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_store() {
        let store = open_store(&CanopyConfig::default()).await.unwrap();
        assert_eq!(store.name(), "memory");
        assert!(store.read("anything").await.is_empty());
    }

    #[tokio::test]
    async fn test_open_object_store_without_bucket_fails() {
        let config = CanopyConfig::builder()
            .backend(BackendKind::ObjectStore)
            .build();
        assert!(open_store(&config).await.is_err());
    }

    #[test]
    fn test_sidecar_of() {
        let data = Dataset::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(SidecarMetadata::of(&data).columns, vec!["a", "b"]);
    }
}
