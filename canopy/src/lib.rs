//! # Canopy
//!
//! Cached tabular snapshots of a remote metadata document store.
//!
//! The metadata source is slow and document-shaped; consumers want flat
//! tables. Canopy keeps one table per entity type (project names, subject
//! ids, asset basics, source data, raw-to-derived mappings) and one table per
//! subject for quality-control metrics, and refreshes them on request.
//!
//! ## Features
//!
//! - Three interchangeable stores: in-process, Parquet in an object store,
//!   and a PostgreSQL-protocol warehouse
//! - Sidecar column metadata next to every table
//! - Incremental refresh driven by per-record `_last_modified` watermarks
//! - Multi-key merge with per-row member tagging
//! - A sync orchestrator with bounded fan-out and sequential fallback
//!
//! ## Reading a cache
//!
//! ```no_run
//! use canopy::caches::{unique_subject_ids, CacheContext};
//! use canopy::source::HttpMetadataSource;
//! use canopy::store::open_store;
//! use canopy::CanopyConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CanopyConfig::from_env()?;
//!     let store = open_store(&config).await?;
//!     let source = Arc::new(HttpMetadataSource::new(config.source.clone())?);
//!     let ctx = CacheContext::new(store, source);
//!
//!     // Fails with CacheMiss until a refresh has populated the cache
//!     let ids = unique_subject_ids(&ctx, false).await?;
//!     println!("{} subjects", ids.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Synchronizing everything
//!
//! ```rust
//! use canopy::caches::CacheContext;
//! use canopy::source::StaticSource;
//! use canopy::store::MemoryStore;
//! use canopy::sync::{Registry, SyncOrchestrator};
//! use canopy::SyncConfig;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> canopy::Result<()> {
//! let ctx = CacheContext::new(Arc::new(MemoryStore::new()), Arc::new(StaticSource::default()));
//! let orchestrator = SyncOrchestrator::new(ctx, Registry::standard()?, SyncConfig::default());
//!
//! let report = orchestrator.run().await?;
//! assert_eq!(report.groups.total, 0);
//! # Ok(())
//! # }
//! ```

pub mod caches;
pub mod columnar;
pub mod config;
pub mod dataset;
pub mod encoding;
pub mod error;
pub mod incremental;
pub mod merge;
pub mod source;
pub mod store;
pub mod sync;

// Re-export main types for convenience
pub use caches::{CacheContext, EntityCache, GroupCache};
pub use config::{
    BackendKind, CanopyConfig, CanopyConfigBuilder, ObjectStoreConfig, SourceConfig, SyncConfig,
    TableNaming, WarehouseConfig,
};
pub use dataset::{Dataset, Record};
pub use encoding::{decode_column, decode_value, encode_value};
pub use error::{CacheError, Result};
pub use incremental::{IncrementalRefresh, RefreshPlan};
pub use merge::{MemberFilter, Selection};
pub use source::{HttpMetadataSource, MetadataSource, RecordQuery, StaticSource};
pub use store::{open_store, MemoryStore, ParquetStore, Store, WarehouseStore};
pub use sync::{Registry, SyncOrchestrator, SyncReport};
