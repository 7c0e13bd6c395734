//! # Entity Caches
//!
//! One cache per entity type. Each owns a key (or a key family), knows how to
//! fetch and flatten its records from the [`MetadataSource`], and writes the
//! result through the configured [`Store`].
//!
//! All of them follow the same fetch-or-refresh contract:
//!
//! - `force_update = false`: return the cached dataset, or
//!   [`CacheError::CacheMiss`] when nothing is cached
//! - `force_update = true`: fetch, write (with sidecar) and return fresh data
//!
//! The per-subject QC family is the exception: it is a [`GroupCache`], and an
//! empty group without a refresh request yields an empty result with a logged
//! error instead of failing.

pub mod asset_basics;
pub mod distinct;
pub mod qc;
pub mod raw_to_derived;
pub mod source_data;

pub use asset_basics::{asset_basics, asset_basics_columns, AssetBasics};
pub use distinct::{
    unique_project_names, unique_project_names_columns, unique_subject_ids,
    unique_subject_ids_columns, DistinctValues,
};
pub use qc::{qc, qc_columns, QualityControl};
pub use raw_to_derived::{raw_to_derived, raw_to_derived_columns, RawToDerived};
pub use source_data::{source_data, source_data_columns, SourceData};

use crate::dataset::{Dataset, Record};
use crate::error::{CacheError, Result};
use crate::source::MetadataSource;
use crate::store::Store;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub const UNIQUE_PROJECT_NAMES: &str = "unique_project_names";
pub const UNIQUE_SUBJECT_IDS: &str = "unique_subject_ids";
pub const ASSET_BASICS: &str = "asset_basics";
pub const SOURCE_DATA: &str = "source_data";
pub const RAW_TO_DERIVED: &str = "raw_to_derived";
pub const QC_FAMILY: &str = "qc";

/// Store and source shared by every cache operation
#[derive(Clone)]
pub struct CacheContext {
    pub store: Arc<dyn Store>,
    pub source: Arc<dyn MetadataSource>,
}

impl CacheContext {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn MetadataSource>) -> Self {
        Self { store, source }
    }
}

/// A cache owning a single key
#[async_trait]
pub trait EntityCache: Send + Sync {
    /// Cache key, also used as the registry name
    fn name(&self) -> &'static str;

    /// Fetch from the source, write with sidecar, return the new snapshot
    async fn refresh(&self, ctx: &CacheContext) -> Result<Dataset>;

    /// Fetch-or-refresh
    async fn load(&self, ctx: &CacheContext, force_update: bool) -> Result<Dataset> {
        if force_update {
            return self.refresh(ctx).await;
        }

        let cached = ctx.store.read(self.name()).await;
        if cached.is_empty() {
            return Err(CacheError::CacheMiss {
                key: self.name().to_string(),
            });
        }
        debug!(cache = self.name(), rows = cached.len(), "Serving from cache");
        Ok(cached)
    }
}

/// A cache holding one table per group member (`<family>/<group>`)
#[async_trait]
pub trait GroupCache: Send + Sync {
    /// Key family, also used as the registry name
    fn family(&self) -> &'static str;

    /// Key of one group's table
    fn key(&self, group: &str) -> String {
        format!("{}/{}", self.family(), group)
    }

    /// Fetch and write one group's table
    ///
    /// `None` means the group had nothing to cache and no table (or sidecar)
    /// was written.
    async fn refresh_group(
        &self,
        ctx: &CacheContext,
        group: &str,
        write_sidecar: bool,
    ) -> Result<Option<Dataset>>;
}

/// Documents that are JSON objects, as records
pub(crate) fn into_records(documents: Vec<Value>) -> impl Iterator<Item = Record> {
    documents.into_iter().filter_map(|doc| match doc {
        Value::Object(map) => Some(map),
        _ => None,
    })
}

/// Records laid out on a fixed column template
pub(crate) fn tabulate<I>(columns: &[&str], records: I) -> Dataset
where
    I: IntoIterator<Item = Record>,
{
    let mut data = Dataset::new(columns.iter().map(|c| c.to_string()).collect());
    for record in records {
        data.push_record(record);
    }
    data
}

/// Comma-joined string items of a list value
pub(crate) fn join_strings(value: Option<&Value>) -> String {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EntityCache for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn refresh(&self, ctx: &CacheContext) -> Result<Dataset> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let data = Dataset::from_rows(vec!["n".to_string()], vec![vec![json!(1)]]);
            ctx.store.write(self.name(), &data, true).await?;
            Ok(data)
        }
    }

    fn ctx() -> CacheContext {
        CacheContext::new(Arc::new(MemoryStore::new()), Arc::new(StaticSource::default()))
    }

    #[tokio::test]
    async fn test_load_miss_names_remedy() {
        let cache = Counting { calls: AtomicUsize::new(0) };
        let err = cache.load(&ctx(), false).await.unwrap_err();
        assert!(matches!(err, CacheError::CacheMiss { .. }));
        assert!(err.to_string().contains("force_update"));
        assert_eq!(cache.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_load_serves_cache_after_refresh() {
        let ctx = ctx();
        let cache = Counting { calls: AtomicUsize::new(0) };

        cache.load(&ctx, true).await.unwrap();
        let again = cache.load(&ctx, false).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(cache.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_strings() {
        assert_eq!(join_strings(Some(&json!(["a", "b"]))), "a, b");
        assert_eq!(join_strings(Some(&json!([]))), "");
        assert_eq!(join_strings(None), "");
    }

    #[test]
    fn test_tabulate_keeps_template_order() {
        let data = tabulate(&["b", "a"], into_records(vec![json!({"a": 1, "b": 2}), json!(3)]));
        assert_eq!(data.columns(), &["b".to_string(), "a".to_string()]);
        assert_eq!(data.len(), 1);
    }
}
