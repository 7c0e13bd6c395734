//! Upstream source data of every asset

use crate::caches::{join_strings, tabulate, CacheContext, EntityCache, SOURCE_DATA};
use crate::dataset::{Dataset, Record};
use crate::error::Result;
use crate::source::{lookup_path, RecordQuery};
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

pub const COLUMNS: &[&str] = &["_id", "source_data"];

/// `_id` -> comma-joined upstream asset names
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceData;

#[async_trait]
impl EntityCache for SourceData {
    fn name(&self) -> &'static str {
        SOURCE_DATA
    }

    async fn refresh(&self, ctx: &CacheContext) -> Result<Dataset> {
        info!(cache = self.name(), "Updating cache");
        let query = RecordQuery::all().project(["_id", "data_description.source_data"]);
        let records = ctx.source.retrieve(&query).await?;

        let rows = records.iter().map(|doc| {
            let mut row = Record::new();
            row.insert("_id".to_string(), doc.get("_id").cloned().unwrap_or(Value::Null));
            row.insert(
                "source_data".to_string(),
                Value::String(join_strings(lookup_path(doc, "data_description.source_data"))),
            );
            row
        });

        let data = tabulate(COLUMNS, rows);
        ctx.store.write(self.name(), &data, true).await?;
        Ok(data)
    }
}

pub async fn source_data(ctx: &CacheContext, force_update: bool) -> Result<Dataset> {
    SourceData.load(ctx, force_update).await
}

pub async fn source_data_columns(ctx: &CacheContext) -> Result<Vec<String>> {
    ctx.store.columns(SOURCE_DATA).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_source_data_joins_upstream() {
        let source = StaticSource::new(vec![
            json!({"_id": "d1", "data_description": {"source_data": ["raw_a", "raw_b"]}}),
            json!({"_id": "r1", "data_description": {}}),
        ]);
        let ctx = CacheContext::new(Arc::new(MemoryStore::new()), Arc::new(source));

        let data = source_data(&ctx, true).await.unwrap();
        assert_eq!(data.columns(), &["_id".to_string(), "source_data".to_string()]);
        assert_eq!(data.value(0, "source_data"), Some(&json!("raw_a, raw_b")));
        assert_eq!(data.value(1, "source_data"), Some(&json!("")));

        assert_eq!(source_data(&ctx, false).await.unwrap(), data);
        assert_eq!(source_data_columns(&ctx).await.unwrap(), vec!["_id", "source_data"]);
    }
}
