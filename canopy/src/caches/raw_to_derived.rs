//! Raw asset -> derived assets built from it

use crate::caches::{tabulate, CacheContext, EntityCache, RAW_TO_DERIVED};
use crate::dataset::{Dataset, Record};
use crate::error::Result;
use crate::source::{lookup_path, RecordQuery};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info};

pub const COLUMNS: &[&str] = &["name", "derived_records"];

/// Maps every raw asset name to the comma-joined names of derived assets
/// listing it as source data
#[derive(Debug, Clone, Copy, Default)]
pub struct RawToDerived;

#[async_trait]
impl EntityCache for RawToDerived {
    fn name(&self) -> &'static str {
        RAW_TO_DERIVED
    }

    async fn refresh(&self, ctx: &CacheContext) -> Result<Dataset> {
        info!(cache = self.name(), "Updating cache");

        let raw = ctx
            .source
            .retrieve(
                &RecordQuery::all()
                    .filter(json!({"data_description.data_level": "raw"}))
                    .project(["name"]),
            )
            .await?;

        // raw name -> position, in source order
        let mut order: Vec<(String, Vec<String>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for name in raw.iter().filter_map(|doc| doc.get("name").and_then(Value::as_str)) {
            if !index.contains_key(name) {
                index.insert(name.to_string(), order.len());
                order.push((name.to_string(), Vec::new()));
            }
        }

        let derived = ctx
            .source
            .retrieve(
                &RecordQuery::all()
                    .filter(json!({"data_description.data_level": "derived"}))
                    .project(["name", "data_description.source_data"]),
            )
            .await?;

        for doc in &derived {
            let Some(derived_name) = doc.get("name").and_then(Value::as_str) else {
                continue;
            };
            let sources = lookup_path(doc, "data_description.source_data")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str);
            for source in sources {
                if let Some(&pos) = index.get(source) {
                    order[pos].1.push(derived_name.to_string());
                }
            }
        }

        let rows = order.into_iter().map(|(name, derived)| {
            let joined = derived.join(", ");
            debug!(cache = RAW_TO_DERIVED, raw = %name, derived = %joined, "Processed raw record");
            let mut row = Record::new();
            row.insert("name".to_string(), Value::String(name));
            row.insert("derived_records".to_string(), Value::String(joined));
            row
        });

        let data = tabulate(COLUMNS, rows);
        ctx.store.write(self.name(), &data, true).await?;
        Ok(data)
    }
}

pub async fn raw_to_derived(ctx: &CacheContext, force_update: bool) -> Result<Dataset> {
    RawToDerived.load(ctx, force_update).await
}

pub async fn raw_to_derived_columns(ctx: &CacheContext) -> Result<Vec<String>> {
    ctx.store.columns(RAW_TO_DERIVED).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_maps_raw_to_derived_names() {
        let source = StaticSource::new(vec![
            json!({"_id": "1", "name": "raw_a", "data_description": {"data_level": "raw"}}),
            json!({"_id": "2", "name": "raw_b", "data_description": {"data_level": "raw"}}),
            json!({"_id": "3", "name": "sorted_a", "data_description": {"data_level": "derived", "source_data": ["raw_a"]}}),
            json!({"_id": "4", "name": "curated_a", "data_description": {"data_level": "derived", "source_data": ["raw_a", "unknown"]}}),
        ]);
        let ctx = CacheContext::new(Arc::new(MemoryStore::new()), Arc::new(source));

        let data = raw_to_derived(&ctx, true).await.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data.value(0, "name"), Some(&json!("raw_a")));
        assert_eq!(data.value(0, "derived_records"), Some(&json!("sorted_a, curated_a")));
        assert_eq!(data.value(1, "derived_records"), Some(&json!("")));
    }
}
