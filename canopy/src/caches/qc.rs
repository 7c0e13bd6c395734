//! Quality-control metrics, one table per subject
//!
//! Every metric of every asset of a subject becomes one row. Metric fields
//! are tagged-encoded (see [`crate::encoding`]) so heterogeneous values such
//! as status histories fit one text column; decode them with
//! [`crate::encoding::decode_column`].

use crate::caches::{CacheContext, GroupCache, QC_FAMILY};
use crate::dataset::{Dataset, Record};
use crate::encoding::encode_value;
use crate::error::Result;
use crate::merge::{select_members, MemberFilter, Selection};
use crate::source::RecordQuery;
use crate::store::MEMBER_COLUMN;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, info, warn};

/// Per-subject QC cache (`qc/<subject_id>`)
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityControl;

/// Encoded metric rows of one asset document
fn metric_rows(doc: &Value) -> Vec<Record> {
    let asset_name = doc
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let Some(metrics) = doc
        .get("quality_control")
        .and_then(|qc| qc.get("metrics"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    metrics
        .iter()
        .filter_map(Value::as_object)
        .map(|metric| {
            let mut row: Record = metric
                .iter()
                .map(|(k, v)| (k.clone(), encode_value(v.clone())))
                .collect();
            row.insert(MEMBER_COLUMN.to_string(), Value::String(asset_name.clone()));
            row
        })
        .collect()
}

#[async_trait]
impl GroupCache for QualityControl {
    fn family(&self) -> &'static str {
        QC_FAMILY
    }

    async fn refresh_group(
        &self,
        ctx: &CacheContext,
        subject_id: &str,
        write_sidecar: bool,
    ) -> Result<Option<Dataset>> {
        let key = self.key(subject_id);
        info!(cache = QC_FAMILY, subject_id, "Updating cache for subject");

        let query = RecordQuery::all()
            .filter(json!({"subject.subject_id": subject_id}))
            .project(["_id", "name", "quality_control"]);
        let records = ctx.source.retrieve(&query).await?;

        if records.is_empty() {
            warn!(cache = QC_FAMILY, subject_id, "No records found for subject");
            return Ok(None);
        }

        let metrics: Vec<Record> = records.iter().flat_map(metric_rows).collect();
        if metrics.is_empty() {
            warn!(cache = QC_FAMILY, subject_id, "No quality_control metrics found for subject");
            return Ok(None);
        }

        let count = metrics.len();
        let data = Dataset::from_records(metrics);
        ctx.store.write(&key, &data, write_sidecar).await?;
        info!(
            cache = QC_FAMILY,
            subject_id,
            assets = records.len(),
            metrics = count,
            "Cached QC data for subject"
        );
        Ok(Some(data))
    }
}

/// QC metrics of a subject, optionally restricted to some of its assets
///
/// Without `force_update`, an empty cache yields an empty selection and an
/// error-level log line rather than a failure. Assets requested but not
/// present are listed in [`Selection::missing`].
pub async fn qc(
    ctx: &CacheContext,
    subject_id: &str,
    assets: Option<MemberFilter>,
    force_update: bool,
) -> Result<Selection> {
    let cache = QualityControl;
    let key = cache.key(subject_id);

    let data = if force_update {
        cache
            .refresh_group(ctx, subject_id, true)
            .await?
            .unwrap_or_else(Dataset::empty)
    } else {
        let cached = ctx.store.read(&key).await;
        if cached.is_empty() {
            error!(
                cache = QC_FAMILY,
                subject_id,
                "Cache is empty for subject. Request a refresh (force_update) to fetch data from the metadata source."
            );
        }
        cached
    };

    Ok(match assets {
        Some(filter) => select_members(&data, filter, &key),
        None => Selection {
            data,
            missing: Vec::new(),
        },
    })
}

/// Columns shared by every subject's QC table
pub async fn qc_columns(ctx: &CacheContext) -> Result<Vec<String>> {
    ctx.store.columns(&QualityControl.key("")).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::decode_column;
    use crate::source::StaticSource;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn ctx() -> CacheContext {
        let source = StaticSource::new(vec![
            json!({
                "_id": "1",
                "name": "asset_one",
                "subject": {"subject_id": "614173"},
                "quality_control": {"metrics": [
                    {"name": "drift", "value": {"max": 3}, "status_history": [{"status": "Pass"}]},
                    {"name": "yield", "value": 12}
                ]}
            }),
            json!({
                "_id": "2",
                "name": "asset_two",
                "subject": {"subject_id": "614173"},
                "quality_control": {"metrics": [{"name": "drift", "value": "ok"}]}
            }),
            json!({"_id": "3", "name": "no_qc", "subject": {"subject_id": "700001"}}),
        ]);
        CacheContext::new(Arc::new(MemoryStore::new()), Arc::new(source))
    }

    #[tokio::test]
    async fn test_refresh_encodes_metrics() {
        let ctx = ctx();
        let selection = qc(&ctx, "614173", None, true).await.unwrap();
        let data = selection.data;

        assert_eq!(data.len(), 3);
        assert_eq!(data.value(0, "value"), Some(&json!("json:{\"max\":3}")));
        assert_eq!(data.value(1, "value"), Some(&json!("12")));
        assert_eq!(data.value(2, MEMBER_COLUMN), Some(&json!("asset_two")));
        assert_eq!(data.value(2, "status_history"), Some(&Value::Null));

        let decoded = decode_column(&data, "value").unwrap();
        assert_eq!(decoded.value(0, "value"), Some(&json!({"max": 3})));
        assert_eq!(decoded.value(2, "value"), Some(&json!("ok")));
    }

    #[tokio::test]
    async fn test_empty_cache_without_refresh_is_empty() {
        let selection = qc(&ctx(), "614173", None, false).await.unwrap();
        assert!(selection.data.is_empty());
    }

    #[tokio::test]
    async fn test_asset_filter_reports_missing() {
        let ctx = ctx();
        qc(&ctx, "614173", None, true).await.unwrap();

        let selection = qc(&ctx, "614173", Some(vec!["asset_two".to_string(), "ghost".to_string()].into()), false)
            .await
            .unwrap();
        assert_eq!(selection.data.len(), 1);
        assert_eq!(selection.missing, vec!["ghost"]);
    }

    #[tokio::test]
    async fn test_subject_without_metrics_writes_nothing() {
        let ctx = ctx();
        let selection = qc(&ctx, "700001", None, true).await.unwrap();
        assert!(selection.data.is_empty());
        assert!(ctx.store.read("qc/700001").await.is_empty());
        assert!(qc_columns(&ctx).await.is_err());

        let written = QualityControl.refresh_group(&ctx, "700001", true).await.unwrap();
        assert!(written.is_none());
        assert!(QualityControl.refresh_group(&ctx, "614173", false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_family_sidecar() {
        let ctx = ctx();
        qc(&ctx, "614173", None, true).await.unwrap();
        let columns = qc_columns(&ctx).await.unwrap();
        assert!(columns.contains(&"name".to_string()));
        assert!(columns.contains(&MEMBER_COLUMN.to_string()));
    }
}
