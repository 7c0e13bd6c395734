//! Basic per-asset metadata, refreshed incrementally on `_last_modified`

use crate::caches::{CacheContext, EntityCache, ASSET_BASICS};
use crate::dataset::{Dataset, Record};
use crate::encoding::encode_value;
use crate::error::Result;
use crate::incremental::IncrementalRefresh;
use crate::source::lookup_path;
use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

pub const ID_COLUMN: &str = "_id";
pub const WATERMARK_COLUMN: &str = "_last_modified";

/// Document fields needed to build a row
pub const FIELDS: &[&str] = &[
    "data_description.modalities",
    "data_description.project_name",
    "data_description.data_level",
    "subject.subject_id",
    "acquisition.acquisition_start_time",
    "acquisition.acquisition_end_time",
    "processing.data_processes.start_date_time",
    "subject.subject_details.genotype",
    "other_identifiers",
    "location",
    "name",
];

/// Output columns, in order
pub const COLUMNS: &[&str] = &[
    ID_COLUMN,
    WATERMARK_COLUMN,
    "modalities",
    "project_name",
    "data_level",
    "subject_id",
    "acquisition_start_time",
    "acquisition_end_time",
    "code_ocean",
    "process_date",
    "genotype",
    "location",
    "name",
];

fn field(doc: &Value, path: &str) -> Value {
    lookup_path(doc, path).cloned().unwrap_or(Value::Null)
}

/// Flatten one asset document into a row
pub fn flatten(doc: &Value) -> Record {
    let modalities = lookup_path(doc, "data_description.modalities")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|m| m.get("abbreviation").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    // date part of the most recent processing step
    let process_date = lookup_path(doc, "processing.data_processes")
        .and_then(Value::as_array)
        .and_then(|steps| steps.last())
        .and_then(|step| step.get("start_date_time"))
        .and_then(Value::as_str)
        .and_then(|ts| ts.split('T').next())
        .map(|date| Value::String(date.to_string()))
        .unwrap_or(Value::Null);

    let code_ocean = lookup_path(doc, "other_identifiers.Code Ocean")
        .cloned()
        .map(encode_value)
        .unwrap_or(Value::Null);

    let mut row = Record::new();
    row.insert(ID_COLUMN.to_string(), field(doc, ID_COLUMN));
    row.insert(WATERMARK_COLUMN.to_string(), field(doc, WATERMARK_COLUMN));
    row.insert("modalities".to_string(), Value::String(modalities));
    row.insert("project_name".to_string(), field(doc, "data_description.project_name"));
    row.insert("data_level".to_string(), field(doc, "data_description.data_level"));
    row.insert("subject_id".to_string(), field(doc, "subject.subject_id"));
    row.insert(
        "acquisition_start_time".to_string(),
        field(doc, "acquisition.acquisition_start_time"),
    );
    row.insert(
        "acquisition_end_time".to_string(),
        field(doc, "acquisition.acquisition_end_time"),
    );
    row.insert("code_ocean".to_string(), code_ocean);
    row.insert("process_date".to_string(), process_date);
    row.insert("genotype".to_string(), field(doc, "subject.subject_details.genotype"));
    row.insert("location".to_string(), field(doc, "location"));
    row.insert("name".to_string(), field(doc, "name"));
    row
}

/// The primary asset table
#[derive(Debug, Clone)]
pub struct AssetBasics {
    refresher: IncrementalRefresh,
}

impl Default for AssetBasics {
    fn default() -> Self {
        Self {
            refresher: IncrementalRefresh::new(ID_COLUMN, WATERMARK_COLUMN),
        }
    }
}

impl AssetBasics {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.refresher = self.refresher.with_batch_size(batch_size);
        self
    }
}

#[async_trait]
impl EntityCache for AssetBasics {
    fn name(&self) -> &'static str {
        ASSET_BASICS
    }

    async fn refresh(&self, ctx: &CacheContext) -> Result<Dataset> {
        info!(cache = self.name(), "Updating cache");
        let cached = ctx.store.read(self.name()).await;
        let template: Vec<String> = COLUMNS.iter().map(|c| c.to_string()).collect();

        let (snapshot, plan) = self
            .refresher
            .refresh(ctx.source.as_ref(), &cached, &template, FIELDS, flatten)
            .await?;

        ctx.store.write(self.name(), &snapshot, true).await?;
        info!(
            cache = self.name(),
            fetched = plan.stale.len(),
            reused = plan.current.len(),
            rows = snapshot.len(),
            "Cached asset basics"
        );
        Ok(snapshot)
    }
}

pub async fn asset_basics(ctx: &CacheContext, force_update: bool) -> Result<Dataset> {
    AssetBasics::default().load(ctx, force_update).await
}

pub async fn asset_basics_columns(ctx: &CacheContext) -> Result<Vec<String>> {
    ctx.store.columns(ASSET_BASICS).await
}
