//! Distinct-value list caches (project names, subject ids)

use crate::caches::{
    into_records, tabulate, CacheContext, EntityCache, UNIQUE_PROJECT_NAMES, UNIQUE_SUBJECT_IDS,
};
use crate::dataset::Dataset;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

/// Distinct values of one document field, grouped by the source
#[derive(Debug, Clone, Copy)]
pub struct DistinctValues {
    key: &'static str,
    field: &'static str,
    column: &'static str,
}

impl DistinctValues {
    pub const fn new(key: &'static str, field: &'static str, column: &'static str) -> Self {
        Self { key, field, column }
    }

    pub const fn project_names() -> Self {
        Self::new(UNIQUE_PROJECT_NAMES, "data_description.project_name", "project_name")
    }

    pub const fn subject_ids() -> Self {
        Self::new(UNIQUE_SUBJECT_IDS, "subject.subject_id", "subject_id")
    }

    pub fn column(&self) -> &'static str {
        self.column
    }

    /// Cached values; null and empty values are dropped
    pub async fn values(&self, ctx: &CacheContext, force_update: bool) -> Result<Vec<String>> {
        let data = self.load(ctx, force_update).await?;
        Ok(data.distinct_strings(self.column))
    }
}

#[async_trait]
impl EntityCache for DistinctValues {
    fn name(&self) -> &'static str {
        self.key
    }

    async fn refresh(&self, ctx: &CacheContext) -> Result<Dataset> {
        info!(cache = self.key, "Updating cache");
        let pipeline = [
            json!({"$group": {"_id": format!("${}", self.field)}}),
            json!({"$project": {self.column: "$_id", "_id": 0}}),
        ];
        let rows = ctx.source.aggregate(&pipeline).await?;

        let data = tabulate(&[self.column], into_records(rows));
        ctx.store.write(self.key, &data, true).await?;
        Ok(data)
    }
}

/// Every project name known to the source
pub async fn unique_project_names(ctx: &CacheContext, force_update: bool) -> Result<Vec<String>> {
    DistinctValues::project_names().values(ctx, force_update).await
}

pub async fn unique_project_names_columns(ctx: &CacheContext) -> Result<Vec<String>> {
    ctx.store.columns(UNIQUE_PROJECT_NAMES).await
}

/// Every subject id known to the source
pub async fn unique_subject_ids(ctx: &CacheContext, force_update: bool) -> Result<Vec<String>> {
    DistinctValues::subject_ids().values(ctx, force_update).await
}

pub async fn unique_subject_ids_columns(ctx: &CacheContext) -> Result<Vec<String>> {
    ctx.store.columns(UNIQUE_SUBJECT_IDS).await
}
