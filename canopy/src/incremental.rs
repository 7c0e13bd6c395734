//! Watermark-driven incremental refresh
//!
//! Large tables are refreshed by comparing a narrow remote index of
//! `(id, watermark)` pairs against the cached snapshot and re-fetching only
//! the rows whose watermark changed. Watermark equality is the only
//! staleness signal: equal watermarks are never refetched, and a missing
//! watermark on either side always is.

use crate::dataset::{Dataset, Record};
use crate::error::Result;
use crate::source::{lookup_path, MetadataSource, RecordQuery};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// Identifiers per remote fetch
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Outcome of comparing a cached snapshot with the remote index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshPlan {
    /// Identifiers to fetch in full, in remote index order
    pub stale: Vec<String>,
    /// Identifiers whose cached rows are reused unchanged
    pub current: Vec<String>,
}

impl RefreshPlan {
    /// Nothing to fetch
    pub fn is_noop(&self) -> bool {
        self.stale.is_empty()
    }
}

/// Incremental refresh keyed on an id column and a watermark column
#[derive(Debug, Clone)]
pub struct IncrementalRefresh {
    pub id_column: String,
    pub watermark_column: String,
    pub batch_size: usize,
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn watermark(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

impl IncrementalRefresh {
    pub fn new(id_column: impl Into<String>, watermark_column: impl Into<String>) -> Self {
        Self {
            id_column: id_column.into(),
            watermark_column: watermark_column.into(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Split the remote index into stale and current identifiers
    pub fn plan(&self, cached: &Dataset, remote_index: &[Value]) -> RefreshPlan {
        let cached_watermarks: HashMap<String, Option<&Value>> =
            match (cached.column_index(&self.id_column), cached.column_index(&self.watermark_column)) {
                (Some(id_idx), wm_idx) => cached
                    .rows()
                    .iter()
                    .filter_map(|row| {
                        let id = id_text(&row[id_idx])?;
                        Some((id, wm_idx.and_then(|i| watermark(Some(&row[i])))))
                    })
                    .collect(),
                (None, _) => HashMap::new(),
            };

        let mut plan = RefreshPlan::default();
        let mut seen = HashSet::new();
        for entry in remote_index {
            let Some(id) = lookup_path(entry, &self.id_column).and_then(id_text) else {
                warn!(entry = %entry, "Remote index entry has no identifier");
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }

            let remote = watermark(lookup_path(entry, &self.watermark_column));
            let up_to_date = match (cached_watermarks.get(&id), remote) {
                (Some(Some(cached)), Some(remote)) => *cached == remote,
                _ => false,
            };

            if up_to_date {
                plan.current.push(id);
            } else {
                plan.stale.push(id);
            }
        }
        plan
    }

    /// Stale identifiers in fetch-sized batches
    pub fn batches<'a>(&self, plan: &'a RefreshPlan) -> impl Iterator<Item = &'a [String]> {
        plan.stale.chunks(self.batch_size.max(1))
    }

    /// New snapshot: current cached rows followed by freshly fetched rows
    ///
    /// Cached rows whose identifier left the remote index are in neither
    /// part and drop out.
    pub fn assemble(&self, cached: &Dataset, plan: &RefreshPlan, fresh: Dataset) -> Dataset {
        let keep: HashSet<&str> = plan.current.iter().map(String::as_str).collect();
        let kept = match cached.column_index(&self.id_column) {
            Some(idx) => cached.filter_rows(|_, row| {
                id_text(&row[idx]).is_some_and(|id| keep.contains(id.as_str()))
            }),
            None => Dataset::empty(),
        };
        Dataset::concat([kept, fresh])
    }

    /// Run the whole refresh against a source
    ///
    /// `fields` are the (dotted) document fields the flattener needs; the id
    /// and watermark are always fetched. Returns the new snapshot with the
    /// plan that produced it.
    pub async fn refresh<F>(
        &self,
        source: &dyn MetadataSource,
        cached: &Dataset,
        template: &[String],
        fields: &[&str],
        flatten: F,
    ) -> Result<(Dataset, RefreshPlan)>
    where
        F: Fn(&Value) -> Record,
    {
        let index_query = RecordQuery::all().project([self.id_column.as_str(), self.watermark_column.as_str()]);
        let remote_index = source.retrieve(&index_query).await?;

        let plan = self.plan(cached, &remote_index);
        info!(
            remote = remote_index.len(),
            stale = plan.stale.len(),
            current = plan.current.len(),
            "Planned incremental refresh"
        );

        let projection: Vec<&str> = fields
            .iter()
            .copied()
            .chain([self.id_column.as_str(), self.watermark_column.as_str()])
            .collect();

        let mut fresh = Dataset::new(template.to_vec());
        for (i, batch) in self.batches(&plan).enumerate() {
            info!(batch = i + 1, size = batch.len(), "Fetching batch");
            let query = RecordQuery::field_in(&self.id_column, batch.iter().cloned())
                .project(projection.iter().copied());
            for record in source.retrieve(&query).await? {
                fresh.push_record(flatten(&record));
            }
        }

        let snapshot = Dataset::concat([
            Dataset::new(template.to_vec()),
            self.assemble(cached, &plan, fresh),
        ]);
        Ok((snapshot, plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticSource;
    use serde_json::json;

    fn cols() -> Vec<String> {
        vec!["id".to_string(), "wm".to_string(), "payload".to_string()]
    }

    fn cached() -> Dataset {
        Dataset::from_rows(
            cols(),
            vec![
                vec![json!("A"), json!(1), json!("a-old")],
                vec![json!("B"), json!(2), json!("b-old")],
            ],
        )
    }

    fn refresher() -> IncrementalRefresh {
        IncrementalRefresh::new("id", "wm")
    }

    #[test]
    fn test_plan_marks_changed_and_new_ids() {
        let index = vec![
            json!({"id": "A", "wm": 1}),
            json!({"id": "B", "wm": 3}),
            json!({"id": "C", "wm": 4}),
        ];
        let plan = refresher().plan(&cached(), &index);
        assert_eq!(plan.stale, vec!["B", "C"]);
        assert_eq!(plan.current, vec!["A"]);
    }

    #[test]
    fn test_plan_against_empty_cache_is_everything() {
        let index = vec![json!({"id": "A", "wm": 1}), json!({"id": "B", "wm": 2})];
        let plan = refresher().plan(&Dataset::empty(), &index);
        assert_eq!(plan.stale, vec!["A", "B"]);
        assert!(plan.current.is_empty());
    }

    #[test]
    fn test_missing_watermark_is_always_stale() {
        let index = vec![json!({"id": "A"}), json!({"id": "B", "wm": null})];
        let plan = refresher().plan(&cached(), &index);
        assert_eq!(plan.stale, vec!["A", "B"]);
    }

    #[test]
    fn test_batches_are_bounded() {
        let plan = RefreshPlan {
            stale: (0..250).map(|i| i.to_string()).collect(),
            current: vec![],
        };
        let sizes: Vec<usize> = refresher().batches(&plan).map(<[String]>::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[test]
    fn test_assemble_drops_vanished_ids() {
        let plan = RefreshPlan {
            stale: vec![],
            current: vec!["B".to_string()],
        };
        let out = refresher().assemble(&cached(), &plan, Dataset::new(cols()));
        assert_eq!(out.len(), 1);
        assert_eq!(out.value(0, "id"), Some(&json!("B")));
    }

    #[tokio::test]
    async fn test_refresh_fetches_only_stale_rows() {
        let source = StaticSource::new(vec![
            json!({"id": "A", "wm": 1, "payload": "a-new"}),
            json!({"id": "B", "wm": 3, "payload": "b-new"}),
            json!({"id": "C", "wm": 4, "payload": "c-new"}),
        ]);

        let (snapshot, plan) = refresher()
            .refresh(&source, &cached(), &cols(), &["payload"], |doc| {
                doc.as_object().cloned().unwrap_or_default()
            })
            .await
            .unwrap();

        assert_eq!(plan.stale, vec!["B", "C"]);
        let queries = source.queries().await;
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1].filter, json!({"id": {"$in": ["B", "C"]}}));

        let payloads: Vec<&Value> = snapshot.column_values("payload").unwrap();
        assert_eq!(payloads, vec![&json!("a-old"), &json!("b-new"), &json!("c-new")]);
    }
}
