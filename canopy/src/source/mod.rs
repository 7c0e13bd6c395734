//! Remote metadata source
//!
//! The caches only need two operations from the document store that holds
//! asset metadata: a filtered, projected retrieval and an aggregation
//! pipeline. Both are treated as slow and possibly paginated.

pub mod fixture;
pub mod http;

pub use fixture::StaticSource;
pub use http::HttpMetadataSource;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Filtered, projected retrieval request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    /// Document filter expression
    pub filter: Value,
    /// Field projection (`{"field": 1}`); empty object returns whole documents
    pub projection: Value,
    /// Maximum number of records, 0 for unlimited
    pub limit: u64,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            filter: Value::Object(Map::new()),
            projection: Value::Object(Map::new()),
            limit: 0,
        }
    }
}

impl RecordQuery {
    /// Every record, whole documents, no limit
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    /// Project onto the listed (dotted) fields
    pub fn project<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let projection: Map<String, Value> = fields
            .into_iter()
            .map(|f| (f.into(), json!(1)))
            .collect();
        self.projection = Value::Object(projection);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Filter matching any of `values` on `field`
    pub fn field_in<I, S>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<Value> = values.into_iter().map(|v| Value::String(v.into())).collect();
        Self::default().filter(json!({ field: { "$in": values } }))
    }
}

/// Document store holding the records caches are derived from
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Records matching the query
    async fn retrieve(&self, query: &RecordQuery) -> Result<Vec<Value>>;

    /// Rows produced by an aggregation pipeline
    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Value>>;
}

/// Value at a dotted path (`"subject.subject_id"`), if every segment exists
pub fn lookup_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(document, |current, segment| current.as_object()?.get(segment))
}
