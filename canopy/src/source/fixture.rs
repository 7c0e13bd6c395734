//! In-memory metadata source for tests and local runs
//!
//! Understands the small query dialect the caches issue: equality and `$in`
//! filters on dotted paths, `{"field": 1}` projections, and `$match`,
//! `$group` and `$project` aggregation stages.

use crate::error::{CacheError, Result};
use crate::source::{lookup_path, MetadataSource, RecordQuery};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

type FailurePredicate = Box<dyn Fn(&RecordQuery) -> bool + Send + Sync>;

/// Metadata source serving a fixed set of documents
#[derive(Default)]
pub struct StaticSource {
    documents: Vec<Value>,
    queries: Mutex<Vec<RecordQuery>>,
    pipelines: Mutex<Vec<Vec<Value>>>,
    fail_when: Option<FailurePredicate>,
    fail_aggregations: bool,
}

impl StaticSource {
    pub fn new(documents: Vec<Value>) -> Self {
        Self {
            documents,
            ..Default::default()
        }
    }

    /// Fail every retrieval the predicate matches
    pub fn fail_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RecordQuery) -> bool + Send + Sync + 'static,
    {
        self.fail_when = Some(Box::new(predicate));
        self
    }

    /// Fail every aggregation
    pub fn fail_aggregations(mut self) -> Self {
        self.fail_aggregations = true;
        self
    }

    /// Retrievals served so far, in call order
    pub async fn queries(&self) -> Vec<RecordQuery> {
        self.queries.lock().await.clone()
    }

    /// Aggregation pipelines served so far, in call order
    pub async fn pipelines(&self) -> Vec<Vec<Value>> {
        self.pipelines.lock().await.clone()
    }

    pub fn documents(&self) -> &[Value] {
        &self.documents
    }
}

#[async_trait]
impl MetadataSource for StaticSource {
    async fn retrieve(&self, query: &RecordQuery) -> Result<Vec<Value>> {
        self.queries.lock().await.push(query.clone());

        if self.fail_when.as_ref().is_some_and(|f| f(query)) {
            return Err(CacheError::SourceError(format!(
                "injected failure for filter {}",
                query.filter
            )));
        }

        let limit = if query.limit == 0 {
            usize::MAX
        } else {
            query.limit as usize
        };

        Ok(self
            .documents
            .iter()
            .filter(|doc| matches_filter(doc, &query.filter))
            .take(limit)
            .map(|doc| project(doc, &query.projection))
            .collect())
    }

    async fn aggregate(&self, pipeline: &[Value]) -> Result<Vec<Value>> {
        self.pipelines.lock().await.push(pipeline.to_vec());

        if self.fail_aggregations {
            return Err(CacheError::SourceError("injected aggregation failure".to_string()));
        }

        let mut docs = self.documents.clone();
        for stage in pipeline {
            docs = apply_stage(docs, stage)?;
        }
        Ok(docs)
    }
}

fn matches_filter(doc: &Value, filter: &Value) -> bool {
    let Some(conditions) = filter.as_object() else {
        return true;
    };

    conditions.iter().all(|(path, condition)| {
        let actual = lookup_path(doc, path);
        match condition.as_object().and_then(|c| c.get("$in")) {
            Some(Value::Array(options)) => actual.is_some_and(|a| options.contains(a)),
            _ => actual.unwrap_or(&Value::Null) == condition,
        }
    })
}

fn includes_id(body: &Map<String, Value>) -> bool {
    !matches!(body.get("_id"), Some(Value::Number(n)) if n.as_i64() == Some(0))
        && !matches!(body.get("_id"), Some(Value::Bool(false)))
}

fn project(doc: &Value, projection: &Value) -> Value {
    let body = match projection.as_object() {
        Some(body) if !body.is_empty() => body,
        _ => return doc.clone(),
    };

    let mut out = Map::new();
    if includes_id(body) {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".to_string(), id.clone());
        }
    }
    for (path, flag) in body {
        if path == "_id" || !is_truthy(flag) {
            continue;
        }
        if let Some(value) = lookup_path(doc, path) {
            insert_path(&mut out, path, value.clone());
        }
    }
    Value::Object(out)
}

fn is_truthy(flag: &Value) -> bool {
    match flag {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

fn insert_path(out: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            out.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = out
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                insert_path(child, rest, value);
            }
        }
    }
}

/// Evaluate a `"$path"` reference or return the literal
fn evaluate(doc: &Value, expr: &Value) -> Value {
    match expr.as_str().and_then(|s| s.strip_prefix('$')) {
        Some(path) => lookup_path(doc, path).cloned().unwrap_or(Value::Null),
        None => expr.clone(),
    }
}

fn apply_stage(docs: Vec<Value>, stage: &Value) -> Result<Vec<Value>> {
    let (operator, body) = stage
        .as_object()
        .and_then(|s| s.iter().next())
        .ok_or_else(|| CacheError::SourceError(format!("malformed pipeline stage {}", stage)))?;

    match operator.as_str() {
        "$match" => Ok(docs.into_iter().filter(|d| matches_filter(d, body)).collect()),
        "$group" => {
            let key = body.get("_id").cloned().unwrap_or(Value::Null);
            let mut seen: Vec<Value> = Vec::new();
            for doc in &docs {
                let value = evaluate(doc, &key);
                if !seen.contains(&value) {
                    seen.push(value);
                }
            }
            Ok(seen
                .into_iter()
                .map(|id| {
                    let mut out = Map::new();
                    out.insert("_id".to_string(), id);
                    Value::Object(out)
                })
                .collect())
        }
        "$project" => {
            let body = body.as_object().cloned().unwrap_or_default();
            Ok(docs
                .iter()
                .map(|doc| {
                    let mut out = Map::new();
                    if includes_id(&body) {
                        if let Some(id) = doc.get("_id") {
                            out.insert("_id".to_string(), id.clone());
                        }
                    }
                    for (field, expr) in &body {
                        if field == "_id" {
                            continue;
                        }
                        let value = if expr.is_string() {
                            evaluate(doc, expr)
                        } else if is_truthy(expr) {
                            lookup_path(doc, field).cloned().unwrap_or(Value::Null)
                        } else {
                            continue;
                        };
                        out.insert(field.clone(), value);
                    }
                    Value::Object(out)
                })
                .collect())
        }
        other => Err(CacheError::SourceError(format!(
            "unsupported pipeline stage {}",
            other
        ))),
    }
}
