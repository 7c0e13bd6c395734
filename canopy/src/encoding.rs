//! Tagged text encoding for structured cell values
//!
//! Columnar formats need one declared type per column, but source documents
//! carry nested objects and lists (status histories, tag maps). Those are
//! stored as `json:<serialized>` strings and decoded on demand.

use crate::dataset::Dataset;
use crate::error::Result;
use serde_json::Value;

/// Prefix marking an encoded structured value
pub const JSON_TAG: &str = "json:";

/// Encode a cell for storage
///
/// Objects and arrays become tagged JSON strings, null stays null, strings
/// pass through and other scalars are coerced to text.
pub fn encode_value(value: Value) -> Value {
    match value {
        Value::Object(_) | Value::Array(_) => Value::String(format!("{}{}", JSON_TAG, value)),
        Value::Null => Value::Null,
        Value::String(s) => Value::String(s),
        other => Value::String(other.to_string()),
    }
}

/// Decode a stored cell; untagged values are returned unchanged
pub fn decode_value(value: Value) -> Result<Value> {
    match value {
        Value::String(s) => match s.strip_prefix(JSON_TAG) {
            Some(body) => Ok(serde_json::from_str(body)?),
            None => Ok(Value::String(s)),
        },
        other => Ok(other),
    }
}

/// Decode every cell of one column in place
pub fn decode_column(dataset: &Dataset, column: &str) -> Result<Dataset> {
    let Some(idx) = dataset.column_index(column) else {
        return Ok(dataset.clone());
    };

    let mut rows = Vec::with_capacity(dataset.len());
    for row in dataset.rows() {
        let mut row = row.clone();
        row[idx] = decode_value(std::mem::take(&mut row[idx]))?;
        rows.push(row);
    }
    Ok(Dataset::from_rows(dataset.columns().to_vec(), rows))
}
