//! Arrow and Parquet conversion for datasets
//!
//! Columns whose cells share one scalar type map to the matching Arrow
//! type. Anything else (mixed types, ints next to floats, objects, lists) is
//! stored as Utf8 holding each cell's JSON text, and the field is marked
//! with [`KIND_METADATA`] so reads restore the original values.

use crate::dataset::Dataset;
use crate::encoding::encode_value;
use crate::error::{CacheError, Result};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, RecordBatchOptions,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Field metadata key naming how a Utf8 column was encoded
pub const KIND_METADATA: &str = "canopy:kind";

/// [`KIND_METADATA`] value of JSON-text columns
pub const JSON_KIND: &str = "json";

/// Storage type chosen for one column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Boolean,
    Integer,
    Float,
    Text,
    /// Heterogeneous or structured cells, stored as JSON text
    Json,
}

impl ColumnKind {
    /// Infer the narrowest kind that holds every non-null value exactly
    ///
    /// All-null columns become text.
    pub fn infer<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut kind: Option<ColumnKind> = None;
        for value in values {
            let this = match value {
                Value::Null => continue,
                Value::Bool(_) => ColumnKind::Boolean,
                Value::Number(n) if n.is_i64() => ColumnKind::Integer,
                Value::Number(n) if n.is_f64() => ColumnKind::Float,
                Value::String(_) => ColumnKind::Text,
                _ => return ColumnKind::Json,
            };
            kind = Some(match kind {
                None => this,
                Some(k) if k == this => k,
                Some(_) => return ColumnKind::Json,
            });
        }
        kind.unwrap_or(ColumnKind::Text)
    }

    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Boolean => DataType::Boolean,
            ColumnKind::Integer => DataType::Int64,
            ColumnKind::Float => DataType::Float64,
            ColumnKind::Text | ColumnKind::Json => DataType::Utf8,
        }
    }

    fn field(self, name: &str) -> Field {
        let field = Field::new(name, self.data_type(), true);
        match self {
            ColumnKind::Json => field.with_metadata(HashMap::from([(
                KIND_METADATA.to_string(),
                JSON_KIND.to_string(),
            )])),
            _ => field,
        }
    }
}

/// Render a cell as text for a text column
pub fn cell_text(value: &Value) -> Option<String> {
    match encode_value(value.clone()) {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Render a cell as JSON text for a [`ColumnKind::Json`] column
pub fn cell_json(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Parse JSON-text cells back into values
pub fn parse_json_cells(values: Vec<Value>) -> Result<Vec<Value>> {
    values
        .into_iter()
        .map(|value| match value {
            Value::String(text) => Ok(serde_json::from_str(&text)?),
            other => Ok(other),
        })
        .collect()
}

fn is_json_field(field: &Field) -> bool {
    field.metadata().get(KIND_METADATA).map(String::as_str) == Some(JSON_KIND)
}

/// Convert a dataset to a single record batch
pub fn to_record_batch(dataset: &Dataset) -> Result<RecordBatch> {
    let mut fields = Vec::with_capacity(dataset.columns().len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(dataset.columns().len());

    for (idx, name) in dataset.columns().iter().enumerate() {
        let cells: Vec<&Value> = dataset.rows().iter().map(|row| &row[idx]).collect();
        let kind = ColumnKind::infer(cells.iter().copied());

        let array: ArrayRef = match kind {
            ColumnKind::Boolean => Arc::new(BooleanArray::from(
                cells.iter().map(|v| v.as_bool()).collect::<Vec<_>>(),
            )),
            ColumnKind::Integer => Arc::new(Int64Array::from(
                cells.iter().map(|v| v.as_i64()).collect::<Vec<_>>(),
            )),
            ColumnKind::Float => Arc::new(Float64Array::from(
                cells.iter().map(|v| v.as_f64()).collect::<Vec<_>>(),
            )),
            ColumnKind::Text => Arc::new(StringArray::from(
                cells.iter().map(|v| cell_text(v)).collect::<Vec<_>>(),
            )),
            ColumnKind::Json => Arc::new(StringArray::from(
                cells.iter().map(|v| cell_json(v)).collect::<Vec<_>>(),
            )),
        };

        fields.push(kind.field(name));
        arrays.push(array);
    }

    let schema = Arc::new(Schema::new(fields));
    let options = RecordBatchOptions::new().with_row_count(Some(dataset.len()));
    Ok(RecordBatch::try_new_with_options(schema, arrays, &options)?)
}

/// Convert record batches back into one dataset
///
/// Foreign column types are cast: integers to Int64, floats to Float64 and
/// anything else (timestamps, dictionaries, large strings) to Utf8.
pub fn from_record_batches(batches: &[RecordBatch]) -> Result<Dataset> {
    let mut parts = Vec::with_capacity(batches.len());

    for batch in batches {
        let schema = batch.schema();
        let columns: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();
        let mut rows = vec![Vec::with_capacity(columns.len()); batch.num_rows()];

        for (field, array) in schema.fields().iter().zip(batch.columns()) {
            let mut values = array_values(array)?;
            if is_json_field(field) {
                values = parse_json_cells(values)?;
            }
            for (row, value) in rows.iter_mut().zip(values) {
                row.push(value);
            }
        }
        parts.push(Dataset::from_rows(columns, rows));
    }

    Ok(Dataset::concat(parts))
}

fn array_values(array: &ArrayRef) -> Result<Vec<Value>> {
    let len = array.len();
    let values = match array.data_type() {
        DataType::Null => vec![Value::Null; len],
        DataType::Boolean => {
            let arr = downcast::<BooleanArray>(array)?;
            (0..len)
                .map(|i| {
                    if arr.is_null(i) {
                        Value::Null
                    } else {
                        Value::Bool(arr.value(i))
                    }
                })
                .collect()
        }
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => {
            let cast = arrow_cast::cast(array, &DataType::Int64)?;
            let arr = downcast::<Int64Array>(&cast)?;
            (0..len)
                .map(|i| {
                    if arr.is_null(i) {
                        Value::Null
                    } else {
                        Value::from(arr.value(i))
                    }
                })
                .collect()
        }
        DataType::Float16 | DataType::Float32 | DataType::Float64 => {
            let cast = arrow_cast::cast(array, &DataType::Float64)?;
            let arr = downcast::<Float64Array>(&cast)?;
            (0..len)
                .map(|i| {
                    if arr.is_null(i) {
                        Value::Null
                    } else {
                        Number::from_f64(arr.value(i))
                            .map(Value::Number)
                            .unwrap_or(Value::Null)
                    }
                })
                .collect()
        }
        DataType::Utf8 => strings(downcast::<StringArray>(array)?),
        _ => {
            let cast = arrow_cast::cast(array, &DataType::Utf8)?;
            strings(downcast::<StringArray>(&cast)?)
        }
    };
    Ok(values)
}

fn strings(arr: &StringArray) -> Vec<Value> {
    (0..arr.len())
        .map(|i| {
            if arr.is_null(i) {
                Value::Null
            } else {
                Value::String(arr.value(i).to_string())
            }
        })
        .collect()
}

fn downcast<T: 'static>(array: &ArrayRef) -> Result<&T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        CacheError::ColumnarError(format!(
            "Unexpected array type {:?}",
            array.data_type()
        ))
    })
}

/// Serialize a dataset as Parquet bytes
pub fn to_parquet(dataset: &Dataset) -> Result<Bytes> {
    let batch = to_record_batch(dataset)?;
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(Bytes::from(buffer))
}

/// Deserialize Parquet bytes into a dataset
pub fn from_parquet(bytes: Bytes) -> Result<Dataset> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
    let columns: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();

    let batches = builder
        .build()?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if batches.is_empty() {
        return Ok(Dataset::new(columns));
    }
    from_record_batches(&batches)
}
