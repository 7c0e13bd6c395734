//! Rectangular, named-column datasets held by the cache stores

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// A flat record: column name -> cell value
pub type Record = Map<String, Value>;

/// Ordered, named-column collection of rows
///
/// Cells are JSON scalars. Structured values are carried as tagged strings
/// (see [`crate::encoding`]) so that every column can be given a single
/// columnar type when persisted. A dataset has no primary key; uniqueness is
/// the concern of whichever entity cache produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Dataset {
    /// Create an empty dataset with the given columns
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Create an empty dataset with no columns
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a dataset from rows that already match `columns`
    ///
    /// Short rows are padded with nulls and long rows truncated.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Value::Null);
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Build a dataset from records; columns appear in first-seen order
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = Record>,
    {
        let mut dataset = Self::empty();
        for record in records {
            dataset.push_record(record);
        }
        dataset
    }

    /// Append a record, extending the column set if it carries new fields
    pub fn push_record(&mut self, mut record: Record) {
        for name in record.keys() {
            if !self.columns.iter().any(|c| c == name) {
                self.columns.push(name.clone());
                for row in &mut self.rows {
                    row.push(Value::Null);
                }
            }
        }

        let row = self
            .columns
            .iter()
            .map(|c| record.remove(c).unwrap_or(Value::Null))
            .collect();
        self.rows.push(row);
    }

    /// Column names in order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Raw rows, aligned with [`Dataset::columns`]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// A dataset without rows counts as a cache miss, whatever its columns
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of a column
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Whether the dataset has a column
    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Cell value by row index and column name
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// All values of one column, or `None` if the column is absent
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Non-empty string values of a column, deduplicated, in first-seen order
    pub fn distinct_strings(&self, name: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for value in self.column_values(name).unwrap_or_default() {
            if let Value::String(s) = value {
                if !s.is_empty() && seen.insert(s.as_str()) {
                    out.push(s.clone());
                }
            }
        }
        out
    }

    /// Rows as records
    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        self.rows.iter().map(move |row| {
            self.columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect::<Record>()
        })
    }

    /// Keep rows matching the predicate, preserving order and columns
    pub fn filter_rows<F>(&self, mut predicate: F) -> Dataset
    where
        F: FnMut(&[String], &[Value]) -> bool,
    {
        let rows = self
            .rows
            .iter()
            .filter(|row| predicate(&self.columns, row))
            .cloned()
            .collect();
        Dataset {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Keep rows whose `column` holds a string contained in `keep`
    pub fn retain_string_in(&self, column: &str, keep: &HashSet<String>) -> Dataset {
        match self.column_index(column) {
            Some(idx) => self.filter_rows(|_, row| {
                matches!(&row[idx], Value::String(s) if keep.contains(s))
            }),
            None => Dataset::new(self.columns.clone()),
        }
    }

    /// Set `column` to `value` on every row, adding the column if needed
    pub fn with_column(mut self, column: &str, value: Value) -> Dataset {
        match self.column_index(column) {
            Some(idx) => {
                for row in &mut self.rows {
                    row[idx] = value.clone();
                }
            }
            None => {
                self.columns.push(column.to_string());
                for row in &mut self.rows {
                    row.push(value.clone());
                }
            }
        }
        self
    }

    /// Row-wise union of several datasets
    ///
    /// Columns are the union of all inputs in first-appearance order; cells
    /// for columns a part does not carry are null.
    pub fn concat<I>(parts: I) -> Dataset
    where
        I: IntoIterator<Item = Dataset>,
    {
        let mut out = Dataset::empty();
        for part in parts {
            for name in &part.columns {
                if !out.columns.contains(name) {
                    out.columns.push(name.clone());
                    for row in &mut out.rows {
                        row.push(Value::Null);
                    }
                }
            }

            let mapping: Vec<Option<usize>> = out
                .columns
                .iter()
                .map(|name| part.column_index(name))
                .collect();

            for row in part.rows {
                let aligned = mapping
                    .iter()
                    .map(|idx| idx.map(|i| row[i].clone()).unwrap_or(Value::Null))
                    .collect();
                out.rows.push(aligned);
            }
        }
        out
    }
}
