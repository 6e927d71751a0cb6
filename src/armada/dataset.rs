//! Datasets: named, ordered record sequences that tasks can iterate over.
//!
//! A record is a JSON object conforming to the dataset's
//! [`FieldSpec`](crate::armada::schema::FieldSpec) schema. Datasets come
//! from three places: declared defaults in config, a mission input bound
//! via `bind_to`, or runtime promotion by an agent tool
//! (`result_to_dataset`, `dataset_create`).

use crate::armada::schema::{validate_record, FieldSpec};
use serde_json::Value;
use std::sync::Arc;

/// A named ordered sequence of records.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub description: String,
    /// Schema the records conform to; empty means unconstrained.
    pub schema: Vec<FieldSpec>,
    pub records: Vec<Value>,
}

impl Dataset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Vec<FieldSpec>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_records(mut self, records: Vec<Value>) -> Self {
        self.records = records;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Validate every record against the schema. Non-object records are
    /// rejected outright; the error names the offending index.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema.is_empty() {
            return Ok(());
        }
        for (index, record) in self.records.iter().enumerate() {
            let map = record.as_object().ok_or_else(|| {
                format!("dataset '{}' record {} is not an object", self.name, index)
            })?;
            validate_record(&self.schema, map).map_err(|e| {
                format!("dataset '{}' record {}: {}", self.name, index, e)
            })?;
        }
        Ok(())
    }

    /// Identifier for the record at `index`: its `id` field when present,
    /// otherwise the index itself.
    pub fn item_id(&self, index: usize) -> String {
        match self.records.get(index).and_then(|r| r.get("id")) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => index.to_string(),
        }
    }
}

/// Iteration cursor over an immutable dataset snapshot.
///
/// The snapshot is taken at task entry; later mutations of the underlying
/// dataset are never observed by an in-flight iteration. The cursor
/// advances only when enough outputs have been submitted for the current
/// item: with an advancement count of `k`, the index moves after the
/// result counter reaches `k − 1` submissions beyond the first.
#[derive(Debug, Clone)]
pub struct Cursor {
    records: Arc<Vec<Value>>,
    index: usize,
    results: usize,
    advance_every: usize,
}

impl Cursor {
    /// Snapshot `records` with an advancement count of `advance_every`
    /// (clamped to at least 1).
    pub fn new(records: Vec<Value>, advance_every: usize) -> Self {
        Self {
            records: Arc::new(records),
            index: 0,
            results: 0,
            advance_every: advance_every.max(1),
        }
    }

    /// The record under the cursor, or `None` once exhausted.
    pub fn current(&self) -> Option<&Value> {
        self.records.get(self.index)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.index >= self.records.len()
    }

    /// Record one submitted output for the current item. Returns `true`
    /// when the submission advanced the cursor to the next item.
    pub fn submit_result(&mut self) -> bool {
        if self.is_done() {
            return false;
        }
        if self.results == self.advance_every - 1 {
            self.results = 0;
            self.index += 1;
            true
        } else {
            self.results += 1;
            false
        }
    }
}
