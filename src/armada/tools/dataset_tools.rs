//! Mission-scope dataset tools.
//!
//! Agents can mutate the mission's dataset set at runtime: create new
//! datasets, append or replace records, peek at samples, and count.
//! Iteration snapshots are taken at task entry, so mutations never affect
//! an iteration already in flight.

use crate::armada::dataset::Dataset;
use crate::armada::schema::{FieldSpec, FieldType};
use crate::armada::stores::DatasetStore;
use crate::armada::tools::{optional_usize, parse_object_input, require_str, Tool, ToolMap};
use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::sync::Arc;

type ToolResult = Result<String, Box<dyn Error + Send + Sync>>;

fn records_field(
    input: &serde_json::Map<String, Value>,
) -> Result<Vec<Value>, Box<dyn Error + Send + Sync>> {
    match input.get("records") {
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err("field 'records' must be an array".into()),
        None => Err("missing required array field 'records'".into()),
    }
}

/// Create a dataset from inline records.
pub struct DatasetCreateTool {
    datasets: Arc<dyn DatasetStore>,
}

#[async_trait]
impl Tool for DatasetCreateTool {
    fn name(&self) -> &str {
        "dataset_create"
    }

    fn description(&self) -> &str {
        "Create a new named dataset from an array of records."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("name", FieldType::String).required(),
            FieldSpec::new("records", FieldType::Array).required(),
            FieldSpec::new("description", FieldType::String),
        ]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let input = parse_object_input(input)?;
        let name = require_str(&input, "name")?;
        let records = records_field(&input)?;
        let description = input
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let count = records.len();
        self.datasets
            .create(
                Dataset::new(name)
                    .with_description(description)
                    .with_records(records),
            )
            .await?;
        Ok(format!("dataset '{}' created with {} records", name, count))
    }
}

/// Append records to an existing dataset.
pub struct DatasetAppendTool {
    datasets: Arc<dyn DatasetStore>,
}

#[async_trait]
impl Tool for DatasetAppendTool {
    fn name(&self) -> &str {
        "dataset_append"
    }

    fn description(&self) -> &str {
        "Append records to an existing dataset."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("name", FieldType::String).required(),
            FieldSpec::new("records", FieldType::Array).required(),
        ]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let input = parse_object_input(input)?;
        let name = require_str(&input, "name")?;
        let records = records_field(&input)?;
        let total = self.datasets.append_records(name, records).await?;
        Ok(format!("dataset '{}' now has {} records", name, total))
    }
}

/// Replace all records of an existing dataset.
pub struct DatasetReplaceTool {
    datasets: Arc<dyn DatasetStore>,
}

#[async_trait]
impl Tool for DatasetReplaceTool {
    fn name(&self) -> &str {
        "dataset_replace"
    }

    fn description(&self) -> &str {
        "Replace the records of an existing dataset."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("name", FieldType::String).required(),
            FieldSpec::new("records", FieldType::Array).required(),
        ]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let input = parse_object_input(input)?;
        let name = require_str(&input, "name")?;
        let records = records_field(&input)?;
        let count = records.len();
        self.datasets.replace_records(name, records).await?;
        Ok(format!("dataset '{}' replaced with {} records", name, count))
    }
}

/// Read the first records of a dataset.
pub struct DatasetSampleTool {
    datasets: Arc<dyn DatasetStore>,
}

#[async_trait]
impl Tool for DatasetSampleTool {
    fn name(&self) -> &str {
        "dataset_sample"
    }

    fn description(&self) -> &str {
        "Show the first records of a dataset."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("name", FieldType::String).required(),
            FieldSpec::new("count", FieldType::Integer),
        ]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let input = parse_object_input(input)?;
        let name = require_str(&input, "name")?;
        let count = optional_usize(&input, "count")?.unwrap_or(5);
        let dataset = self
            .datasets
            .get(name)
            .await?
            .ok_or_else(|| format!("dataset '{}' not found", name))?;
        let sample: &[Value] = &dataset.records[..count.min(dataset.records.len())];
        Ok(serde_json::to_string(sample)?)
    }
}

/// Count the records of a dataset.
pub struct DatasetCountTool {
    datasets: Arc<dyn DatasetStore>,
}

#[async_trait]
impl Tool for DatasetCountTool {
    fn name(&self) -> &str {
        "dataset_count"
    }

    fn description(&self) -> &str {
        "Count the records of a dataset."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![FieldSpec::new("name", FieldType::String).required()]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let input = parse_object_input(input)?;
        let name = require_str(&input, "name")?;
        let count = self.datasets.count(name).await?;
        Ok(count.to_string())
    }
}

/// Install the dataset tool family, all bound to the mission's store.
pub fn install_dataset_tools(tools: &mut ToolMap, datasets: Arc<dyn DatasetStore>) {
    let entries: Vec<Arc<dyn Tool>> = vec![
        Arc::new(DatasetCreateTool {
            datasets: Arc::clone(&datasets),
        }),
        Arc::new(DatasetAppendTool {
            datasets: Arc::clone(&datasets),
        }),
        Arc::new(DatasetReplaceTool {
            datasets: Arc::clone(&datasets),
        }),
        Arc::new(DatasetSampleTool {
            datasets: Arc::clone(&datasets),
        }),
        Arc::new(DatasetCountTool { datasets }),
    ];
    for tool in entries {
        tools.insert(tool.name().to_string(), tool);
    }
}
