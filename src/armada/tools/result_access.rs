//! Lazy access tools over spilled results.
//!
//! When the interceptor spills an oversize result
//! ([`crate::armada::result_store`]), the model only sees a sample plus a
//! stored id. These tools let it read the rest on demand: inspect
//! (`result_info`), slice arrays (`result_items`), navigate structures
//! (`result_get`, `result_keys`), read raw byte ranges (`result_chunk`),
//! and promote an array into a mission dataset (`result_to_dataset`).
//!
//! Every tool fails with a `result '<id>' not found` error for unknown
//! ids and with a type-mismatch error when invoked against the wrong
//! stored kind.

use crate::armada::result_store::{ResultKind, ResultStore, StoredResult};
use crate::armada::schema::{FieldSpec, FieldType};
use crate::armada::stores::DatasetStore;
use crate::armada::tools::{optional_usize, parse_object_input, require_str, Tool, ToolMap};
use crate::armada::dataset::Dataset;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::error::Error;
use std::sync::Arc;

type ToolResult = Result<String, Box<dyn Error + Send + Sync>>;

fn lookup(store: &ResultStore, id: &str) -> Result<Arc<StoredResult>, Box<dyn Error + Send + Sync>> {
    store
        .get(id)
        .ok_or_else(|| format!("result '{}' not found", id).into())
}

fn expect_kind(
    result: &StoredResult,
    wanted: ResultKind,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    if result.kind == wanted {
        Ok(())
    } else {
        Err(format!(
            "result '{}' is {}, not {}",
            result.id,
            result.kind.as_str(),
            wanted.as_str()
        )
        .into())
    }
}

/// Navigate a dotted path into a parsed structure. Integer components
/// index arrays; everything else is treated as an object key.
fn navigate<'a>(
    root: &'a Value,
    path: &str,
    id: &str,
) -> Result<&'a Value, Box<dyn Error + Send + Sync>> {
    let mut current = root;
    if path.is_empty() {
        return Ok(current);
    }
    for component in path.split('.') {
        current = match current {
            Value::Array(items) => {
                let index: usize = component.parse().map_err(|_| {
                    format!(
                        "path component '{}' must be an index into an array in result '{}'",
                        component, id
                    )
                })?;
                items.get(index).ok_or_else(|| {
                    format!(
                        "index {} out of range ({} items) in result '{}'",
                        index,
                        items.len(),
                        id
                    )
                })?
            }
            Value::Object(map) => map.get(component).ok_or_else(|| {
                format!("key '{}' not found in result '{}'", component, id)
            })?,
            _ => {
                return Err(format!(
                    "path component '{}' cannot descend into a scalar in result '{}'",
                    component, id
                )
                .into())
            }
        };
    }
    Ok(current)
}

// ---------------------------------------------------------------------------
// result_info
// ---------------------------------------------------------------------------

/// Echo a stored result's type, size, and id.
pub struct ResultInfoTool {
    store: Arc<ResultStore>,
}

#[async_trait]
impl Tool for ResultInfoTool {
    fn name(&self) -> &str {
        "result_info"
    }

    fn description(&self) -> &str {
        "Show the type and size of a stored result."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![FieldSpec::new("id", FieldType::String).required()]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let input = parse_object_input(input)?;
        let id = require_str(&input, "id")?;
        let result = lookup(&self.store, id)?;
        Ok(json!({
            "id": result.id,
            "type": result.kind.as_str(),
            "size": result.size,
        })
        .to_string())
    }
}

// ---------------------------------------------------------------------------
// result_items
// ---------------------------------------------------------------------------

/// Slice a stored array. Out-of-range offsets return an empty array.
pub struct ResultItemsTool {
    store: Arc<ResultStore>,
}

#[async_trait]
impl Tool for ResultItemsTool {
    fn name(&self) -> &str {
        "result_items"
    }

    fn description(&self) -> &str {
        "Return a slice of a stored array result."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("id", FieldType::String).required(),
            FieldSpec::new("offset", FieldType::Integer),
            FieldSpec::new("count", FieldType::Integer),
        ]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let input = parse_object_input(input)?;
        let id = require_str(&input, "id")?;
        let offset = optional_usize(&input, "offset")?.unwrap_or(0);
        let count = optional_usize(&input, "count")?.unwrap_or(10);
        let result = lookup(&self.store, id)?;
        expect_kind(&result, ResultKind::Array)?;
        let items = result
            .parsed
            .as_ref()
            .and_then(Value::as_array)
            .ok_or_else(|| format!("result '{}' has no parsed array", id))?;
        let slice: &[Value] = if offset >= items.len() {
            &[]
        } else {
            &items[offset..(offset + count).min(items.len())]
        };
        Ok(serde_json::to_string(slice)?)
    }
}

// ---------------------------------------------------------------------------
// result_get
// ---------------------------------------------------------------------------

/// Dotted-path navigation into a stored object or array.
pub struct ResultGetTool {
    store: Arc<ResultStore>,
}

#[async_trait]
impl Tool for ResultGetTool {
    fn name(&self) -> &str {
        "result_get"
    }

    fn description(&self) -> &str {
        "Get the value at a dotted path inside a stored object or array result."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("id", FieldType::String).required(),
            FieldSpec::new("path", FieldType::String)
                .required()
                .with_description("dotted path; integers index arrays"),
        ]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let input = parse_object_input(input)?;
        let id = require_str(&input, "id")?;
        let path = require_str(&input, "path")?;
        let result = lookup(&self.store, id)?;
        let root = result
            .parsed
            .as_ref()
            .ok_or_else(|| format!("result '{}' is text; use result_chunk", id))?;
        let value = navigate(root, path, id)?;
        Ok(serde_json::to_string(value)?)
    }
}

// ---------------------------------------------------------------------------
// result_keys
// ---------------------------------------------------------------------------

/// Key list of a stored object, optionally at a nested path.
pub struct ResultKeysTool {
    store: Arc<ResultStore>,
}

#[async_trait]
impl Tool for ResultKeysTool {
    fn name(&self) -> &str {
        "result_keys"
    }

    fn description(&self) -> &str {
        "List the keys of a stored object result, optionally at a nested path."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("id", FieldType::String).required(),
            FieldSpec::new("path", FieldType::String),
        ]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let input = parse_object_input(input)?;
        let id = require_str(&input, "id")?;
        let path = input
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let result = lookup(&self.store, id)?;
        let root = result
            .parsed
            .as_ref()
            .ok_or_else(|| format!("result '{}' is text; use result_chunk", id))?;
        let value = navigate(root, path, id)?;
        let map = value.as_object().ok_or_else(|| {
            format!(
                "value at path '{}' in result '{}' is not an object",
                path, id
            )
        })?;
        let keys: Vec<&String> = map.keys().collect();
        Ok(serde_json::to_string(&keys)?)
    }
}

// ---------------------------------------------------------------------------
// result_chunk
// ---------------------------------------------------------------------------

/// Byte range of a stored text result.
pub struct ResultChunkTool {
    store: Arc<ResultStore>,
}

#[async_trait]
impl Tool for ResultChunkTool {
    fn name(&self) -> &str {
        "result_chunk"
    }

    fn description(&self) -> &str {
        "Read a byte range of a stored text result."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("id", FieldType::String).required(),
            FieldSpec::new("offset", FieldType::Integer),
            FieldSpec::new("length", FieldType::Integer),
        ]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let input = parse_object_input(input)?;
        let id = require_str(&input, "id")?;
        let offset = optional_usize(&input, "offset")?.unwrap_or(0);
        let length = optional_usize(&input, "length")?.unwrap_or(4096);
        let result = lookup(&self.store, id)?;
        expect_kind(&result, ResultKind::Text)?;
        let bytes = result.raw.as_bytes();
        if offset >= bytes.len() {
            return Ok(String::new());
        }
        let end = (offset + length).min(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[offset..end]).into_owned())
    }
}

// ---------------------------------------------------------------------------
// result_to_dataset
// ---------------------------------------------------------------------------

/// Promote a stored array result into a named dataset.
///
/// Only available in mission context: the tool fails when no dataset
/// store is attached.
pub struct ResultToDatasetTool {
    store: Arc<ResultStore>,
    datasets: Option<Arc<dyn DatasetStore>>,
}

#[async_trait]
impl Tool for ResultToDatasetTool {
    fn name(&self) -> &str {
        "result_to_dataset"
    }

    fn description(&self) -> &str {
        "Promote a stored array result to a named dataset."
    }

    fn parameters(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("id", FieldType::String).required(),
            FieldSpec::new("dataset_name", FieldType::String).required(),
        ]
    }

    async fn call(&self, input: &str) -> ToolResult {
        let datasets = self
            .datasets
            .as_ref()
            .ok_or("no dataset store attached; result_to_dataset is only available inside a mission")?;
        let input = parse_object_input(input)?;
        let id = require_str(&input, "id")?;
        let dataset_name = require_str(&input, "dataset_name")?;
        let result = lookup(&self.store, id)?;
        expect_kind(&result, ResultKind::Array)?;
        let items = result
            .parsed
            .as_ref()
            .and_then(Value::as_array)
            .ok_or_else(|| format!("result '{}' has no parsed array", id))?;
        let count = items.len();
        datasets
            .create(Dataset::new(dataset_name).with_records(items.clone()))
            .await?;
        Ok(format!(
            "dataset '{}' created with {} records",
            dataset_name, count
        ))
    }
}

/// Install the full `result_*` tool family into `tools`, all bound to the
/// same result store. `datasets` enables `result_to_dataset`.
pub fn install_result_tools(
    tools: &mut ToolMap,
    store: Arc<ResultStore>,
    datasets: Option<Arc<dyn DatasetStore>>,
) {
    let entries: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ResultInfoTool {
            store: Arc::clone(&store),
        }),
        Arc::new(ResultItemsTool {
            store: Arc::clone(&store),
        }),
        Arc::new(ResultGetTool {
            store: Arc::clone(&store),
        }),
        Arc::new(ResultKeysTool {
            store: Arc::clone(&store),
        }),
        Arc::new(ResultChunkTool {
            store: Arc::clone(&store),
        }),
        Arc::new(ResultToDatasetTool { store, datasets }),
    ];
    for tool in entries {
        tools.insert(tool.name().to_string(), tool);
    }
}
