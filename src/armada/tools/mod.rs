//! The opaque tool contract agents call through, plus documentation
//! rendering for the `{{TOOLS}}` prompt slot.
//!
//! A [`Tool`] receives the raw string the model emitted between
//! `<ACTION_INPUT>` tags and owns its parsing and validation; most tools
//! expect a JSON object and use [`parse_object_input`] for it. Errors
//! returned from [`Tool::call`] are surfaced to the model as observations
//! prefixed `Error:` so it can try a different approach.

pub mod dataset_tools;
pub mod result_access;

use crate::armada::schema::FieldSpec;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

/// A callable capability exposed to an agent or supervisor.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model uses inside `<ACTION>` tags.
    fn name(&self) -> &str;

    /// One-line description surfaced in the system prompt.
    fn description(&self) -> &str;

    /// Declared input fields, used only for prompt documentation.
    fn parameters(&self) -> Vec<FieldSpec> {
        Vec::new()
    }

    /// Execute with the raw `<ACTION_INPUT>` payload.
    async fn call(&self, input: &str) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// Tools keyed by their action name.
pub type ToolMap = HashMap<String, Arc<dyn Tool>>;

/// Insert a tool under its own name.
pub fn register(tools: &mut ToolMap, tool: Arc<dyn Tool>) {
    tools.insert(tool.name().to_string(), tool);
}

/// Parse a tool input as a JSON object, with a readable error for the
/// model when it is not one.
pub fn parse_object_input(input: &str) -> Result<Map<String, Value>, Box<dyn Error + Send + Sync>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!(
            "expected a JSON object as input, got {}",
            match other {
                Value::Array(_) => "an array",
                Value::String(_) => "a string",
                Value::Number(_) => "a number",
                Value::Bool(_) => "a boolean",
                Value::Null => "null",
                Value::Object(_) => unreachable!(),
            }
        )
        .into()),
        Err(e) => Err(format!("input is not valid JSON: {}", e).into()),
    }
}

/// Fetch a required string field from a parsed input object.
pub fn require_str<'a>(
    input: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a str, Box<dyn Error + Send + Sync>> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required string field '{}'", field).into())
}

/// Fetch an optional non-negative integer field.
pub fn optional_usize(
    input: &Map<String, Value>,
    field: &str,
) -> Result<Option<usize>, Box<dyn Error + Send + Sync>> {
    match input.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| format!("field '{}' must be a non-negative integer", field).into()),
    }
}

/// Render tool documentation for the `{{TOOLS}}` prompt slot.
///
/// Tools are listed in name order so prompts are stable across runs.
pub fn render_tool_docs(tools: &ToolMap) -> String {
    let mut names: Vec<&String> = tools.keys().collect();
    names.sort();
    let mut out = String::new();
    for name in names {
        let tool = &tools[name];
        out.push_str(&format!("- {}: {}\n", tool.name(), tool.description()));
        let params = tool.parameters();
        if !params.is_empty() {
            out.push_str("  input fields:\n");
            for p in params {
                out.push_str(&format!(
                    "    - {} ({}{}){}\n",
                    p.name,
                    p.field_type.as_str(),
                    if p.required { ", required" } else { "" },
                    p.description
                        .as_deref()
                        .map(|d| format!(": {}", d))
                        .unwrap_or_default()
                ));
            }
        }
    }
    if out.is_empty() {
        out.push_str("(no tools available)\n");
    }
    out
}
