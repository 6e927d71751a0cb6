//! Typed field schemas shared by tool parameters, mission inputs, dataset
//! records, and task output blocks.
//!
//! A [`FieldSpec`] is the single declaration shape used everywhere a config
//! names a field: `tool.inputs`, `mission.input`, `dataset.schema`, and
//! `task.output`. [`FieldType`] mirrors the JSON type system.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The JSON-ish type of a declared field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    /// Short lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Array => "array",
            FieldType::Object => "object",
        }
    }

    /// Whether `value` inhabits this type.
    ///
    /// `Integer` accepts any JSON number without a fractional part;
    /// `Number` accepts all JSON numbers.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }

    /// Coerce a raw string (e.g. a CLI-provided mission input) into a typed
    /// [`Value`].
    ///
    /// Strings pass through untouched. Other types are parsed from their
    /// canonical textual form; arrays and objects are parsed as JSON.
    pub fn coerce(&self, raw: &str) -> Result<Value, String> {
        match self {
            FieldType::String => Ok(Value::String(raw.to_string())),
            FieldType::Integer => raw
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|e| format!("expected integer, got '{}' ({})", raw, e)),
            FieldType::Number => raw
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("expected number, got '{}' ({})", raw, e))
                .and_then(|n| {
                    serde_json::Number::from_f64(n)
                        .map(Value::Number)
                        .ok_or_else(|| format!("non-finite number '{}'", raw))
                }),
            FieldType::Boolean => match raw.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(format!("expected 'true' or 'false', got '{}'", other)),
            },
            FieldType::Array | FieldType::Object => {
                let parsed: Value = serde_json::from_str(raw)
                    .map_err(|e| format!("expected {} as JSON, got: {}", self.as_str(), e))?;
                if self.matches(&parsed) {
                    Ok(parsed)
                } else {
                    Err(format!("expected JSON {}, got another type", self.as_str()))
                }
            }
        }
    }
}

/// Declaration of one named, typed field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    /// Declare a new field with the provided name and type.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            description: None,
            required: false,
        }
    }

    /// Add a human readable description that will surface in rendered
    /// tool documentation.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the field as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Validate a record (a JSON object) against a field schema.
///
/// Required fields must be present and non-null; present fields must match
/// their declared type. Fields not named by the schema are permitted.
pub fn validate_record(
    schema: &[FieldSpec],
    record: &serde_json::Map<String, Value>,
) -> Result<(), String> {
    for field in schema {
        match record.get(&field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    return Err(format!("missing required field '{}'", field.name));
                }
            }
            Some(value) => {
                if !field.field_type.matches(value) {
                    return Err(format!(
                        "field '{}' expected {}, got {}",
                        field.name,
                        field.field_type.as_str(),
                        json_type_name(value)
                    ));
                }
            }
        }
    }
    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerce_typed_inputs() {
        assert_eq!(FieldType::Integer.coerce("42").unwrap(), json!(42));
        assert_eq!(FieldType::Boolean.coerce("true").unwrap(), json!(true));
        assert_eq!(FieldType::String.coerce("7").unwrap(), json!("7"));
        assert!(FieldType::Integer.coerce("4.5").is_err());
        assert_eq!(FieldType::Array.coerce("[1,2]").unwrap(), json!([1, 2]));
    }

    #[test]
    fn record_validation_reports_missing_and_mistyped() {
        let schema = vec![
            FieldSpec::new("url", FieldType::String).required(),
            FieldSpec::new("depth", FieldType::Integer),
        ];
        let ok = json!({"url": "https://example.com", "depth": 2});
        assert!(validate_record(&schema, ok.as_object().unwrap()).is_ok());

        let missing = json!({"depth": 2});
        let err = validate_record(&schema, missing.as_object().unwrap()).unwrap_err();
        assert!(err.contains("url"));

        let mistyped = json!({"url": "x", "depth": "two"});
        let err = validate_record(&schema, mistyped.as_object().unwrap()).unwrap_err();
        assert!(err.contains("depth"));
    }
}
