// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;

use serde_json::Value;

use crate::tool::ToolError;

/// Validate model-supplied arguments against a tool's JSON schema.
///
/// Checks required parameters, rejects unknown ones when the schema
/// enumerates properties, and coerces string values to the declared scalar
/// type where a safe interpretation exists (models frequently quote
/// numbers and booleans).  Coercion goes through a YAML parse, which
/// accepts `"42"`, `"4.5"`, `"true"` but not `"4x2"`.
pub fn validate_arguments(
    schema: &Value,
    arguments: &BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, ToolError> {
    let properties = schema.get("properties").and_then(|p| p.as_object());

    // required parameters must be present
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|r| r.as_str()) {
            if !arguments.contains_key(name) {
                return Err(ToolError::Parsing(format!(
                    "missing required parameter '{name}'"
                )));
            }
        }
    }

    let mut validated = BTreeMap::new();
    for (name, value) in arguments {
        let declared = match properties {
            Some(props) => match props.get(name) {
                Some(decl) => Some(decl),
                None => {
                    return Err(ToolError::Parsing(format!(
                        "unexpected parameter '{name}'"
                    )))
                }
            },
            None => None,
        };

        let coerced = match declared.and_then(|d| d.get("type")).and_then(|t| t.as_str()) {
            Some(ty) => coerce(name, value, ty)?,
            None => value.clone(),
        };
        validated.insert(name.clone(), coerced);
    }

    Ok(validated)
}

fn coerce(name: &str, value: &Value, ty: &str) -> Result<Value, ToolError> {
    let mismatch = |expected: &str| {
        ToolError::Parsing(format!(
            "parameter '{name}' expected {expected}, got {value}"
        ))
    };

    match ty {
        "string" => match value {
            Value::String(_) => Ok(value.clone()),
            // models sometimes emit bare scalars for string params
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(mismatch("a string")),
        },
        "integer" => match value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::String(s) => match yaml_scalar(s) {
                Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(Value::Number(n)),
                _ => Err(mismatch("an integer")),
            },
            _ => Err(mismatch("an integer")),
        },
        "number" => match value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(s) => match yaml_scalar(s) {
                Some(Value::Number(n)) => Ok(Value::Number(n)),
                _ => Err(mismatch("a number")),
            },
            _ => Err(mismatch("a number")),
        },
        "boolean" => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match yaml_scalar(s) {
                Some(Value::Bool(b)) => Ok(Value::Bool(b)),
                _ => Err(mismatch("a boolean")),
            },
            _ => Err(mismatch("a boolean")),
        },
        "array" => match value {
            Value::Array(_) => Ok(value.clone()),
            _ => Err(mismatch("an array")),
        },
        "object" => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err(mismatch("an object")),
        },
        _ => Ok(value.clone()),
    }
}

/// Parse a string as a YAML scalar and return its JSON rendering.
fn yaml_scalar(s: &str) -> Option<Value> {
    let parsed: serde_yaml::Value = serde_yaml::from_str(s).ok()?;
    serde_json::to_value(parsed).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
