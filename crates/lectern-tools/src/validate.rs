// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Minimal JSON-Schema argument validation.
//!
//! Covers the subset the built-in tools and typical MCP descriptors use:
//! top-level `type: object`, `required` members, and per-property `type`
//! checks (including `integer` vs `number`).  Anything the schema does not
//! constrain passes through untouched.

use serde_json::Value;

use crate::tool::ToolError;

pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    if schema.get("type").and_then(|t| t.as_str()) == Some("object") && !args.is_object() {
        return Err(ToolError::Validation(format!(
            "arguments must be an object, got {}",
            type_name(args)
        )));
    }

    let props = schema.get("properties").and_then(|p| p.as_object());

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if args.get(key).is_none() {
                return Err(ToolError::Validation(format!(
                    "missing required argument: {key}"
                )));
            }
        }
    }

    if let (Some(props), Some(obj)) = (props, args.as_object()) {
        for (key, value) in obj {
            let Some(prop_schema) = props.get(key) else {
                continue;
            };
            if let Some(expected) = prop_schema.get("type").and_then(|t| t.as_str()) {
                if !type_matches(expected, value) {
                    return Err(ToolError::Validation(format!(
                        "argument {key} must be {expected}, got {}",
                        type_name(value)
                    )));
                }
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "number" },
                "b": { "type": "number" },
                "op": { "type": "string" },
            },
            "required": ["a", "b"],
        })
    }

    #[test]
    fn valid_args_pass() {
        assert!(validate_args(&schema(), &json!({"a": 1, "b": 2.5})).is_ok());
    }

    #[test]
    fn missing_required_fails() {
        let err = validate_args(&schema(), &json!({"a": 1})).unwrap_err();
        assert!(matches!(err, ToolError::Validation(m) if m.contains("b")));
    }

    #[test]
    fn wrong_type_fails() {
        let err = validate_args(&schema(), &json!({"a": "one", "b": 2})).unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[test]
    fn non_object_args_fail_for_object_schema() {
        let err = validate_args(&schema(), &json!([1, 2])).unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[test]
    fn extra_properties_are_allowed() {
        assert!(validate_args(&schema(), &json!({"a": 1, "b": 2, "note": "x"})).is_ok());
    }

    #[test]
    fn integer_is_not_a_string() {
        let s = json!({"type": "object", "properties": {"x": {"type": "integer"}}});
        assert!(validate_args(&s, &json!({"x": 3})).is_ok());
        assert!(validate_args(&s, &json!({"x": 3.5})).is_err());
    }
}
