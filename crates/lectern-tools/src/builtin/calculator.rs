// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{Tool, ToolError};

/// Binary arithmetic over two operands.  `op` defaults to `add`.
pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Perform basic arithmetic on two numbers (add, subtract, multiply, divide)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "number", "description": "First operand" },
                "b": { "type": "number", "description": "Second operand" },
                "op": {
                    "type": "string",
                    "description": "Operation: add | subtract | multiply | divide",
                },
            },
            "required": ["a", "b"],
        })
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let a = args["a"].as_f64().unwrap_or(0.0);
        let b = args["b"].as_f64().unwrap_or(0.0);
        let op = args["op"].as_str().unwrap_or("add");
        let result = match op {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" => {
                if b == 0.0 {
                    return Err(ToolError::Failed("division by zero".into()));
                }
                a / b
            }
            other => {
                return Err(ToolError::Validation(format!("unknown operation: {other}")));
            }
        };
        // Integral results render without a trailing ".0" so the model can
        // quote them verbatim.
        if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
            Ok(json!(result as i64))
        } else {
            Ok(json!(result))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn adds_by_default() {
        let out = CalculatorTool.invoke(&json!({"a": 2, "b": 2})).await.unwrap();
        assert_eq!(out, json!(4));
    }

    #[tokio::test]
    async fn divide_by_zero_fails() {
        let err = CalculatorTool
            .invoke(&json!({"a": 1, "b": 0, "op": "divide"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed(_)));
    }

    #[tokio::test]
    async fn fractional_results_stay_floats() {
        let out = CalculatorTool
            .invoke(&json!({"a": 1, "b": 2, "op": "divide"}))
            .await
            .unwrap();
        assert_eq!(out, json!(0.5));
    }

    #[tokio::test]
    async fn unknown_op_is_a_validation_error() {
        let err = CalculatorTool
            .invoke(&json!({"a": 1, "b": 2, "op": "modulo"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }
}
