// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::tool::{Tool, ToolDescriptor, ToolError};
use crate::validate::validate_args;

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in tool set.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(crate::builtin::CalculatorTool);
        reg.register(crate::builtin::CurrentTimeTool);
        reg
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Descriptors for every registered tool, name order.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
                cost_hint: t.cost_hint(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Execute one invocation: resolve the tool, validate arguments against
    /// its schema, and run it under `deadline`.
    ///
    /// May be called concurrently; tools are immutable after registration.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        deadline: Duration,
    ) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        validate_args(&tool.parameters_schema(), &args)?;

        debug!(tool = name, "invoking tool");
        let started = Instant::now();
        match tokio::time::timeout(deadline, tool.invoke(&args)).await {
            Ok(result) => {
                debug!(tool = name, elapsed = ?started.elapsed(), "tool finished");
                result
            }
            Err(_) => {
                warn!(tool = name, ?deadline, "tool deadline exceeded");
                Err(ToolError::Timeout(deadline))
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::tool::CostHint;

    /// Minimal echo tool for registry tests.
    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
            Ok(json!({ "echo": args }))
        }
    }

    /// Tool that never finishes, for deadline tests.
    struct StuckTool;

    #[async_trait]
    impl Tool for StuckTool {
        fn name(&self) -> &str {
            "stuck"
        }
        fn description(&self) -> &str {
            "sleeps forever"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn cost_hint(&self) -> CostHint {
            CostHint::Expensive
        }
        async fn invoke(&self, _args: &Value) -> Result<Value, ToolError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn invoke_known_tool_succeeds() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        let out = reg
            .invoke("echo", json!({"x": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let reg = ToolRegistry::new();
        let err = reg
            .invoke("missing", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn schema_invalid_args_are_rejected_before_execution() {
        let reg = ToolRegistry::with_builtins();
        let err = reg
            .invoke("calculator", json!({"a": "two", "b": 2}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }

    #[tokio::test]
    async fn deadline_is_enforced() {
        let mut reg = ToolRegistry::new();
        reg.register(StuckTool);
        let err = reg
            .invoke("stuck", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[test]
    fn list_is_sorted_and_carries_cost_hints() {
        let mut reg = ToolRegistry::new();
        reg.register(StuckTool);
        reg.register(EchoTool { name: "echo" });
        let list = reg.list();
        assert_eq!(list[0].name, "echo");
        assert_eq!(list[1].name, "stuck");
        assert_eq!(list[1].cost_hint, CostHint::Expensive);
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" });
        reg.register(EchoTool { name: "t" });
        assert_eq!(reg.names().len(), 1);
    }

    #[test]
    fn builtins_include_calculator() {
        let reg = ToolRegistry::with_builtins();
        assert!(reg.names().contains(&"calculator".to_string()));
    }
}
