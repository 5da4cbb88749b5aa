// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    Validation(String),

    #[error("tool deadline exceeded after {0:?}")]
    Timeout(std::time::Duration),

    #[error("tool failed: {0}")]
    Failed(String),
}

/// Coarse execution-cost hint surfaced alongside each descriptor so the
/// orchestrator (or an operator UI) can weigh invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostHint {
    #[default]
    Cheap,
    Moderate,
    Expensive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
    pub cost_hint: CostHint,
}

/// Trait every tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters.
    fn parameters_schema(&self) -> Value;
    fn cost_hint(&self) -> CostHint {
        CostHint::Cheap
    }
    /// Execute with already-validated arguments.  Implementations report
    /// their own failures through [`ToolError::Failed`].
    async fn invoke(&self, args: &Value) -> Result<Value, ToolError>;
}
