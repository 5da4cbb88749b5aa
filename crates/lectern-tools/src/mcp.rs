// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! MCP stdio transport (feature `mcp-server`).
//!
//! Speaks newline-delimited JSON-RPC 2.0 over stdin/stdout and exposes the
//! registry's `tools/list` and `tools/call` methods to external MCP clients.
//! The server is stateless: every call executes in isolation; the client
//! manages its own conversation context.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::registry::ToolRegistry;
use crate::tool::ToolError;

const PROTOCOL_VERSION: &str = "2024-11-05";
/// Per-call deadline when serving external clients.
const CALL_DEADLINE: Duration = Duration::from_secs(30);

/// Serve the registry over stdin/stdout until EOF.
pub async fn serve_stdio(registry: Arc<ToolRegistry>) -> std::io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!("invalid JSON-RPC frame: {e}");
                continue;
            }
        };
        // Notifications (no id) need no reply.
        let Some(id) = request.get("id").cloned() else {
            continue;
        };
        let response = handle_request(&registry, &request, id).await;
        let mut frame = serde_json::to_vec(&response)?;
        frame.push(b'\n');
        stdout.write_all(&frame).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn handle_request(registry: &ToolRegistry, request: &Value, id: Value) -> Value {
    let method = request["method"].as_str().unwrap_or_default();
    debug!(method, "MCP request");
    match method {
        "initialize" => reply(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "lectern", "version": env!("CARGO_PKG_VERSION") },
            }),
        ),
        "ping" => reply(id, json!({})),
        "tools/list" => {
            let tools: Vec<Value> = registry
                .list()
                .into_iter()
                .map(|d| {
                    json!({
                        "name": d.name,
                        "description": d.description,
                        "inputSchema": d.parameters,
                    })
                })
                .collect();
            reply(id, json!({ "tools": tools }))
        }
        "tools/call" => {
            let name = request["params"]["name"].as_str().unwrap_or_default();
            let args = request["params"]["arguments"].clone();
            let args = if args.is_object() { args } else { json!({}) };
            match registry.invoke(name, args, CALL_DEADLINE).await {
                Ok(result) => reply(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": result.to_string() }],
                        "isError": false,
                    }),
                ),
                Err(e @ ToolError::NotFound(_)) => error_reply(id, -32601, &e.to_string()),
                Err(e @ ToolError::Validation(_)) => error_reply(id, -32602, &e.to_string()),
                Err(e) => reply(
                    id,
                    json!({
                        "content": [{ "type": "text", "text": e.to_string() }],
                        "isError": true,
                    }),
                ),
            }
        }
        _ => error_reply(id, -32601, &format!("method not found: {method}")),
    }
}

fn reply(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_reply(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::with_builtins()
    }

    #[tokio::test]
    async fn initialize_advertises_tools_capability() {
        let req = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        let resp = handle_request(&registry(), &req, json!(1)).await;
        assert!(resp["result"]["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_includes_calculator_schema() {
        let req = json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"});
        let resp = handle_request(&registry(), &req, json!(2)).await;
        let tools = resp["result"]["tools"].as_array().unwrap();
        assert!(tools
            .iter()
            .any(|t| t["name"] == "calculator" && t["inputSchema"]["type"] == "object"));
    }

    #[tokio::test]
    async fn tools_call_executes() {
        let req = json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": { "name": "calculator", "arguments": { "a": 2, "b": 2 } },
        });
        let resp = handle_request(&registry(), &req, json!(3)).await;
        assert_eq!(resp["result"]["isError"], false);
        assert_eq!(resp["result"]["content"][0]["text"], "4");
    }

    #[tokio::test]
    async fn unknown_tool_maps_to_method_not_found_code() {
        let req = json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": { "name": "nope", "arguments": {} },
        });
        let resp = handle_request(&registry(), &req, json!(4)).await;
        assert_eq!(resp["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn tool_failure_is_an_in_band_error_result() {
        let req = json!({
            "jsonrpc": "2.0", "id": 5, "method": "tools/call",
            "params": { "name": "calculator", "arguments": { "a": 1, "b": 0, "op": "divide" } },
        });
        let resp = handle_request(&registry(), &req, json!(5)).await;
        assert_eq!(resp["result"]["isError"], true);
    }
}
