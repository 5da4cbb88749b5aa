// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use lectern_store::Citation;

/// Events emitted by the orchestrator toward the gateway.  The gateway
/// forwards them unchanged on the SSE stream: [`ChatEvent::name`] becomes
/// the event name, the serialized variant the data payload.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ChatEvent {
    MessageStart {
        message_id: Uuid,
    },
    ContentDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        arguments: String,
    },
    ToolCallExecuting {
        id: String,
    },
    ToolCallResult {
        id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    MessageComplete {
        message_id: Uuid,
        prompt_tokens: u32,
        completion_tokens: u32,
        citations: Vec<Citation>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ChatEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::MessageStart { .. } => "message_start",
            ChatEvent::ContentDelta { .. } => "content_delta",
            ChatEvent::ThinkingDelta { .. } => "thinking_delta",
            ChatEvent::ToolCallStart { .. } => "tool_call_start",
            ChatEvent::ToolCallDelta { .. } => "tool_call_delta",
            ChatEvent::ToolCallExecuting { .. } => "tool_call_executing",
            ChatEvent::ToolCallResult { .. } => "tool_call_result",
            ChatEvent::MessageComplete { .. } => "message_complete",
            ChatEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChatEvent::MessageComplete { .. } | ChatEvent::Error { .. }
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_the_streaming_protocol() {
        assert_eq!(
            ChatEvent::MessageStart { message_id: Uuid::new_v4() }.name(),
            "message_start"
        );
        assert_eq!(ChatEvent::ContentDelta { text: "x".into() }.name(), "content_delta");
        assert_eq!(
            ChatEvent::ToolCallExecuting { id: "c".into() }.name(),
            "tool_call_executing"
        );
        assert_eq!(
            ChatEvent::Error { code: "X".into(), message: "m".into() }.name(),
            "error"
        );
    }

    #[test]
    fn payload_serializes_without_a_tag() {
        let ev = ChatEvent::ContentDelta { text: "hi".into() };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json, serde_json::json!({ "text": "hi" }));
    }

    #[test]
    fn terminal_classification() {
        assert!(ChatEvent::Error { code: "E".into(), message: String::new() }.is_terminal());
        assert!(!ChatEvent::ContentDelta { text: String::new() }.is_terminal());
    }
}
