// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! OpenAI-compatible `/chat/completions` streaming adapter.
//!
//! The wire format reports tool calls as indexed argument fragments; this
//! adapter converts them into the ordered `ToolCallStart` / `ToolCallDelta` /
//! `ToolCallEnd` event protocol.  SSE events can be split across TCP packets,
//! so a line buffer is maintained across chunks and only complete lines are
//! parsed.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    provider::{CompletionProvider, EventStream, ModelError},
    CompletionRequest, Role, StopReason, StreamEvent, TranscriptMessage,
};

pub struct OpenAICompatProvider {
    name: String,
    /// Full chat completions URL.
    chat_url: String,
    /// Pre-resolved API key; `None` for local servers.
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    /// `base_url` ends before `/chat/completions`, e.g. `http://localhost:11434/v1`.
    pub fn new(name: impl Into<String>, base_url: &str, api_key: Option<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            name: name.into(),
            chat_url: format!("{base}/chat/completions"),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ModelError> {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": req.model,
            "messages": build_wire_messages(&req.messages),
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(mt) = req.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            provider = %self.name,
            model = %req.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .map_err(|e| ModelError::Unavailable(format!("completion request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return if status.is_client_error() && status.as_u16() != 429 {
                Err(ModelError::Invalid(format!("provider error {status}: {text}")))
            } else {
                Err(ModelError::Unavailable(format!(
                    "provider error {status}: {text}"
                )))
            };
        }

        let mut bytes = resp.bytes_stream();
        let stream = async_stream::stream! {
            let mut buf = String::new();
            let mut state = SseState::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(ModelError::Unavailable(format!("stream read failed: {e}")));
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(nl) = buf.find('\n') {
                    let line = buf[..nl].trim_end_matches('\r').to_string();
                    buf.drain(..=nl);
                    for ev in state.parse_line(&line) {
                        yield Ok(ev);
                    }
                }
            }
            // Connection closed without a terminal chunk: synthesize Done so
            // consumers always observe exactly one.
            if !state.done {
                yield Ok(StreamEvent::Done { stop_reason: StopReason::EndTurn });
            }
        };
        Ok(Box::pin(stream))
    }
}

/// Parser state carried across SSE lines: open tool calls by wire index and
/// whether a terminal event was already emitted.
#[derive(Default)]
struct SseState {
    /// `(wire index, call id)` for calls that have started but not ended.
    open: Vec<(u64, String)>,
    done: bool,
}

impl SseState {
    fn parse_line(&mut self, line: &str) -> Vec<StreamEvent> {
        let data = match line.strip_prefix("data: ") {
            Some(d) => d.trim(),
            None => return Vec::new(),
        };
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            if self.done {
                return Vec::new();
            }
            self.done = true;
            let mut out = self.close_open_calls();
            out.push(StreamEvent::Done {
                stop_reason: StopReason::EndTurn,
            });
            return out;
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        self.parse_chunk(&v)
    }

    fn parse_chunk(&mut self, v: &Value) -> Vec<StreamEvent> {
        let mut out = Vec::new();

        // Usage-only chunk (stream_options.include_usage = true).
        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            out.push(StreamEvent::Usage {
                prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            });
            return out;
        }

        let choice = &v["choices"][0];
        let delta = &choice["delta"];

        // Tool-call fragment.  The first fragment for a wire index carries
        // id and name; later fragments carry only argument text.
        if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
            let index = tc["index"].as_u64().unwrap_or(0);
            let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
            match self.open.iter().find(|(i, _)| *i == index) {
                Some((_, id)) => out.push(StreamEvent::ToolCallDelta {
                    id: id.clone(),
                    arguments: args,
                }),
                None => {
                    let id = tc["id"].as_str().unwrap_or("").to_string();
                    let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
                    // Calls the wire never names cannot be dispatched later;
                    // a synthetic id keeps the start/delta/end pairing intact.
                    let id = if id.is_empty() {
                        format!("call_{index}")
                    } else {
                        id
                    };
                    self.open.push((index, id.clone()));
                    out.push(StreamEvent::ToolCallStart {
                        id,
                        name,
                        arguments: args,
                    });
                }
            }
        }

        // Thinking delta: `reasoning_content` (llama.cpp, DeepSeek) or
        // `reasoning` (OpenRouter).
        let thinking = delta
            .get("reasoning_content")
            .and_then(|c| c.as_str())
            .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
        if let Some(t) = thinking {
            if !t.is_empty() {
                out.push(StreamEvent::ThinkingDelta(t.to_string()));
            }
        }

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                out.push(StreamEvent::ContentDelta(text.to_string()));
            }
        }

        match choice["finish_reason"].as_str() {
            Some("tool_calls") => {
                self.done = true;
                out.extend(self.close_open_calls());
                out.push(StreamEvent::Done {
                    stop_reason: StopReason::ToolCalls,
                });
            }
            Some("stop") => {
                self.done = true;
                out.extend(self.close_open_calls());
                out.push(StreamEvent::Done {
                    stop_reason: StopReason::EndTurn,
                });
            }
            Some("length") => {
                self.done = true;
                out.extend(self.close_open_calls());
                out.push(StreamEvent::Done {
                    stop_reason: StopReason::MaxTokens,
                });
            }
            _ => {}
        }

        out
    }

    /// Emit `ToolCallEnd` for every open call, wire-index order.
    fn close_open_calls(&mut self) -> Vec<StreamEvent> {
        let mut open = std::mem::take(&mut self.open);
        open.sort_by_key(|(i, _)| *i);
        open.into_iter()
            .map(|(_, id)| StreamEvent::ToolCallEnd { id })
            .collect()
    }
}

/// Convert transcript messages into the OpenAI wire-format JSON array.
fn build_wire_messages(messages: &[TranscriptMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
                "content": m.content,
            }),
            Role::Assistant if !m.tool_calls.is_empty() => {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": { "name": c.name, "arguments": c.arguments },
                        })
                    })
                    .collect();
                json!({ "role": "assistant", "content": m.content, "tool_calls": calls })
            }
            role => json!({ "role": role_str(role), "content": m.content }),
        })
        .collect()
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> String {
        format!("data: {s}")
    }

    #[test]
    fn content_delta_parses() {
        let mut st = SseState::default();
        let evs = st.parse_line(&line(
            r#"{"choices":[{"delta":{"content":"hello"},"finish_reason":null}]}"#,
        ));
        assert_eq!(evs, vec![StreamEvent::ContentDelta("hello".into())]);
    }

    #[test]
    fn comment_and_blank_lines_are_ignored() {
        let mut st = SseState::default();
        assert!(st.parse_line(": heartbeat").is_empty());
        assert!(st.parse_line("").is_empty());
        assert!(st.parse_line("data: ").is_empty());
    }

    #[test]
    fn tool_call_start_then_delta_then_end() {
        let mut st = SseState::default();
        let start = st.parse_line(&line(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"calculator","arguments":"{\"a\""}}]},"finish_reason":null}]}"#,
        ));
        assert_eq!(
            start,
            vec![StreamEvent::ToolCallStart {
                id: "call_1".into(),
                name: "calculator".into(),
                arguments: "{\"a\"".into(),
            }]
        );
        let delta = st.parse_line(&line(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":2}"}}]},"finish_reason":null}]}"#,
        ));
        assert_eq!(
            delta,
            vec![StreamEvent::ToolCallDelta {
                id: "call_1".into(),
                arguments: ":2}".into(),
            }]
        );
        let end = st.parse_line(&line(
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ));
        assert_eq!(
            end,
            vec![
                StreamEvent::ToolCallEnd { id: "call_1".into() },
                StreamEvent::Done { stop_reason: StopReason::ToolCalls },
            ]
        );
    }

    #[test]
    fn done_sentinel_after_finish_is_suppressed() {
        let mut st = SseState::default();
        st.parse_line(&line(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#));
        assert!(st.parse_line("data: [DONE]").is_empty());
    }

    #[test]
    fn bare_done_sentinel_emits_end_turn() {
        let mut st = SseState::default();
        let evs = st.parse_line("data: [DONE]");
        assert_eq!(
            evs,
            vec![StreamEvent::Done { stop_reason: StopReason::EndTurn }]
        );
    }

    #[test]
    fn usage_chunk_parses() {
        let mut st = SseState::default();
        let evs = st.parse_line(&line(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34}}"#,
        ));
        assert_eq!(
            evs,
            vec![StreamEvent::Usage { prompt_tokens: 12, completion_tokens: 34 }]
        );
    }

    #[test]
    fn finish_reason_length_maps_to_max_tokens() {
        let mut st = SseState::default();
        let evs = st.parse_line(&line(r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#));
        assert_eq!(
            evs,
            vec![StreamEvent::Done { stop_reason: StopReason::MaxTokens }]
        );
    }

    #[test]
    fn parallel_tool_calls_close_in_index_order() {
        let mut st = SseState::default();
        st.parse_line(&line(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"t2","arguments":""}}]},"finish_reason":null}]}"#,
        ));
        st.parse_line(&line(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"a","function":{"name":"t1","arguments":""}}]},"finish_reason":null}]}"#,
        ));
        let end = st.parse_line(&line(
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ));
        assert_eq!(
            end,
            vec![
                StreamEvent::ToolCallEnd { id: "a".into() },
                StreamEvent::ToolCallEnd { id: "b".into() },
                StreamEvent::Done { stop_reason: StopReason::ToolCalls },
            ]
        );
    }

    #[test]
    fn wire_messages_carry_tool_results() {
        let msgs = vec![
            TranscriptMessage::system("sys"),
            TranscriptMessage::assistant_tool_calls(vec![crate::ToolCallRequest {
                id: "c1".into(),
                name: "calculator".into(),
                arguments: "{}".into(),
            }]),
            TranscriptMessage::tool_result("c1", "4"),
        ];
        let wire = build_wire_messages(&msgs);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["tool_calls"][0]["id"], "c1");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "c1");
    }

    #[tokio::test]
    async fn unreachable_server_is_retryable() {
        let p = OpenAICompatProvider::new("test", "http://127.0.0.1:1/v1", None);
        let err = p
            .stream(CompletionRequest {
                model: "m".into(),
                messages: vec![TranscriptMessage::user("hi")],
                ..Default::default()
            })
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
    }
}
