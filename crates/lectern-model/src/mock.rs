// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::{CompletionProvider, EventStream, ModelError},
    CompletionRequest, StopReason, StreamEvent,
};

/// A pre-scripted provider.  Each call to `stream` pops the next event
/// script from the front of the queue, so tests can specify exact event
/// sequences — including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    /// When > 0, the next `stream` calls fail with `Unavailable` before
    /// consuming a script.  Used to exercise the orchestrator's retry.
    failures: Arc<Mutex<u32>>,
    /// The last request seen, for test inspection.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    /// The outer `Vec` is the ordered list of calls; the inner `Vec` is the
    /// event sequence emitted for that call.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            failures: Arc::new(Mutex::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider that streams one text reply, split into
    /// word-sized deltas.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        let mut events: Vec<StreamEvent> = r
            .split_inclusive(' ')
            .map(|w| StreamEvent::ContentDelta(w.to_string()))
            .collect();
        events.push(StreamEvent::Usage {
            prompt_tokens: 5,
            completion_tokens: 5,
        });
        events.push(StreamEvent::Done {
            stop_reason: StopReason::EndTurn,
        });
        Self::new(vec![events])
    }

    /// Convenience: a tool-call round followed by a text round.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let id = tool_id.into();
        Self::new(vec![
            vec![
                StreamEvent::ToolCallStart {
                    id: id.clone(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                StreamEvent::ToolCallEnd { id },
                StreamEvent::Done {
                    stop_reason: StopReason::ToolCalls,
                },
            ],
            vec![
                StreamEvent::ContentDelta(final_text.into()),
                StreamEvent::Usage {
                    prompt_tokens: 10,
                    completion_tokens: 10,
                },
                StreamEvent::Done {
                    stop_reason: StopReason::EndTurn,
                },
            ],
        ])
    }

    /// Fail the next `n` `stream` calls with a retryable error.
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock().unwrap() = n;
    }

    /// Number of scripts not yet consumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ModelError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ModelError::Unavailable("scripted failure".into()));
            }
        }
        *self.last_request.lock().unwrap() = Some(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    StreamEvent::ContentDelta("[no more scripts]".into()),
                    StreamEvent::Done {
                        stop_reason: StopReason::EndTurn,
                    },
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<Result<StreamEvent, ModelError>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::TranscriptMessage;

    fn req() -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages: vec![TranscriptMessage::user("hi")],
            ..Default::default()
        }
    }

    async fn collect(p: &ScriptedProvider) -> Vec<StreamEvent> {
        let mut s = p.stream(req()).await.unwrap();
        let mut out = Vec::new();
        while let Some(ev) = s.next().await {
            out.push(ev.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn always_text_streams_deltas_then_done() {
        let p = ScriptedProvider::always_text("hello streaming world");
        let events = collect(&p).await;
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello streaming world");
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done { stop_reason: StopReason::EndTurn })
        ));
    }

    #[tokio::test]
    async fn tool_then_text_uses_two_rounds() {
        let p = ScriptedProvider::tool_then_text("c1", "calculator", r#"{"a":2,"b":2}"#, "4");
        let round1 = collect(&p).await;
        assert!(matches!(
            round1.last(),
            Some(StreamEvent::Done { stop_reason: StopReason::ToolCalls })
        ));
        let round2 = collect(&p).await;
        assert!(round2
            .iter()
            .any(|e| matches!(e, StreamEvent::ContentDelta(t) if t == "4")));
    }

    #[tokio::test]
    async fn fail_next_then_recovers() {
        let p = ScriptedProvider::always_text("ok");
        p.fail_next(1);
        assert!(p.stream(req()).await.is_err());
        assert!(p.stream(req()).await.is_ok());
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back() {
        let p = ScriptedProvider::new(vec![]);
        let events = collect(&p).await;
        assert!(matches!(&events[0], StreamEvent::ContentDelta(t) if t.contains("no more scripts")));
    }

    #[tokio::test]
    async fn last_request_records_transcript() {
        let p = ScriptedProvider::always_text("ok");
        let _ = collect(&p).await;
        let last = p.last_request.lock().unwrap();
        assert_eq!(last.as_ref().unwrap().messages.len(), 1);
    }
}
