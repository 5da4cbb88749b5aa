// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Transcript assembly.
//!
//! Stored messages become provider transcript messages.  The history policy
//! caps non-system history at half the model's context window, dropping the
//! oldest messages first; the system prompt is always preserved.  The cut
//! never strands a tool result without the assistant turn that requested it.

use lectern_model::{ToolCallRequest, TranscriptMessage};
use lectern_store::{Conversation, MessageRole, StoredMessage};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer using the provided context when it is \
     relevant, and cite it honestly; say so when the context is insufficient.";

/// Marker prefixing the synthetic retrieval-context system message.
pub const CONTEXT_MARKER: &str = "CONTEXT:\n";

/// Assembled transcript plus the token count of its non-system part
/// (the figure that enters the retrieval budget).
pub struct AssembledTranscript {
    pub messages: Vec<TranscriptMessage>,
    pub system_prompt_tokens: usize,
    pub history_tokens: usize,
}

/// Build the provider transcript from stored history.
///
/// `history` must be in conversation order and already include the new user
/// message.  `context_window` drives the 50 % history cap.
pub fn assemble(
    conversation: &Conversation,
    history: &[StoredMessage],
    context_window: usize,
) -> AssembledTranscript {
    let system = TranscriptMessage::system(
        conversation
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
    );
    let system_prompt_tokens = system.approx_tokens();

    let mut flat: Vec<TranscriptMessage> = Vec::new();
    for message in history {
        flatten_message(message, &mut flat);
    }

    let cap = context_window / 2;
    let mut start = 0usize;
    let mut total: usize = flat.iter().map(|m| m.approx_tokens()).sum();
    while start < flat.len() && total > cap {
        total -= flat[start].approx_tokens();
        start += 1;
    }
    // Never begin the window with an orphaned tool result, and never keep an
    // assistant tool-call turn whose results were dropped ahead of it.
    while start < flat.len()
        && matches!(flat[start].role, lectern_model::Role::Tool)
    {
        total -= flat[start].approx_tokens();
        start += 1;
    }

    let mut messages = Vec::with_capacity(flat.len() - start + 1);
    messages.push(system);
    messages.extend_from_slice(&flat[start..]);

    AssembledTranscript {
        messages,
        system_prompt_tokens,
        history_tokens: total,
    }
}

/// Insert the packed retrieval context as a synthetic system message right
/// after the primary system prompt.
pub fn inject_context(transcript: &mut AssembledTranscript, context_text: &str) {
    let synthetic =
        TranscriptMessage::system(format!("{CONTEXT_MARKER}{context_text}"));
    transcript.history_tokens += synthetic.approx_tokens();
    transcript.messages.insert(1, synthetic);
}

/// Expand one stored message into wire transcript messages.
///
/// Assistant messages that carried tool calls replay as content (when any),
/// then the tool-call turn; the matching `tool` messages follow as their own
/// stored rows.  Tool rows carry their call id in the attached record.
fn flatten_message(message: &StoredMessage, out: &mut Vec<TranscriptMessage>) {
    match message.role {
        MessageRole::System => out.push(TranscriptMessage::system(message.content.clone())),
        MessageRole::User => out.push(TranscriptMessage::user(message.content.clone())),
        MessageRole::Assistant => {
            if message.tool_calls.is_empty() {
                if !message.content.is_empty() {
                    out.push(TranscriptMessage::assistant(message.content.clone()));
                }
            } else {
                if !message.content.is_empty() {
                    out.push(TranscriptMessage::assistant(message.content.clone()));
                }
                let calls: Vec<ToolCallRequest> = message
                    .tool_calls
                    .iter()
                    .map(|tc| ToolCallRequest {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        arguments: tc.arguments.to_string(),
                    })
                    .collect();
                out.push(TranscriptMessage::assistant_tool_calls(calls));
            }
        }
        MessageRole::Tool => {
            let call_id = message
                .tool_calls
                .first()
                .map(|tc| tc.id.clone())
                .unwrap_or_default();
            out.push(TranscriptMessage::tool_result(call_id, message.content.clone()));
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
