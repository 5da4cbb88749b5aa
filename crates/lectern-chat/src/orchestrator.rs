// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The chat orchestrator: provider stream → optional tool execution →
//! repeat, bounded by the tool-iteration budget.
//!
//! # Streaming and persistence
//!
//! The assistant message is persisted in `streaming` state before the first
//! event reaches the client; partial content is flushed to the store at
//! least every `flush_interval_ms` / `flush_chars`, whichever fires first.
//!
//! # Cancellation
//!
//! The cancel token is checked at every event boundary.  On cancel the
//! provider stream is dropped (aborting the request), running tools are
//! aborted, and the partial message is persisted: `complete` when any
//! content was produced, `error(CANCELLED)` otherwise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lectern_config::SettingsResolver;
use lectern_model::{
    catalog, CompletionProvider, CompletionRequest, StopReason, StreamEvent, ToolCallRequest,
    ToolSchema, TranscriptMessage,
};
use lectern_retrieval::{ContextBudget, RetrievalEngine, RetrievalRequest};
use lectern_store::{
    Citation, ConversationRepo, DocumentRepo, MessageRepo, MessageRole, MessageStatus, Store,
    StoredMessage, ToolCallRecord, ToolCallState,
};
use lectern_tools::{ToolError, ToolRegistry};

use crate::{
    transcript, ChatError, ChatEvent, ConversationLocks, CODE_CANCELLED,
    CODE_PROVIDER_UNAVAILABLE, CODE_TOOL_LOOP_LIMIT,
};

/// Idle deadline between provider stream events.  There is no cap on the
/// total stream duration, only on silence.
const PROVIDER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    /// Force retrieval even without attachments.
    pub rag: bool,
    /// Restrict retrieval to these collections.
    pub collection_ids: Vec<Uuid>,
    /// Documents attached to this message; their collections scope retrieval.
    pub attachments: Vec<Uuid>,
    /// Model override for this message.
    pub model: Option<String>,
    /// Client-supplied id for the user message; resubmitting the same id
    /// replays the existing assistant reply instead of generating another.
    pub client_message_id: Option<Uuid>,
}

pub struct ChatOrchestrator {
    store: Arc<dyn Store>,
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<ToolRegistry>,
    retrieval: Arc<RetrievalEngine>,
    settings: Arc<SettingsResolver>,
    locks: ConversationLocks,
}

/// Mutable state of one orchestrator run.
struct RunState {
    conversation_id: Uuid,
    assistant_id: Uuid,
    model: String,
    messages: Vec<TranscriptMessage>,
    content: String,
    thinking: String,
    prompt_tokens: u32,
    completion_tokens: u32,
    records: Vec<ToolCallRecord>,
    citations: Vec<Citation>,
}

/// A tool call being accumulated from streamed fragments.
struct PendingCall {
    id: String,
    name: String,
    args_buf: String,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn CompletionProvider>,
        tools: Arc<ToolRegistry>,
        retrieval: Arc<RetrievalEngine>,
        settings: Arc<SettingsResolver>,
    ) -> Self {
        Self {
            store,
            provider,
            tools,
            retrieval,
            settings,
            locks: ConversationLocks::new(),
        }
    }

    /// Produce a streaming assistant reply for `user_text`.
    ///
    /// Events flow through `tx`; the call returns once a terminal event has
    /// been emitted (or an error occurred before the stream opened).
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        user_text: &str,
        options: ChatOptions,
        tx: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ChatError> {
        // Serialize runs per conversation; dropping this future releases it.
        let _guard = self.locks.acquire(conversation_id).await;
        let settings = self.settings.effective();
        let conv = self.store.conversations().get(conversation_id).await?;

        // ── Idempotent resubmission ───────────────────────────────────────────
        let mut user_message_exists = false;
        if let Some(client_id) = options.client_message_id {
            if let Ok(existing) = self.store.messages().get(client_id).await {
                if existing.conversation_id != conversation_id
                    || existing.role != MessageRole::User
                {
                    return Err(ChatError::Validation(
                        "message id is already used by a different message".into(),
                    ));
                }
                user_message_exists = true;
                if let Some(reply) = self
                    .store
                    .messages()
                    .find_assistant_reply(conversation_id, client_id)
                    .await?
                {
                    debug!(message = %client_id, "duplicate submission; replaying existing reply");
                    replay(&reply, &tx).await;
                    return Ok(());
                }
            }
        }

        // ── Title autogen on the first message ────────────────────────────────
        if conv.message_count == 0 && conv.title.trim().is_empty() {
            let mut titled = conv.clone();
            titled.title = user_text.chars().take(80).collect::<String>().trim().to_string();
            // Best effort: a concurrent rename losing the race is fine.
            let _ = self.store.conversations().update(titled, conv.version).await;
        }

        // ── Persist the user message ──────────────────────────────────────────
        if !user_message_exists {
            let mut user_msg = StoredMessage::user(conversation_id, user_text);
            if let Some(client_id) = options.client_message_id {
                user_msg.id = client_id;
            }
            self.store.messages().append(user_msg).await?;
        }

        // ── Transcript ────────────────────────────────────────────────────────
        let model = options
            .model
            .clone()
            .or_else(|| conv.model.clone())
            .unwrap_or_else(|| settings.model.default_name.clone());
        let context_window =
            catalog::effective_context_window(settings.model.context_window, &model) as usize;
        let history = self
            .store
            .messages()
            .list_by_conversation(conversation_id)
            .await?;
        let mut assembled = transcript::assemble(&conv, &history, context_window);

        // ── Retrieval ─────────────────────────────────────────────────────────
        let mut citations: Vec<Citation> = Vec::new();
        if options.rag || !options.attachments.is_empty() {
            let budget = ContextBudget {
                context_window,
                system_prompt_tokens: assembled.system_prompt_tokens,
                reserved_completion_tokens: settings.retrieval.reserved_completion_tokens,
                conversation_history_tokens: assembled.history_tokens,
            };
            let mut req = RetrievalRequest::new(user_text);
            req.k = settings.retrieval.default_k;
            req.similarity_threshold = settings.retrieval.similarity_threshold;
            let mut scope: Vec<Uuid> = options.collection_ids.clone();
            for doc_id in &options.attachments {
                if let Ok(doc) = self.store.documents().get(*doc_id).await {
                    scope.push(doc.collection_id);
                }
            }
            if !scope.is_empty() {
                req.collection_ids = Some(scope);
            }
            match self.retrieval.retrieve(&req, &budget).await {
                Ok(ctx) => {
                    if !ctx.insufficient_context {
                        transcript::inject_context(&mut assembled, &ctx.context_text());
                    }
                    citations = ctx.citations;
                }
                // A completion still happens without context; the model is
                // told nothing was retrieved.
                Err(e) => warn!("retrieval failed; continuing without context: {e}"),
            }
        }

        // ── Assistant message ─────────────────────────────────────────────────
        let assistant = self
            .store
            .messages()
            .append(StoredMessage::assistant_pending(conversation_id))
            .await?;
        self.store
            .messages()
            .set_status(assistant.id, MessageStatus::Streaming)
            .await?;
        let _ = tx
            .send(ChatEvent::MessageStart {
                message_id: assistant.id,
            })
            .await;

        let state = RunState {
            conversation_id,
            assistant_id: assistant.id,
            model,
            messages: assembled.messages,
            content: String::new(),
            thinking: String::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            records: Vec::new(),
            citations,
        };
        self.run_loop(state, tx, cancel).await
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.tools
            .list()
            .into_iter()
            .map(|d| ToolSchema {
                name: d.name,
                description: d.description,
                parameters: d.parameters,
            })
            .collect()
    }

    async fn run_loop(
        &self,
        mut state: RunState,
        tx: mpsc::Sender<ChatEvent>,
        cancel: CancellationToken,
    ) -> Result<(), ChatError> {
        let settings = self.settings.effective();
        let deadline = Duration::from_secs(settings.chat.tool_deadline_secs);
        let mut flusher = Flusher::new(
            Duration::from_millis(settings.chat.flush_interval_ms),
            settings.chat.flush_chars,
        );
        let persist_thinking = settings.chat.persist_thinking;
        let mut iterations = 0u32;
        // One Unavailable from the provider is retried after 500 ms; the
        // second one gives up.
        let mut retry_available = true;

        'rounds: loop {
            let request = CompletionRequest {
                model: state.model.clone(),
                messages: state.messages.clone(),
                tools: self.tool_schemas(),
                max_tokens: settings.model.max_tokens,
                temperature: settings.model.temperature,
            };

            let mut stream = match self.provider.stream(request.clone()).await {
                Ok(s) => s,
                Err(e) if e.is_retryable() && retry_available => {
                    retry_available = false;
                    warn!("provider unavailable; retrying once in 500 ms: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    match self.provider.stream(request).await {
                        Ok(s) => s,
                        Err(e) => {
                            return self
                                .fail(&mut state, &tx, CODE_PROVIDER_UNAVAILABLE, &e.to_string())
                                .await;
                        }
                    }
                }
                Err(e) => {
                    return self
                        .fail(&mut state, &tx, CODE_PROVIDER_UNAVAILABLE, &e.to_string())
                        .await;
                }
            };

            let mut open_calls: Vec<PendingCall> = Vec::new();
            let mut ended: Vec<String> = Vec::new();
            let stop;

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return self.finish_cancelled(&mut state, &tx).await;
                    }
                    ev = tokio::time::timeout(PROVIDER_IDLE_TIMEOUT, stream.next()) => match ev {
                        Ok(ev) => ev,
                        Err(_) => {
                            return self
                                .fail(
                                    &mut state,
                                    &tx,
                                    CODE_PROVIDER_UNAVAILABLE,
                                    "provider stream idle past the deadline",
                                )
                                .await;
                        }
                    },
                };
                let Some(event) = event else {
                    stop = StopReason::EndTurn;
                    break;
                };
                match event {
                    Ok(StreamEvent::ContentDelta(delta)) => {
                        state.content.push_str(&delta);
                        let _ = tx.send(ChatEvent::ContentDelta { text: delta.clone() }).await;
                        flusher
                            .on_delta(&*self.store, &state, delta.len(), persist_thinking)
                            .await;
                    }
                    Ok(StreamEvent::ThinkingDelta(delta)) => {
                        state.thinking.push_str(&delta);
                        let _ = tx.send(ChatEvent::ThinkingDelta { text: delta }).await;
                    }
                    Ok(StreamEvent::ToolCallStart { id, name, arguments }) => {
                        let _ = tx
                            .send(ChatEvent::ToolCallStart {
                                id: id.clone(),
                                name: name.clone(),
                            })
                            .await;
                        let record = ToolCallRecord {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: Value::Object(Default::default()),
                            result: None,
                            error: None,
                            state: ToolCallState::Pending,
                            duration_ms: None,
                        };
                        let _ = self
                            .store
                            .messages()
                            .upsert_tool_call(state.assistant_id, record)
                            .await;
                        open_calls.push(PendingCall {
                            id,
                            name,
                            args_buf: arguments,
                        });
                    }
                    Ok(StreamEvent::ToolCallDelta { id, arguments }) => {
                        if let Some(call) = open_calls.iter_mut().find(|c| c.id == id) {
                            call.args_buf.push_str(&arguments);
                        }
                        let _ = tx.send(ChatEvent::ToolCallDelta { id, arguments }).await;
                    }
                    Ok(StreamEvent::ToolCallEnd { id }) => {
                        ended.push(id);
                    }
                    Ok(StreamEvent::Usage {
                        prompt_tokens,
                        completion_tokens,
                    }) => {
                        state.prompt_tokens += prompt_tokens;
                        state.completion_tokens += completion_tokens;
                    }
                    Ok(StreamEvent::Error { message }) => {
                        warn!("provider stream warning: {message}");
                    }
                    Ok(StreamEvent::Done { stop_reason }) => {
                        stop = stop_reason;
                        break;
                    }
                    Err(e)
                        if e.is_retryable()
                            && retry_available
                            && state.content.is_empty()
                            && open_calls.is_empty() =>
                    {
                        retry_available = false;
                        warn!("provider stream dropped; retrying once in 500 ms: {e}");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue 'rounds;
                    }
                    Err(e) => {
                        return self
                            .fail(&mut state, &tx, CODE_PROVIDER_UNAVAILABLE, &e.to_string())
                            .await;
                    }
                }
            }

            match stop {
                StopReason::ToolCalls => {
                    iterations += 1;
                    if iterations > settings.chat.max_tool_iterations {
                        return self
                            .fail(
                                &mut state,
                                &tx,
                                CODE_TOOL_LOOP_LIMIT,
                                &format!(
                                    "tool loop exceeded {} iterations",
                                    settings.chat.max_tool_iterations
                                ),
                            )
                            .await;
                    }
                    // Results are appended in the order the end events
                    // arrived, per the streaming contract.
                    let calls = finalize_calls(&mut open_calls, &ended);
                    if calls.is_empty() {
                        // Stop reason says tool_calls but nothing usable was
                        // accumulated; treat as a normal end of turn.
                        return self.finish_complete(&mut state, &tx).await;
                    }
                    self.execute_tool_round(&mut state, &tx, &cancel, calls, deadline)
                        .await?;
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                }
                StopReason::EndTurn | StopReason::MaxTokens | StopReason::Cancelled => {
                    return self.finish_complete(&mut state, &tx).await;
                }
            }
        }
    }

    /// Execute one round of tool calls concurrently and append the results
    /// to both the conversation store and the in-flight transcript.
    async fn execute_tool_round(
        &self,
        state: &mut RunState,
        tx: &mpsc::Sender<ChatEvent>,
        cancel: &CancellationToken,
        calls: Vec<(String, String, Value)>,
        deadline: Duration,
    ) -> Result<(), ChatError> {
        // Record the assistant tool-call turn in the transcript.
        let requests: Vec<ToolCallRequest> = calls
            .iter()
            .map(|(id, name, args)| ToolCallRequest {
                id: id.clone(),
                name: name.clone(),
                arguments: args.to_string(),
            })
            .collect();
        state
            .messages
            .push(TranscriptMessage::assistant_tool_calls(requests));

        let mut handles = Vec::with_capacity(calls.len());
        for (id, name, args) in &calls {
            let record = ToolCallRecord {
                id: id.clone(),
                name: name.clone(),
                arguments: args.clone(),
                result: None,
                error: None,
                state: ToolCallState::Running,
                duration_ms: None,
            };
            let _ = self
                .store
                .messages()
                .upsert_tool_call(state.assistant_id, record)
                .await;
            let _ = tx
                .send(ChatEvent::ToolCallExecuting { id: id.clone() })
                .await;

            let registry = Arc::clone(&self.tools);
            let name = name.clone();
            let args = args.clone();
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let result = registry.invoke(&name, args, deadline).await;
                (result, started.elapsed())
            }));
        }
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let join_all = async {
            let mut out = Vec::with_capacity(handles.len());
            for handle in handles {
                out.push(match handle.await {
                    Ok(r) => r,
                    Err(e) => (
                        Err(ToolError::Failed(format!("tool task panicked: {e}"))),
                        Duration::ZERO,
                    ),
                });
            }
            out
        };
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                for h in abort_handles {
                    h.abort();
                }
                return self.finish_cancelled(state, tx).await;
            }
            r = join_all => r,
        };

        for ((id, name, args), (result, elapsed)) in calls.into_iter().zip(results) {
            let (record_state, result_value, error_text) = match result {
                Ok(value) => (ToolCallState::Complete, Some(value), None),
                Err(e) => (ToolCallState::Failed, None, Some(e.to_string())),
            };
            let record = ToolCallRecord {
                id: id.clone(),
                name,
                arguments: args,
                result: result_value.clone(),
                error: error_text.clone(),
                state: record_state,
                duration_ms: Some(elapsed.as_millis() as u64),
            };
            let _ = self
                .store
                .messages()
                .upsert_tool_call(state.assistant_id, record.clone())
                .await;
            state.records.push(record.clone());
            let _ = tx
                .send(ChatEvent::ToolCallResult {
                    id: id.clone(),
                    result: result_value.clone(),
                    error: error_text.clone(),
                })
                .await;

            // Tool role message: persisted for history and replayed into the
            // transcript for the next provider round.
            let content = match (&result_value, &error_text) {
                (Some(v), _) => v.to_string(),
                (None, Some(e)) => format!("error: {e}"),
                (None, None) => String::new(),
            };
            let mut tool_msg = StoredMessage::tool(state.conversation_id, content.clone());
            tool_msg.tool_calls.push(record);
            let _ = self.store.messages().append(tool_msg).await;
            state
                .messages
                .push(TranscriptMessage::tool_result(id, content));
        }
        Ok(())
    }

    async fn finish_complete(
        &self,
        state: &mut RunState,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<(), ChatError> {
        let settings = self.settings.effective();
        let thinking = settings
            .chat
            .persist_thinking
            .then(|| state.thinking.clone())
            .filter(|t| !t.is_empty());
        self.store
            .messages()
            .finalize(
                state.assistant_id,
                MessageStatus::Complete,
                &state.content,
                thinking.as_deref(),
                state.records.clone(),
                state.citations.clone(),
                state.prompt_tokens,
                state.completion_tokens,
            )
            .await?;
        info!(
            message = %state.assistant_id,
            content_chars = state.content.len(),
            tool_calls = state.records.len(),
            "assistant message complete"
        );
        let _ = tx
            .send(ChatEvent::MessageComplete {
                message_id: state.assistant_id,
                prompt_tokens: state.prompt_tokens,
                completion_tokens: state.completion_tokens,
                citations: state.citations.clone(),
            })
            .await;
        Ok(())
    }

    /// Cancellation outcome: keep what was produced.
    async fn finish_cancelled(
        &self,
        state: &mut RunState,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<(), ChatError> {
        info!(
            message = %state.assistant_id,
            content_chars = state.content.len(),
            "run cancelled"
        );
        if state.content.is_empty() {
            return self.fail(state, tx, CODE_CANCELLED, "cancelled before any content").await;
        }
        let settings = self.settings.effective();
        let thinking = settings
            .chat
            .persist_thinking
            .then(|| state.thinking.clone())
            .filter(|t| !t.is_empty());
        self.store
            .messages()
            .finalize(
                state.assistant_id,
                MessageStatus::Complete,
                &state.content,
                thinking.as_deref(),
                state.records.clone(),
                state.citations.clone(),
                state.prompt_tokens,
                state.completion_tokens,
            )
            .await?;
        let _ = tx
            .send(ChatEvent::MessageComplete {
                message_id: state.assistant_id,
                prompt_tokens: state.prompt_tokens,
                completion_tokens: state.completion_tokens,
                citations: state.citations.clone(),
            })
            .await;
        Ok(())
    }

    /// Terminal failure: partial content is preserved on the record.
    async fn fail(
        &self,
        state: &mut RunState,
        tx: &mpsc::Sender<ChatEvent>,
        code: &str,
        message: &str,
    ) -> Result<(), ChatError> {
        warn!(message = %state.assistant_id, code, "assistant message failed: {message}");
        let _ = self
            .store
            .messages()
            .finalize(
                state.assistant_id,
                MessageStatus::Error,
                &state.content,
                (!state.thinking.is_empty()).then(|| state.thinking.as_str()),
                state.records.clone(),
                state.citations.clone(),
                state.prompt_tokens,
                state.completion_tokens,
            )
            .await;
        let _ = tx
            .send(ChatEvent::Error {
                code: code.to_string(),
                message: message.to_string(),
            })
            .await;
        Ok(())
    }
}

/// Resolve accumulated argument buffers into `(id, name, arguments)`
/// triples, ordered by when each call's end event arrived.  Arguments that
/// fail to parse fall back to `{}` rather than losing the call.
fn finalize_calls(open: &mut Vec<PendingCall>, ended: &[String]) -> Vec<(String, String, Value)> {
    let mut out = Vec::with_capacity(ended.len());
    for id in ended {
        let Some(pos) = open.iter().position(|c| &c.id == id) else {
            continue;
        };
        let call = open.remove(pos);
        if call.name.is_empty() {
            warn!(call = %call.id, "dropping tool call with no name");
            continue;
        }
        let args = if call.args_buf.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.args_buf).unwrap_or_else(|e| {
                warn!(call = %call.id, "invalid tool-call argument JSON ({e}); substituting {{}}");
                Value::Object(Default::default())
            })
        };
        out.push((call.id, call.name, args));
    }
    out
}

/// Replay an already-persisted assistant reply for a duplicate submission.
async fn replay(reply: &StoredMessage, tx: &mpsc::Sender<ChatEvent>) {
    let _ = tx
        .send(ChatEvent::MessageStart {
            message_id: reply.id,
        })
        .await;
    if !reply.content.is_empty() {
        let _ = tx
            .send(ChatEvent::ContentDelta {
                text: reply.content.clone(),
            })
            .await;
    }
    if reply.status == MessageStatus::Error {
        let _ = tx
            .send(ChatEvent::Error {
                code: "REPLAYED_ERROR".into(),
                message: "previous attempt for this message failed".into(),
            })
            .await;
    } else {
        let _ = tx
            .send(ChatEvent::MessageComplete {
                message_id: reply.id,
                prompt_tokens: reply.prompt_tokens,
                completion_tokens: reply.completion_tokens,
                citations: reply.citations.clone(),
            })
            .await;
    }
}

/// Tracks the partial-persistence cadence.
struct Flusher {
    interval: Duration,
    chars: usize,
    last: Instant,
    pending: usize,
}

impl Flusher {
    fn new(interval: Duration, chars: usize) -> Self {
        Self {
            interval,
            chars,
            last: Instant::now(),
            pending: 0,
        }
    }

    async fn on_delta(
        &mut self,
        store: &dyn Store,
        state: &RunState,
        delta_len: usize,
        persist_thinking: bool,
    ) {
        self.pending += delta_len;
        if self.pending < self.chars && self.last.elapsed() < self.interval {
            return;
        }
        let thinking = (persist_thinking && !state.thinking.is_empty())
            .then(|| state.thinking.as_str());
        if let Err(e) = store
            .messages()
            .update_streaming(state.assistant_id, &state.content, thinking)
            .await
        {
            warn!("partial flush failed: {e}");
        }
        self.pending = 0;
        self.last = Instant::now();
    }
}
