// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use lectern_auth::Principal;
use lectern_chat::{ChatEvent, ChatOptions};
use lectern_store::{
    Conversation, ConversationRepo, ListParams, MessageRepo,
};

use crate::{
    auth_mw::CurrentUser, error::ApiError, ratelimit::RouteClass, sse::chat_sse, state::AppState,
};

/// Event buffer between the orchestrator and the SSE bridge.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub search: Option<String>,
}

async fn owned_conversation(
    state: &AppState,
    principal: &Principal,
    id: Uuid,
) -> Result<Conversation, ApiError> {
    let conversation = state.store.conversations().get(id).await?;
    if conversation.owner_id != principal.user_id && !principal.is_admin() {
        return Err(ApiError::forbidden());
    }
    Ok(conversation)
}

pub async fn list_conversations(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    let params = ListParams {
        limit: q.limit.unwrap_or(50).min(200),
        offset: q.offset.unwrap_or(0),
        include_deleted: false,
    };
    let rows = state
        .store
        .conversations()
        .list(principal.user_id, q.search.as_deref(), &params)
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

pub async fn create_conversation(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    let mut conversation = Conversation::new(principal.user_id, req.title);
    conversation.model = req.model;
    conversation.system_prompt = req.system_prompt;
    let created = state.store.conversations().create(conversation).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    let conversation = owned_conversation(&state, &principal, id).await?;
    let messages = state.store.messages().list_by_conversation(id).await?;
    Ok(Json(json!({
        "conversation": conversation,
        "messages": messages,
    })))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    owned_conversation(&state, &principal, id).await?;
    state.store.conversations().soft_delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub rag: bool,
    #[serde(default)]
    pub collection_ids: Vec<Uuid>,
    #[serde(default)]
    pub attachments: Vec<Uuid>,
    pub model: Option<String>,
    /// Client-generated id for idempotent resubmission.
    pub message_id: Option<Uuid>,
}

/// Send a user message and stream the assistant reply.
///
/// With `Accept: text/event-stream` the response is an SSE stream of the
/// orchestrator's events; otherwise the handler waits for the terminal event
/// and returns the persisted assistant message.
pub async fn send_message(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<Response, ApiError> {
    state.limits.check(RouteClass::Chat, principal.user_id)?;
    owned_conversation(&state, &principal, id).await?;
    if req.content.trim().is_empty() {
        return Err(ApiError::validation("message content is empty"));
    }

    let options = ChatOptions {
        rag: req.rag,
        collection_ids: req.collection_ids,
        attachments: req.attachments,
        model: req.model,
        client_message_id: req.message_id,
    };
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();

    let orchestrator = state.orchestrator.clone();
    let run_cancel = cancel.clone();
    let content = req.content.clone();
    tokio::spawn(async move {
        if let Err(e) = orchestrator
            .send_message(id, &content, options, tx, run_cancel)
            .await
        {
            warn!(conversation = %id, "orchestrator run failed: {e}");
        }
    });

    let wants_sse = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false);

    if wants_sse {
        // The guard propagates a client disconnect as cancellation.
        return Ok(chat_sse(rx, cancel.drop_guard()).into_response());
    }

    // Buffered mode: wait for the terminal event, then return the message.
    let mut rx = rx;
    let mut message_id = None;
    let mut error: Option<(String, String)> = None;
    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::MessageStart { message_id: mid } => message_id = Some(mid),
            ChatEvent::Error { code, message } => {
                error = Some((code, message));
                break;
            }
            ChatEvent::MessageComplete { .. } => break,
            _ => {}
        }
    }
    drop(cancel);

    let Some(message_id) = message_id else {
        let (code, message) =
            error.unwrap_or_else(|| ("INTERNAL".into(), "no reply produced".into()));
        return Err(ApiError::new(crate::error::ErrorKind::Internal, code, message));
    };
    let message = state.store.messages().get(message_id).await?;
    Ok(Json(message).into_response())
}
