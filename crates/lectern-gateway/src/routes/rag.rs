// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::convert::Infallible;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use lectern_auth::Principal;
use lectern_ingest::ProgressUpdate;
use lectern_library::{Actor, BindUpload, CreateCollection, UpdateCollection};
use lectern_retrieval::{ContextBudget, RetrievalRequest};
use lectern_store::{
    Collection, CollectionKind, CollectionRepo, Document, DocumentStatus, ListParams, Upload,
};

use crate::{
    auth_mw::CurrentUser, error::ApiError, ratelimit::RouteClass, sse::HEARTBEAT, state::AppState,
};

fn actor(principal: &Principal) -> Actor {
    Actor {
        user_id: principal.user_id,
        is_admin: principal.is_admin(),
    }
}

// ── Collections ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CollectionsQuery {
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub include_deleted: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list_collections(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Query(q): Query<CollectionsQuery>,
) -> Result<Json<Vec<Collection>>, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    let params = ListParams {
        limit: q.limit.unwrap_or(100).min(500),
        offset: q.offset.unwrap_or(0),
        include_deleted: q.include_deleted,
    };
    let rows = state
        .library
        .list_collections(&actor(&principal), q.parent_id, &params)
        .await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
pub struct CreateCollectionRequest {
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: CollectionKind,
    pub parent_id: Option<Uuid>,
}

fn default_kind() -> CollectionKind {
    CollectionKind::Collection
}

pub async fn create_collection(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<CreateCollectionRequest>,
) -> Result<(StatusCode, Json<Collection>), ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    let created = state
        .library
        .create_collection(
            &actor(&principal),
            CreateCollection {
                name: req.name,
                description: req.description,
                icon: req.icon,
                color: req.color,
                kind: req.kind,
                parent_id: req.parent_id,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateCollectionRequest {
    pub expected_version: u64,
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub icon: Option<Option<String>>,
    pub color: Option<Option<String>>,
    pub parent_id: Option<Option<Uuid>>,
}

pub async fn update_collection(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCollectionRequest>,
) -> Result<Json<Collection>, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    let updated = state
        .library
        .update_collection(
            &actor(&principal),
            id,
            UpdateCollection {
                name: req.name,
                description: req.description,
                icon: req.icon,
                color: req.color,
                parent_id: req.parent_id,
            },
            req.expected_version,
        )
        .await?;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct DeleteCollectionQuery {
    #[serde(default)]
    pub hard_delete: bool,
}

pub async fn delete_collection(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<Uuid>,
    Query(q): Query<DeleteCollectionQuery>,
) -> Result<StatusCode, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    state
        .library
        .delete_collection(&actor(&principal), id, q.hard_delete)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Two-phase upload ──────────────────────────────────────────────────────────

/// Phase 1: `multipart/form-data` with a `file` field and an optional
/// `size` field declaring the byte count.
pub async fn upload(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Upload>), ApiError> {
    state.limits.check(RouteClass::Upload, principal.user_id)?;

    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut declared_size: Option<u64> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("malformed multipart body: {e}")))?
    {
        // Capture metadata before `bytes()`/`text()` consume the field.
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload.bin").to_string();
                let mime = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("failed to read upload: {e}")))?;
                file = Some((file_name, mime, bytes.to_vec()));
            }
            "size" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::validation(format!("malformed size field: {e}")))?;
                declared_size = Some(text.trim().parse().map_err(|_| {
                    ApiError::validation("size field must be a non-negative integer")
                })?);
            }
            _ => {}
        }
    }

    let (file_name, mime, bytes) =
        file.ok_or_else(|| ApiError::validation("missing multipart field: file"))?;
    let declared = declared_size.unwrap_or(bytes.len() as u64);
    let created = state
        .library
        .begin_upload(&actor(&principal), &file_name, declared, &mime, bytes)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Deserialize)]
pub struct BindUploadRequest {
    pub upload_id: Uuid,
    pub collection_id: Uuid,
    pub title: Option<String>,
}

/// Phase 2: bind the upload, create the document, enqueue ingestion.
pub async fn bind_upload(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<BindUploadRequest>,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    state.limits.check(RouteClass::Upload, principal.user_id)?;
    let document = state
        .library
        .bind_upload(
            &actor(&principal),
            BindUpload {
                upload_id: req.upload_id,
                collection_id: req.collection_id,
                title: req.title,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

// ── Documents ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DocumentsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(default)]
    pub include_deleted: bool,
}

pub async fn list_documents(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(collection_id): Path<Uuid>,
    Query(q): Query<DocumentsQuery>,
) -> Result<Json<Vec<Document>>, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    let params = ListParams {
        limit: q.limit.unwrap_or(50).min(200),
        offset: q.offset.unwrap_or(0),
        include_deleted: q.include_deleted,
    };
    let rows = state
        .library
        .list_documents(&actor(&principal), collection_id, &params)
        .await?;
    Ok(Json(rows))
}

pub async fn get_document(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Document>, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    Ok(Json(state.library.get_document(&actor(&principal), id).await?))
}

#[derive(Debug, Deserialize)]
pub struct DeleteDocumentQuery {
    #[serde(default)]
    pub hard_delete: bool,
}

pub async fn delete_document(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<Uuid>,
    Query(q): Query<DeleteDocumentQuery>,
) -> Result<StatusCode, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    state
        .library
        .delete_document(&actor(&principal), id, q.hard_delete)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn retry_document(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Document>, ApiError> {
    state.limits.check(RouteClass::Upload, principal.user_id)?;
    Ok(Json(state.library.retry_document(&actor(&principal), id).await?))
}

/// Live ingestion progress as SSE `progress` events: an initial snapshot
/// from the persisted row, then hub updates until a terminal status.
pub async fn document_status(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    let document = state.library.get_document(&actor(&principal), id).await?;

    let snapshot = ProgressUpdate {
        document_id: document.id,
        status: document.status,
        stage: document.progress.stage,
        percentage: document.progress.percentage,
        message: document.progress.message.clone(),
        chunk_count: document.chunk_count,
    };
    let mut rx = state.progress.subscribe(id);
    let terminal_already = matches!(
        document.status,
        DocumentStatus::Complete | DocumentStatus::Failed
    );

    let stream = async_stream::stream! {
        yield Ok(progress_event(&snapshot));
        if terminal_already {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(update) => {
                    let terminal = matches!(
                        update.status,
                        DocumentStatus::Complete | DocumentStatus::Failed
                    );
                    yield Ok(progress_event(&update));
                    if terminal {
                        break;
                    }
                }
                // Lagged consumers skip to the newest updates.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT)))
}

fn progress_event(update: &ProgressUpdate) -> Event {
    let data = serde_json::to_string(update).unwrap_or_else(|_| "{}".into());
    Event::default().event("progress").data(data)
}

// ── Search ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub collection_ids: Option<Vec<Uuid>>,
    pub k: Option<usize>,
    pub similarity_threshold: Option<f32>,
}

pub async fn search(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Json(req): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.limits.check(RouteClass::Standard, principal.user_id)?;
    let settings = state.settings.effective();

    // Scope the search to collections the caller can see.
    let scope = match req.collection_ids {
        Some(ids) => {
            for id in &ids {
                state.library.get_collection(&actor(&principal), *id).await?;
            }
            ids
        }
        None => owned_collection_ids(&state, &principal).await?,
    };

    let mut retrieval_req = RetrievalRequest::new(req.query);
    retrieval_req.k = req
        .k
        .unwrap_or(settings.retrieval.default_k)
        .min(settings.retrieval.max_k);
    retrieval_req.similarity_threshold = req
        .similarity_threshold
        .unwrap_or(settings.retrieval.similarity_threshold);
    retrieval_req.collection_ids = Some(scope);

    // A generous packing budget: the search endpoint returns hits, not a
    // prompt, so only the window size bounds it.
    let budget = ContextBudget {
        context_window: lectern_model::catalog::effective_context_window(
            settings.model.context_window,
            &settings.model.default_name,
        ) as usize,
        system_prompt_tokens: 0,
        reserved_completion_tokens: 0,
        conversation_history_tokens: 0,
    };
    let ctx = state.retrieval.retrieve(&retrieval_req, &budget).await?;

    let results: Vec<serde_json::Value> = ctx
        .chunks
        .iter()
        .zip(ctx.citations.iter())
        .map(|(chunk, citation)| {
            json!({
                "chunk_id": chunk.chunk_id,
                "document_id": chunk.document_id,
                "score": chunk.score,
                "text": chunk.text,
                "page": citation.page,
                "section": citation.section,
            })
        })
        .collect();
    Ok(Json(json!({
        "results": results,
        "truncated": ctx.truncated,
        "insufficient_context": ctx.insufficient_context,
    })))
}

/// Every live collection id the caller owns (roots plus descendants).
async fn owned_collection_ids(
    state: &AppState,
    principal: &Principal,
) -> Result<Vec<Uuid>, ApiError> {
    let params = ListParams {
        limit: usize::MAX,
        offset: 0,
        include_deleted: false,
    };
    let roots = state
        .store
        .collections()
        .list(principal.user_id, None, &params)
        .await?;
    let mut ids = Vec::new();
    for root in roots {
        ids.push(root.id);
        for descendant in state.store.collections().descendants(root.id).await? {
            if descendant.deleted_at.is_none() {
                ids.push(descendant.id);
            }
        }
    }
    Ok(ids)
}
