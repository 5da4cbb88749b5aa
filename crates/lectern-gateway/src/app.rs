// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Router assembly and the HTTP server entry point.
//!
//! Layer order (outermost first): body limit → CORS → request-id
//! generation/propagation → error-envelope finalizer → routes.  The bearer
//! middleware wraps every route except login, refresh, and health.

use std::net::SocketAddr;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
};
use tracing::info;

use crate::{
    auth_mw::bearer_auth_mw,
    error::finalize_error_envelope,
    routes::{admin, auth, chat, rag},
    state::AppState,
};

/// Body limit: the configured upload ceiling plus multipart overhead.
fn body_limit(state: &AppState) -> usize {
    state.settings.effective().uploads.max_bytes as usize + 64 * 1024
}

pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/refresh", post(auth::refresh));

    let protected = Router::new()
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route(
            "/api/chat/conversations",
            get(chat::list_conversations).post(chat::create_conversation),
        )
        .route(
            "/api/chat/conversations/:id",
            get(chat::get_conversation).delete(chat::delete_conversation),
        )
        .route("/api/chat/conversations/:id/messages", post(chat::send_message))
        .route(
            "/api/rag/collections",
            get(rag::list_collections).post(rag::create_collection),
        )
        .route(
            "/api/rag/collections/:id",
            patch(rag::update_collection).delete(rag::delete_collection),
        )
        .route("/api/rag/collections/:id/documents", get(rag::list_documents))
        .route("/api/rag/documents/upload", post(rag::upload))
        .route("/api/rag/documents", post(rag::bind_upload))
        .route(
            "/api/rag/documents/:id",
            get(rag::get_document).delete(rag::delete_document),
        )
        .route("/api/rag/documents/:id/retry", post(rag::retry_document))
        .route("/api/rag/documents/:id/status", get(rag::document_status))
        .route("/api/rag/search", post(rag::search))
        .route("/api/admin/settings", get(admin::get_settings))
        .route(
            "/api/admin/settings/:key",
            put(admin::put_setting).delete(admin::delete_setting),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), bearer_auth_mw));

    let health = Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness));

    let limit = body_limit(&state);
    Router::new()
        .merge(public)
        .merge(protected)
        .merge(health)
        .layer(middleware::from_fn(finalize_error_envelope))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

async fn liveness() -> &'static str {
    "ok"
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let stale = state.health.stale_dependencies();
    if stale.is_empty() {
        (StatusCode::OK, Json(json!({ "ready": true }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ready": false, "unreachable": stale })),
        )
            .into_response()
    }
}

/// Bind and serve until SIGINT/SIGTERM.
pub async fn serve(bind: &str, router: Router) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "gateway listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received; draining connections");
}
