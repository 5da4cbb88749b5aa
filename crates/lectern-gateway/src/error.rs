// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! The uniform error envelope.
//!
//! Every error response has the shape
//! `{"error":{type, code, message, details?, suggestions?, request_id, timestamp}}`.
//! Handlers return [`ApiError`]; its `IntoResponse` stashes the error in the
//! response extensions and the outermost middleware renders the envelope
//! with the request id (see [`finalize_error_envelope`]).

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};

use lectern_auth::AuthError;
use lectern_chat::ChatError;
use lectern_config::OverrideError;
use lectern_library::LibraryError;
use lectern_retrieval::RetrievalError;
use lectern_store::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Gone,
    PayloadTooLarge,
    RateLimited,
    Busy,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Gone => StatusCode::GONE,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Busy | ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Gone => "gone",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Busy => "busy",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub kind: ErrorKind,
    /// Stable machine-readable code, e.g. `NOT_FOUND`, `TOOL_LOOP_LIMIT`.
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
    pub suggestions: Option<Vec<String>>,
    /// Extra response headers (e.g. Retry-After).
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            details: None,
            suggestions: None,
            retry_after_secs: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, "VALIDATION", message).with_suggestions(vec![
            "check the request body against the API documentation".into(),
        ])
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, "UNAUTHORIZED", message)
    }

    pub fn forbidden() -> Self {
        Self::new(ErrorKind::Forbidden, "FORBIDDEN", "not allowed to access this resource")
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(ErrorKind::NotFound, "NOT_FOUND", format!("{what} not found"))
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::new(
            ErrorKind::RateLimited,
            "RATE_LIMITED",
            "request rate limit exceeded",
        )
        .with_suggestions(vec![format!(
            "wait {retry_after_secs}s before retrying, or reduce request frequency"
        )])
        .with_retry_after(retry_after_secs)
    }

    pub fn busy() -> Self {
        Self::new(ErrorKind::Busy, "BUSY", "service is saturated; retry later")
            .with_retry_after(30)
    }

    pub fn internal() -> Self {
        // Internal details never reach the client; they are logged with the
        // request id instead.
        Self::new(ErrorKind::Internal, "INTERNAL", "an internal error occurred")
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = Some(suggestions);
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    /// Render the envelope body for a given request id.
    pub fn envelope(&self, request_id: &str) -> Value {
        let mut error = json!({
            "type": self.kind.as_str(),
            "code": self.code,
            "message": self.message,
            "request_id": request_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(details) = &self.details {
            error["details"] = details.clone();
        }
        if let Some(suggestions) = &self.suggestions {
            error["suggestions"] = json!(suggestions);
        }
        json!({ "error": error })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // The envelope needs the request id, which lives on the request; the
        // outermost middleware finishes the job.
        let mut res = Response::new(Body::empty());
        *res.status_mut() = self.kind.status();
        res.extensions_mut().insert(self);
        res
    }
}

/// Outermost middleware: renders any [`ApiError`] left in the response
/// extensions into the JSON envelope, attaching the request id.
pub async fn finalize_error_envelope(req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let mut res = next.run(req).await;
    let Some(err) = res.extensions_mut().remove::<ApiError>() else {
        return res;
    };

    if err.kind == ErrorKind::Internal {
        tracing::error!(request_id, code = %err.code, "internal error: {}", err.message);
    } else {
        tracing::debug!(request_id, code = %err.code, "request failed: {}", err.message);
    }

    let status = err.kind.status();
    let body = err.envelope(&request_id).to_string();
    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    out.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Some(secs) = err.retry_after_secs {
        if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
            out.headers_mut().insert(header::RETRY_AFTER, v);
        }
    }
    if let Ok(v) = HeaderValue::from_str(&request_id) {
        out.headers_mut().insert("x-request-id", v);
    }
    out
}

// ─── Mappings from internal error kinds ───────────────────────────────────────

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::not_found(what),
            StoreError::Conflict(m) => ApiError::new(ErrorKind::Conflict, "CONFLICT", m),
            StoreError::Validation(m) => ApiError::validation(m),
            StoreError::Unavailable(m) => {
                ApiError::new(ErrorKind::Unavailable, "STORE_UNAVAILABLE", m)
            }
        }
    }
}

impl From<LibraryError> for ApiError {
    fn from(e: LibraryError) -> Self {
        match e {
            LibraryError::NotFound(what) => ApiError::not_found(what),
            LibraryError::Forbidden => ApiError::forbidden(),
            LibraryError::Conflict(m) => ApiError::new(ErrorKind::Conflict, "CONFLICT", m),
            LibraryError::Gone(m) => ApiError::new(ErrorKind::Gone, "GONE", m),
            LibraryError::PayloadTooLarge { got, limit } => ApiError::new(
                ErrorKind::PayloadTooLarge,
                "PAYLOAD_TOO_LARGE",
                format!("payload of {got} bytes exceeds the {limit} byte limit"),
            ),
            LibraryError::Validation(m) => ApiError::validation(m),
            LibraryError::Busy => ApiError::busy(),
            LibraryError::Io(m) => {
                tracing::error!("storage i/o failure: {m}");
                ApiError::internal()
            }
            LibraryError::Store(e) => e.into(),
            LibraryError::Index(e) => {
                ApiError::new(ErrorKind::Unavailable, "INDEX_UNAVAILABLE", e.to_string())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials => ApiError::new(
                ErrorKind::Unauthorized,
                "INVALID_CREDENTIALS",
                "email or password is incorrect",
            ),
            AuthError::Invalid => ApiError::unauthorized("invalid bearer token"),
            AuthError::Expired => ApiError::new(
                ErrorKind::Unauthorized,
                "TOKEN_EXPIRED",
                "token has expired; refresh the session",
            ),
            AuthError::Locked { retry_after_secs } => ApiError::rate_limited(retry_after_secs),
            AuthError::Store(e) => e.into(),
        }
    }
}

impl From<RetrievalError> for ApiError {
    fn from(e: RetrievalError) -> Self {
        match e {
            RetrievalError::Validation(m) => ApiError::validation(m),
            RetrievalError::Embed(e) => {
                ApiError::new(ErrorKind::Unavailable, "EMBEDDER_UNAVAILABLE", e.to_string())
            }
            RetrievalError::Index(e) => {
                ApiError::new(ErrorKind::Unavailable, "INDEX_UNAVAILABLE", e.to_string())
            }
            RetrievalError::Store(e) => e.into(),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::Validation(m) => ApiError::validation(m),
            ChatError::Store(e) => e.into(),
            ChatError::Model(e) => {
                ApiError::new(ErrorKind::Unavailable, "PROVIDER_UNAVAILABLE", e.to_string())
            }
            ChatError::Retrieval(e) => e.into(),
        }
    }
}

impl From<OverrideError> for ApiError {
    fn from(e: OverrideError) -> Self {
        ApiError::validation(e.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
