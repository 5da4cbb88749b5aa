// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Bearer-token authentication middleware.
//!
//! Parses `Authorization: Bearer <token>`, resolves the principal through
//! the short-lived validation cache (falling back to the auth service), and
//! attaches it to the request extensions.  Applied to every route except
//! login, refresh, and the health endpoints.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

use lectern_auth::Principal;

use crate::{error::ApiError, state::AppState};

pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    auth.strip_prefix("Bearer ")
}

pub async fn bearer_auth_mw(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(token) = extract_bearer(req.headers()) else {
        return Err(ApiError::unauthorized("missing bearer token"));
    };

    let digest = lectern_auth::token::digest_hex(token);
    let principal = match state.token_cache.get(&digest) {
        Some(p) => p,
        None => {
            let p = state.auth.validate(token).await.map_err(ApiError::from)?;
            state.token_cache.put(digest, p.clone());
            p
        }
    };

    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

/// Extractor for the principal attached by [`bearer_auth_mw`].
pub struct CurrentUser(pub Principal);

#[axum::async_trait]
impl<S> axum::extract::FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| ApiError::unauthorized("missing bearer token"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_from_valid_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer my-token-123".parse().unwrap(),
        );
        assert_eq!(extract_bearer(&headers), Some("my-token-123"));
    }

    #[test]
    fn extract_bearer_missing_header() {
        assert!(extract_bearer(&HeaderMap::new()).is_none());
    }

    #[test]
    fn extract_bearer_wrong_scheme() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Basic dXNlcjpwYXNz".parse().unwrap(),
        );
        assert!(extract_bearer(&headers).is_none());
    }
}
