// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use lectern_auth::TokenPair;
use lectern_store::UserRepo;

use crate::{auth_mw::CurrentUser, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub access_expires_at: chrono::DateTime<chrono::Utc>,
    pub refresh_expires_at: chrono::DateTime<chrono::Utc>,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: "Bearer",
            access_expires_at: pair.access_expires_at,
            refresh_expires_at: pair.refresh_expires_at,
        }
    }
}

pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    // Loopback is exempt so local tooling is never locked out.
    if !addr.ip().is_loopback() && state.login_limiter.check_key(&addr.ip()).is_err() {
        return Err(ApiError::rate_limited(60));
    }
    let pair = state
        .auth
        .login(&req.email, &req.password, Some(addr.ip()))
        .await?;
    Ok(Json(pair.into()))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let pair = state.auth.refresh(&req.refresh_token).await?;
    Ok(Json(pair.into()))
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
    #[serde(default)]
    pub everywhere: bool,
}

pub async fn logout(
    State(state): State<AppState>,
    CurrentUser(_principal): CurrentUser,
    Json(req): Json<LogoutRequest>,
) -> Result<StatusCode, ApiError> {
    state.auth.logout(&req.refresh_token, req.everywhere).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn me(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
) -> Result<Json<Value>, ApiError> {
    let user = state.store.users().get(principal.user_id).await?;
    Ok(Json(json!({
        "user_id": user.id,
        "email": user.email,
        "display_name": user.display_name,
        "roles": user.roles,
        "token_id": principal.token_id,
    })))
}
