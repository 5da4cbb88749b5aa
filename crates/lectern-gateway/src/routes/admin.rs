// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{auth_mw::CurrentUser, error::ApiError, ratelimit::RouteClass, state::AppState};

fn require_admin(principal: &lectern_auth::Principal) -> Result<(), ApiError> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden())
    }
}

/// Effective settings and the runtime override layer.
pub async fn get_settings(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
) -> Result<Json<Value>, ApiError> {
    state.limits.check(RouteClass::Admin, principal.user_id)?;
    require_admin(&principal)?;
    let overrides: Vec<Value> = state
        .settings
        .overrides()
        .into_iter()
        .map(|(key, value)| json!({ "key": key, "value": value }))
        .collect();
    let effective = serde_json::to_value(state.settings.effective().as_ref())
        .unwrap_or_else(|_| json!({}));
    Ok(Json(json!({
        "effective": effective,
        "overrides": overrides,
    })))
}

#[derive(Debug, Deserialize)]
pub struct PutSettingRequest {
    pub value: Value,
}

pub async fn put_setting(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(key): Path<String>,
    Json(req): Json<PutSettingRequest>,
) -> Result<StatusCode, ApiError> {
    state.limits.check(RouteClass::Admin, principal.user_id)?;
    require_admin(&principal)?;
    state.settings.set(&key, req.value)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_setting(
    State(state): State<AppState>,
    CurrentUser(principal): CurrentUser,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.limits.check(RouteClass::Admin, principal.user_id)?;
    require_admin(&principal)?;
    if state.settings.unset(&key) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("setting override"))
    }
}
