// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Authentication and token service.
//!
//! Issues opaque bearer tokens: a short-lived access token and a long-lived
//! refresh token.  Raw tokens are never stored; only SHA-256 digests live in
//! the store, and every comparison is constant-time.  Refresh rotates both
//! tokens and revokes the presented one.  Failed logins are throttled
//! per-account and per-IP with a temporary lockout.

pub mod lockout;
pub mod service;
pub mod token;

use thiserror::Error;

pub use lockout::LockoutTracker;
pub use service::{AuthService, Principal, TokenPair};

use lectern_store::StoreError;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Missing, malformed, revoked, or unknown token.
    #[error("invalid token")]
    Invalid,

    #[error("token expired")]
    Expired,

    #[error("too many failed attempts; retry in {retry_after_secs}s")]
    Locked { retry_after_secs: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}
