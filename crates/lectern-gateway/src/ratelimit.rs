// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Per-principal rate limiting with route-class weights.
//!
//! Uses governor's keyed GCRA limiters, one per route class, keyed by the
//! principal's user id.  Buckets are node-local; no cross-node consistency
//! is assumed.

use std::num::NonZeroU32;

use governor::{
    clock::{Clock, DefaultClock},
    state::keyed::DashMapStateStore,
    Quota, RateLimiter,
};
use uuid::Uuid;

use lectern_config::RateLimitSettings;

use crate::error::ApiError;

type Keyed = RateLimiter<Uuid, DashMapStateStore<Uuid>, DefaultClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Standard,
    Chat,
    Upload,
    Admin,
}

pub struct RouteLimiters {
    standard: Keyed,
    chat: Keyed,
    upload: Keyed,
    admin: Keyed,
}

fn per_minute(n: u32) -> Keyed {
    RateLimiter::keyed(Quota::per_minute(
        NonZeroU32::new(n.max(1)).expect("max(1) is non-zero"),
    ))
}

impl RouteLimiters {
    pub fn from_settings(s: &RateLimitSettings) -> Self {
        Self {
            standard: per_minute(s.standard),
            chat: per_minute(s.chat),
            upload: per_minute(s.upload),
            admin: per_minute(s.admin),
        }
    }

    pub fn check(&self, class: RouteClass, principal: Uuid) -> Result<(), ApiError> {
        let limiter = match class {
            RouteClass::Standard => &self.standard,
            RouteClass::Chat => &self.chat,
            RouteClass::Upload => &self.upload,
            RouteClass::Admin => &self.admin,
        };
        limiter
            .check_key(&principal)
            .map_err(|denied| {
                let wait = denied.wait_time_from(DefaultClock::default().now());
                ApiError::rate_limited(wait.as_secs().max(1))
            })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
