// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use governor::{
    clock::DefaultClock,
    state::keyed::DashMapStateStore,
    RateLimiter,
};
use lru::LruCache;

use lectern_auth::{AuthService, Principal};
use lectern_chat::ChatOrchestrator;
use lectern_config::SettingsResolver;
use lectern_ingest::ProgressHub;
use lectern_library::LibraryService;
use lectern_retrieval::RetrievalEngine;
use lectern_store::Store;

use crate::health::HealthState;
use crate::ratelimit::RouteLimiters;

/// Keyed limiter for unauthenticated login attempts, per source IP.
pub type IpLimiter = RateLimiter<std::net::IpAddr, DashMapStateStore<std::net::IpAddr>, DefaultClock>;

/// 10 login attempts per minute per source IP.
pub fn default_login_limiter() -> IpLimiter {
    use std::num::NonZeroU32;
    RateLimiter::keyed(governor::Quota::per_minute(
        NonZeroU32::new(10).expect("non-zero"),
    ))
}

/// Everything the handlers need, cheaply cloneable.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub auth: Arc<AuthService>,
    pub library: Arc<LibraryService>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub retrieval: Arc<RetrievalEngine>,
    pub progress: Arc<ProgressHub>,
    pub settings: Arc<SettingsResolver>,
    pub limits: Arc<RouteLimiters>,
    pub login_limiter: Arc<IpLimiter>,
    pub token_cache: Arc<TokenCache>,
    pub health: Arc<HealthState>,
}

/// Short-lived cache of validated bearer tokens.
///
/// Keyed by the token digest; entries live at most [`TokenCache::TTL`] so a
/// revocation is visible within a minute on this node.
pub struct TokenCache {
    entries: Mutex<LruCache<String, (Principal, Instant)>>,
}

impl TokenCache {
    pub const TTL: Duration = Duration::from_secs(60);
    const CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(Self::CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    pub fn get(&self, digest: &str) -> Option<Principal> {
        let mut cache = self.entries.lock().unwrap();
        match cache.get(digest) {
            Some((principal, at)) if at.elapsed() < Self::TTL => Some(principal.clone()),
            Some(_) => {
                cache.pop(digest);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, digest: String, principal: Principal) {
        self.entries
            .lock()
            .unwrap()
            .put(digest, (principal, Instant::now()));
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn principal() -> Principal {
        Principal {
            user_id: Uuid::new_v4(),
            roles: vec![lectern_store::Role::User],
            token_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = TokenCache::new();
        let p = principal();
        cache.put("digest-1".into(), p.clone());
        assert_eq!(cache.get("digest-1").unwrap().user_id, p.user_id);
    }

    #[test]
    fn unknown_digest_misses() {
        let cache = TokenCache::new();
        assert!(cache.get("nope").is_none());
    }

    #[test]
    fn distinct_digests_do_not_collide() {
        let cache = TokenCache::new();
        let a = principal();
        let b = principal();
        cache.put("a".into(), a.clone());
        cache.put("b".into(), b.clone());
        assert_eq!(cache.get("a").unwrap().user_id, a.user_id);
        assert_eq!(cache.get("b").unwrap().user_id, b.user_id);
    }
}
