// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Readiness and liveness.
//!
//! Liveness is unconditional.  Readiness tracks background probes of the
//! transactional store, the vector index, and the completion provider; a
//! dependency that has not answered within the grace period fails the
//! readiness check.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use lectern_embed::Embedder;
use lectern_index::VectorStore;
use lectern_model::CompletionProvider;
use lectern_store::Store;

const PROBE_PERIOD: Duration = Duration::from_secs(5);

pub struct HealthState {
    started: Instant,
    grace: Duration,
    last_ok: DashMap<&'static str, Instant>,
}

impl HealthState {
    pub fn new(grace: Duration) -> Self {
        Self {
            started: Instant::now(),
            grace,
            last_ok: DashMap::new(),
        }
    }

    pub fn record_ok(&self, dependency: &'static str) {
        self.last_ok.insert(dependency, Instant::now());
    }

    /// Names of dependencies currently outside the grace window.
    pub fn stale_dependencies(&self) -> Vec<&'static str> {
        const DEPS: &[&str] = &["store", "vectors", "provider"];
        DEPS.iter()
            .filter(|dep| {
                match self.last_ok.get(*dep) {
                    Some(at) => at.elapsed() > self.grace,
                    // Never seen: allow the startup grace window.
                    None => self.started.elapsed() > self.grace,
                }
            })
            .copied()
            .collect()
    }

    pub fn is_ready(&self) -> bool {
        self.stale_dependencies().is_empty()
    }
}

/// Background dependency probe loop.
pub fn spawn_probes(
    health: Arc<HealthState>,
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    provider: Arc<dyn CompletionProvider>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROBE_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.ping().await {
                Ok(()) => health.record_ok("store"),
                Err(e) => warn!("store probe failed: {e}"),
            }
            match vectors.ping().await {
                Ok(()) => health.record_ok("vectors"),
                Err(e) => warn!("vector index probe failed: {e}"),
            }
            match provider.ping().await {
                Ok(()) => health.record_ok("provider"),
                Err(e) => warn!("completion provider probe failed: {e}"),
            }
            // The embedder is probed but does not gate readiness: chat works
            // without it, only ingestion and retrieval degrade.
            if let Err(e) = embedder.ping().await {
                debug!("embedder probe failed: {e}");
            }
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_is_ready_within_grace() {
        let h = HealthState::new(Duration::from_secs(30));
        assert!(h.is_ready());
    }

    #[test]
    fn unprobed_dependency_fails_after_grace() {
        let h = HealthState::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!h.is_ready());
        assert_eq!(h.stale_dependencies(), vec!["store", "vectors", "provider"]);
    }

    #[test]
    fn recorded_dependency_recovers_readiness() {
        let h = HealthState::new(Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!h.is_ready());
        h.record_ok("store");
        h.record_ok("vectors");
        h.record_ok("provider");
        assert!(h.is_ready());
    }
}
