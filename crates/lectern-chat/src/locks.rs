// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Per-conversation serialization: at most one orchestrator run is active
/// for a conversation at a time.
///
/// The guard is owned by the run's future, so cancellation (dropping the
/// future at any await point) always releases the lock.
#[derive(Default, Clone)]
pub struct ConversationLocks {
    locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, conversation_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_conversation_is_serialized() {
        let locks = ConversationLocks::new();
        let id = Uuid::new_v4();
        let guard = locks.acquire(id).await;
        let second = tokio::time::timeout(Duration::from_millis(20), locks.acquire(id)).await;
        assert!(second.is_err(), "second acquire must block");
        drop(guard);
        assert!(tokio::time::timeout(Duration::from_millis(20), locks.acquire(id))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn different_conversations_run_concurrently() {
        let locks = ConversationLocks::new();
        let _a = locks.acquire(Uuid::new_v4()).await;
        assert!(
            tokio::time::timeout(Duration::from_millis(20), locks.acquire(Uuid::new_v4()))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn dropping_a_cancelled_future_releases_the_lock() {
        let locks = ConversationLocks::new();
        let id = Uuid::new_v4();
        let held = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(id).await;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        held.abort();
        let _ = held.await;
        assert!(tokio::time::timeout(Duration::from_millis(50), locks.acquire(id))
            .await
            .is_ok());
    }
}
