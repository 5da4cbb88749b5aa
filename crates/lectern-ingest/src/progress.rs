// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use lectern_store::{DocumentStatus, IngestStage};

/// Per-channel buffer; a lagging status stream skips to the newest updates.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub document_id: Uuid,
    pub status: DocumentStatus,
    pub stage: IngestStage,
    pub percentage: u8,
    pub message: String,
    pub chunk_count: u32,
}

/// Fan-out hub for live ingestion progress.
///
/// Progress is also persisted on the document row (the durable,
/// restart-safe record); this hub only carries the low-latency stream that
/// feeds the status SSE endpoint.
#[derive(Default)]
pub struct ProgressHub {
    channels: DashMap<Uuid, broadcast::Sender<ProgressUpdate>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, document_id: Uuid) -> broadcast::Receiver<ProgressUpdate> {
        self.channels
            .entry(document_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, update: ProgressUpdate) {
        if let Some(tx) = self.channels.get(&update.document_id) {
            // No subscribers is fine; the persisted row still has the state.
            let _ = tx.send(update);
        }
    }

    /// Drop the channel once processing is terminal and the last subscriber
    /// disconnects; keeps the map from growing without bound.
    pub fn forget(&self, document_id: Uuid) {
        self.channels
            .remove_if(&document_id, |_, tx| tx.receiver_count() == 0);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
