// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Ingestion pipeline.
//!
//! Jobs are consumed from a bounded queue with at-least-once delivery and
//! driven through six stages: fetch → parse → split → embed → store →
//! finalize.  Processing is idempotent keyed on the document id: a complete
//! document is a no-op, a failed one starts from scratch after purging
//! partial chunks from both the transactional store and the vector index.

pub mod chunker;
pub mod parser;
pub mod progress;
pub mod queue;
pub mod worker;

use thiserror::Error;

pub use chunker::{chunk_text, ChunkDraft, ChunkPolicy};
pub use progress::{ProgressHub, ProgressUpdate};
pub use queue::{IngestJob, IngestQueue};
pub use worker::{run_worker_pool, IngestWorker};

use lectern_embed::EmbedError;
use lectern_index::IndexError;
use lectern_store::StoreError;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The bounded queue is full; callers map this to HTTP 503.
    #[error("ingestion queue is full")]
    Busy,

    /// Terminal: the upload bytes could not be loaded or failed the
    /// declared size check.
    #[error("fetch failure: {0}")]
    Fetch(String),

    /// Terminal: unreadable file or unsupported media type.
    #[error("parse failure: {0}")]
    Parse(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Embed(#[from] EmbedError),
}

impl IngestError {
    /// Transient failures are retried with exponential backoff; everything
    /// else fails the document immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Store(StoreError::Unavailable(_))
                | IngestError::Index(IndexError::Unavailable(_))
                | IngestError::Embed(EmbedError::Unavailable(_))
        )
    }
}
