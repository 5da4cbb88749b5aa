// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Embedder port.
//!
//! Maps text to fixed-dimension vectors, batched.  Outputs are aligned 1:1
//! with inputs; callers must not assume anything about ordering across
//! separate calls.

pub mod mock;
pub mod remote;

use async_trait::async_trait;
use thiserror::Error;

pub use mock::MockEmbedder;
pub use remote::HttpEmbedder;

#[derive(Debug, Error)]
pub enum EmbedError {
    /// Transient: the embedding service could not be reached or returned a
    /// server error.  Safe to retry with backoff.
    #[error("embedder unavailable: {0}")]
    Unavailable(String),
    /// Permanent: the input itself was rejected (e.g. too long).
    #[error("invalid embedding input: {0}")]
    Invalid(String),
}

impl EmbedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbedError::Unavailable(_))
    }
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Dimensionality `D` of every vector this embedder returns.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts.  The result has exactly one vector per input,
    /// in input order, each of length [`Embedder::dimension`].
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;

    /// Cheap reachability probe for readiness checks.  Defaults to embedding
    /// a single short string.
    async fn ping(&self) -> Result<(), EmbedError> {
        self.embed(&["ping".to_string()]).await.map(|_| ())
    }
}
