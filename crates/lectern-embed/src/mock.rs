// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;

use crate::{EmbedError, Embedder};

/// Deterministic embedder for tests: hashes character trigrams into buckets
/// and L2-normalizes.  Identical text always produces identical vectors, and
/// texts sharing vocabulary land near each other, which is enough to exercise
/// retrieval ranking without a model.
pub struct MockEmbedder {
    dimension: usize,
    /// When set, every call fails with `Unavailable` until the counter
    /// reaches zero.  Used to exercise retry paths.
    failures_remaining: std::sync::atomic::AtomicU32,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            failures_remaining: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Fail the next `n` calls with a retryable error.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        let chars: Vec<char> = text.chars().collect();
        for window in chars.windows(3) {
            // FNV-1a over the trigram selects a bucket.
            let mut hash: u64 = 0xcbf29ce484222325;
            for &c in window {
                hash ^= c as u64;
                hash = hash.wrapping_mul(0x100000001b3);
            }
            v[(hash % self.dimension as u64) as usize] += 1.0;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        use std::sync::atomic::Ordering;
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(EmbedError::Unavailable("mock embedder failure".into()));
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
