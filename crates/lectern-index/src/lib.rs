// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Vector store port.
//!
//! One record per chunk, keyed by chunk id.  Scores are cosine similarity in
//! `[-1, 1]`, results sorted descending.  The in-memory implementation is a
//! brute-force scan — fine for single-node deployments up to a few hundred
//! thousand chunks; a hosted vector database plugs in behind the same trait.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryVectorIndex;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector index unavailable: {0}")]
    Unavailable(String),
    #[error("validation: {0}")]
    Validation(String),
}

/// Denormalized chunk metadata carried alongside each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: Uuid,
    pub collection_id: Uuid,
    pub ordinal: u32,
    pub page: Option<u32>,
    pub section: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub chunk_id: Uuid,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: Uuid,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Conjunction of equality predicates plus set membership over the
/// collection id.  An empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub collection_ids: Option<HashSet<Uuid>>,
    pub document_id: Option<Uuid>,
    pub page: Option<u32>,
    pub section: Option<String>,
}

impl MetadataFilter {
    pub fn for_collections(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            collection_ids: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn matches(&self, meta: &ChunkMetadata) -> bool {
        if let Some(ids) = &self.collection_ids {
            if !ids.contains(&meta.collection_id) {
                return false;
            }
        }
        if let Some(doc) = self.document_id {
            if meta.document_id != doc {
                return false;
            }
        }
        if let Some(page) = self.page {
            if meta.page != Some(page) {
                return false;
            }
        }
        if let Some(section) = &self.section {
            if meta.section.as_deref() != Some(section.as_str()) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace records, keyed by chunk id.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), IndexError>;
    /// Top-`k` hits by cosine similarity, descending, after filtering.
    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchHit>, IndexError>;
    /// Idempotent; returns the number of records removed.
    async fn delete_by_document(&self, document_id: Uuid) -> Result<usize, IndexError>;
    /// Idempotent; returns the number of records removed.
    async fn delete_by_collection(&self, collection_id: Uuid) -> Result<usize, IndexError>;
    /// Records currently indexed for a document (invariant checks, tests).
    async fn chunk_ids_for_document(&self, document_id: Uuid) -> Result<Vec<Uuid>, IndexError>;
    /// Cheap reachability probe for readiness checks.
    async fn ping(&self) -> Result<(), IndexError>;
}

/// Calculate cosine similarity between two vectors.
///
/// Returns a value in [-1, 1]; mismatched lengths and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(collection: Uuid, document: Uuid) -> ChunkMetadata {
        ChunkMetadata {
            document_id: document,
            collection_id: collection,
            ordinal: 0,
            page: None,
            section: None,
        }
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn cosine_orthogonal_is_zero() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-4);
    }

    #[test]
    fn cosine_opposite_is_minus_one() {
        let a = [1.0, 2.0];
        let b = [-1.0, -2.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-4);
    }

    #[test]
    fn cosine_length_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn cosine_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = MetadataFilter::default();
        assert!(f.matches(&meta(Uuid::new_v4(), Uuid::new_v4())));
    }

    #[test]
    fn collection_set_membership() {
        let keep = Uuid::new_v4();
        let f = MetadataFilter::for_collections([keep]);
        assert!(f.matches(&meta(keep, Uuid::new_v4())));
        assert!(!f.matches(&meta(Uuid::new_v4(), Uuid::new_v4())));
    }

    #[test]
    fn predicates_are_conjunctive() {
        let coll = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let f = MetadataFilter {
            collection_ids: Some([coll].into_iter().collect()),
            document_id: Some(doc),
            ..Default::default()
        };
        assert!(f.matches(&meta(coll, doc)));
        // Right collection, wrong document.
        assert!(!f.matches(&meta(coll, Uuid::new_v4())));
    }

    #[test]
    fn section_equality_predicate() {
        let mut m = meta(Uuid::new_v4(), Uuid::new_v4());
        m.section = Some("intro".into());
        let f = MetadataFilter {
            section: Some("intro".into()),
            ..Default::default()
        };
        assert!(f.matches(&m));
        let f2 = MetadataFilter {
            section: Some("summary".into()),
            ..Default::default()
        };
        assert!(!f2.matches(&m));
    }
}
