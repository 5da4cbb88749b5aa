// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::{
    cosine_similarity, ChunkMetadata, IndexError, MetadataFilter, SearchHit, VectorRecord,
    VectorStore,
};

/// Brute-force in-memory vector index.
pub struct MemoryVectorIndex {
    dimension: usize,
    records: RwLock<HashMap<Uuid, (Vec<f32>, ChunkMetadata)>>,
}

impl MemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), IndexError> {
        for r in &records {
            if r.vector.len() != self.dimension {
                return Err(IndexError::Validation(format!(
                    "vector dimension mismatch: expected {}, got {}",
                    self.dimension,
                    r.vector.len()
                )));
            }
        }
        let mut map = self.records.write().await;
        for r in records {
            map.insert(r.chunk_id, (r.vector, r.metadata));
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchHit>, IndexError> {
        if vector.len() != self.dimension {
            warn!(
                expected = self.dimension,
                got = vector.len(),
                "query dimension mismatch"
            );
            return Err(IndexError::Validation(format!(
                "query dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let map = self.records.read().await;
        let mut hits: Vec<SearchHit> = map
            .iter()
            .filter(|(_, (_, meta))| filter.matches(meta))
            .map(|(id, (vec, meta))| SearchHit {
                chunk_id: *id,
                score: cosine_similarity(vector, vec),
                metadata: meta.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                // Stable order for equal scores so pagination is deterministic.
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete_by_document(&self, document_id: Uuid) -> Result<usize, IndexError> {
        let mut map = self.records.write().await;
        let before = map.len();
        map.retain(|_, (_, meta)| meta.document_id != document_id);
        Ok(before - map.len())
    }

    async fn delete_by_collection(&self, collection_id: Uuid) -> Result<usize, IndexError> {
        let mut map = self.records.write().await;
        let before = map.len();
        map.retain(|_, (_, meta)| meta.collection_id != collection_id);
        Ok(before - map.len())
    }

    async fn chunk_ids_for_document(&self, document_id: Uuid) -> Result<Vec<Uuid>, IndexError> {
        let map = self.records.read().await;
        let mut ids: Vec<Uuid> = map
            .iter()
            .filter(|(_, (_, meta))| meta.document_id == document_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn ping(&self) -> Result<(), IndexError> {
        let _ = self.records.read().await;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(doc: Uuid, coll: Uuid, ordinal: u32, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk_id: Uuid::new_v4(),
            vector,
            metadata: ChunkMetadata {
                document_id: doc,
                collection_id: coll,
                ordinal,
                page: None,
                section: None,
            },
        }
    }

    #[tokio::test]
    async fn search_orders_by_descending_similarity() {
        let idx = MemoryVectorIndex::new(3);
        let doc = Uuid::new_v4();
        let coll = Uuid::new_v4();
        let best = record(doc, coll, 0, vec![1.0, 0.0, 0.0]);
        let best_id = best.chunk_id;
        idx.upsert(vec![
            best,
            record(doc, coll, 1, vec![0.7, 0.7, 0.0]),
            record(doc, coll, 2, vec![0.0, 0.0, 1.0]),
        ])
        .await
        .unwrap();

        let hits = idx
            .search(&[1.0, 0.0, 0.0], 3, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].chunk_id, best_id);
        assert!(hits[0].score >= hits[1].score && hits[1].score >= hits[2].score);
    }

    #[tokio::test]
    async fn search_honours_k() {
        let idx = MemoryVectorIndex::new(2);
        let doc = Uuid::new_v4();
        let coll = Uuid::new_v4();
        idx.upsert(vec![
            record(doc, coll, 0, vec![1.0, 0.0]),
            record(doc, coll, 1, vec![0.9, 0.1]),
        ])
        .await
        .unwrap();
        let hits = idx
            .search(&[1.0, 0.0], 1, &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn search_applies_collection_filter() {
        let idx = MemoryVectorIndex::new(2);
        let keep = Uuid::new_v4();
        let other = Uuid::new_v4();
        idx.upsert(vec![
            record(Uuid::new_v4(), keep, 0, vec![1.0, 0.0]),
            record(Uuid::new_v4(), other, 0, vec![1.0, 0.0]),
        ])
        .await
        .unwrap();
        let hits = idx
            .search(&[1.0, 0.0], 10, &MetadataFilter::for_collections([keep]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.collection_id, keep);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_chunk() {
        let idx = MemoryVectorIndex::new(2);
        let doc = Uuid::new_v4();
        let coll = Uuid::new_v4();
        let mut r = record(doc, coll, 0, vec![1.0, 0.0]);
        idx.upsert(vec![r.clone()]).await.unwrap();
        r.vector = vec![0.0, 1.0];
        idx.upsert(vec![r]).await.unwrap();
        assert_eq!(idx.len().await, 1);
        let hits = idx
            .search(&[0.0, 1.0], 1, &MetadataFilter::default())
            .await
            .unwrap();
        assert!((hits[0].score - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let idx = MemoryVectorIndex::new(3);
        let err = idx
            .upsert(vec![record(Uuid::new_v4(), Uuid::new_v4(), 0, vec![1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Validation(_)));
        let err = idx
            .search(&[1.0], 5, &MetadataFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_by_document_is_idempotent() {
        let idx = MemoryVectorIndex::new(2);
        let doc = Uuid::new_v4();
        let coll = Uuid::new_v4();
        idx.upsert(vec![
            record(doc, coll, 0, vec![1.0, 0.0]),
            record(doc, coll, 1, vec![0.0, 1.0]),
            record(Uuid::new_v4(), coll, 0, vec![0.5, 0.5]),
        ])
        .await
        .unwrap();
        assert_eq!(idx.delete_by_document(doc).await.unwrap(), 2);
        assert_eq!(idx.delete_by_document(doc).await.unwrap(), 0);
        assert_eq!(idx.len().await, 1);
    }

    #[tokio::test]
    async fn delete_by_collection_removes_all_member_chunks() {
        let idx = MemoryVectorIndex::new(2);
        let coll = Uuid::new_v4();
        idx.upsert(vec![
            record(Uuid::new_v4(), coll, 0, vec![1.0, 0.0]),
            record(Uuid::new_v4(), coll, 0, vec![0.0, 1.0]),
        ])
        .await
        .unwrap();
        assert_eq!(idx.delete_by_collection(coll).await.unwrap(), 2);
        assert!(idx.is_empty().await);
    }

    #[tokio::test]
    async fn k_zero_returns_empty() {
        let idx = MemoryVectorIndex::new(2);
        idx.upsert(vec![record(Uuid::new_v4(), Uuid::new_v4(), 0, vec![1.0, 0.0])])
            .await
            .unwrap();
        let hits = idx
            .search(&[1.0, 0.0], 0, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
