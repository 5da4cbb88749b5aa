// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Retrieval engine.
//!
//! Turns a question into a packed context window: normalize → embed →
//! over-fetch from the vector index → threshold + metadata filters →
//! hydrate chunk text from the store → greedy token-budget packing with
//! citations.  Ties on score break by `(document.updated_at desc,
//! chunk.ordinal asc)`.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use lectern_embed::{EmbedError, Embedder};
use lectern_index::{IndexError, MetadataFilter, SearchHit, VectorStore};
use lectern_store::{Citation, ChunkRepo, DocumentRepo, Store, StoreError};

/// Hard ceiling on both `k` and the over-fetch.
pub const MAX_K: usize = 50;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("validation: {0}")]
    Validation(String),
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub question: String,
    /// Restrict the search to these collections (set-membership filter).
    pub collection_ids: Option<Vec<Uuid>>,
    pub k: usize,
    pub similarity_threshold: f32,
    /// Additional equality predicates, combined conjunctively.
    pub filter: MetadataFilter,
}

impl RetrievalRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            collection_ids: None,
            k: 5,
            similarity_threshold: 0.0,
            filter: MetadataFilter::default(),
        }
    }
}

/// Token budget for the packed context.
#[derive(Debug, Clone, Copy)]
pub struct ContextBudget {
    pub context_window: usize,
    pub system_prompt_tokens: usize,
    pub reserved_completion_tokens: usize,
    pub conversation_history_tokens: usize,
}

impl ContextBudget {
    /// Tokens left for retrieved chunks.
    pub fn available(&self) -> usize {
        self.context_window
            .saturating_sub(self.system_prompt_tokens)
            .saturating_sub(self.reserved_completion_tokens)
            .saturating_sub(self.conversation_history_tokens)
    }
}

#[derive(Debug, Clone)]
pub struct PackedChunk {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub text: String,
    pub score: f32,
    pub token_estimate: u32,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub chunks: Vec<PackedChunk>,
    pub citations: Vec<Citation>,
    /// At least one surviving candidate did not make it into the window.
    pub truncated: bool,
    /// Nothing fit; the caller should still produce a completion and say so.
    pub insufficient_context: bool,
}

impl RetrievedContext {
    fn empty() -> Self {
        Self {
            insufficient_context: true,
            ..Self::default()
        }
    }

    /// The packed chunk texts joined for prompt assembly.
    pub fn context_text(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n---\n\n")
    }
}

/// Lowercase, trim, and collapse internal whitespace.
pub fn normalize_question(q: &str) -> String {
    q.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    store: Arc<dyn Store>,
}

impl RetrievalEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            embedder,
            vectors,
            store,
        }
    }

    pub async fn retrieve(
        &self,
        req: &RetrievalRequest,
        budget: &ContextBudget,
    ) -> Result<RetrievedContext, RetrievalError> {
        if req.k == 0 {
            // Contract: no vector-store call happens for k = 0.
            return Ok(RetrievedContext::empty());
        }
        let question = normalize_question(&req.question);
        if question.is_empty() {
            return Err(RetrievalError::Validation("question is empty".into()));
        }
        let k = req.k.min(MAX_K);

        let embedded = self.embedder.embed(&[question]).await?;
        let query = embedded
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Unavailable("embedder returned no vector".into()))?;

        let mut filter = req.filter.clone();
        if let Some(ids) = &req.collection_ids {
            filter.collection_ids = Some(ids.iter().copied().collect());
        }

        // Over-fetch so threshold and budget filtering still leave k
        // candidates to consider.
        let overfetch = (k * 3).min(MAX_K);
        let hits = self.vectors.search(&query, overfetch, &filter).await?;
        let surviving: Vec<SearchHit> = hits
            .into_iter()
            .filter(|h| h.score >= req.similarity_threshold)
            .collect();
        debug!(
            candidates = surviving.len(),
            k, "vector search returned candidates"
        );
        if surviving.is_empty() {
            return Ok(RetrievedContext::empty());
        }

        // Hydrate chunk text and document recency in one batch each.
        let ids: Vec<Uuid> = surviving.iter().map(|h| h.chunk_id).collect();
        let rows = self.store.chunks().get_many(&ids).await?;
        let row_by_id: HashMap<Uuid, _> = rows.into_iter().map(|c| (c.id, c)).collect();

        let mut doc_updated: HashMap<Uuid, chrono::DateTime<chrono::Utc>> = HashMap::new();
        for hit in &surviving {
            let doc_id = hit.metadata.document_id;
            if let std::collections::hash_map::Entry::Vacant(e) = doc_updated.entry(doc_id) {
                if let Ok(doc) = self.store.documents().get(doc_id).await {
                    e.insert(doc.updated_at);
                }
            }
        }

        // Chunks deleted since indexing (or from soft-deleted documents) are
        // dropped here rather than surfacing stale text.
        let mut candidates: Vec<(SearchHit, lectern_store::Chunk)> = surviving
            .into_iter()
            .filter_map(|h| {
                let row = row_by_id.get(&h.chunk_id)?.clone();
                doc_updated.contains_key(&h.metadata.document_id).then_some((h, row))
            })
            .collect();
        candidates.sort_by(|(a, ac), (b, bc)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let a_at = doc_updated[&a.metadata.document_id];
                    let b_at = doc_updated[&b.metadata.document_id];
                    b_at.cmp(&a_at)
                })
                .then_with(|| ac.ordinal.cmp(&bc.ordinal))
        });

        // Greedy packing: walk candidates best-first, skipping ones that
        // would overflow, until k have been considered or the budget is gone.
        let available = budget.available();
        let mut used = 0usize;
        let mut packed = Vec::new();
        let mut citations = Vec::new();
        let mut skipped = false;
        let total_candidates = candidates.len();
        for (hit, row) in candidates.into_iter().take(k) {
            let cost = row.token_estimate as usize;
            if used + cost > available {
                skipped = true;
                continue;
            }
            used += cost;
            citations.push(Citation {
                document_id: hit.metadata.document_id,
                chunk_id: hit.chunk_id,
                score: hit.score,
                page: row.page,
                section: row.section.clone(),
            });
            packed.push(PackedChunk {
                chunk_id: hit.chunk_id,
                document_id: hit.metadata.document_id,
                text: row.text,
                score: hit.score,
                token_estimate: row.token_estimate,
            });
        }

        if packed.is_empty() {
            return Ok(RetrievedContext {
                truncated: skipped,
                ..RetrievedContext::empty()
            });
        }
        Ok(RetrievedContext {
            truncated: skipped || total_candidates > k,
            insufficient_context: false,
            chunks: packed,
            citations,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use lectern_embed::MockEmbedder;
    use lectern_index::{ChunkMetadata, MemoryVectorIndex, VectorRecord};
    use lectern_store::{
        Chunk, Collection, CollectionKind, CollectionRepo, Document, DocumentRepo, MemoryStore,
        Role, User, UserRepo,
    };

    const DIM: usize = 64;

    struct Fixture {
        store: Arc<MemoryStore>,
        vectors: Arc<MemoryVectorIndex>,
        embedder: Arc<MockEmbedder>,
        engine: RetrievalEngine,
        collection: Collection,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let vectors = Arc::new(MemoryVectorIndex::new(DIM));
        let embedder = Arc::new(MockEmbedder::new(DIM));
        let user = UserRepo::create(&*store, User::new("u@x", "U", vec![Role::User]))
            .await
            .unwrap();
        let collection = CollectionRepo::create(
            &*store,
            Collection::new(user.id, "docs", CollectionKind::Collection, None),
        )
        .await
        .unwrap();
        let engine = RetrievalEngine::new(
            Arc::clone(&embedder) as Arc<dyn Embedder>,
            Arc::clone(&vectors) as Arc<dyn VectorStore>,
            Arc::clone(&store) as Arc<dyn Store>,
        );
        Fixture {
            store,
            vectors,
            embedder,
            engine,
            collection,
        }
    }

    /// Create a document with one indexed chunk per text.
    async fn seed_document(fx: &Fixture, texts: &[&str]) -> Document {
        let doc = DocumentRepo::create(
            &*fx.store,
            Document::new(fx.collection.id, "d", "d.txt", 1, "text/plain"),
        )
        .await
        .unwrap();
        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk {
                id: Uuid::new_v4(),
                document_id: doc.id,
                ordinal: i as u32,
                text: t.to_string(),
                token_estimate: Chunk::approx_tokens(t),
                page: None,
                section: None,
            })
            .collect();
        let embedded = fx
            .embedder
            .embed(&texts.iter().map(|t| t.to_string()).collect::<Vec<_>>())
            .await
            .unwrap();
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embedded)
            .map(|(c, v)| VectorRecord {
                chunk_id: c.id,
                vector: v,
                metadata: ChunkMetadata {
                    document_id: doc.id,
                    collection_id: fx.collection.id,
                    ordinal: c.ordinal,
                    page: None,
                    section: None,
                },
            })
            .collect();
        fx.vectors.upsert(records).await.unwrap();
        lectern_store::ChunkRepo::append_batch(&*fx.store, doc.id, chunks)
            .await
            .unwrap();
        doc
    }

    fn wide_budget() -> ContextBudget {
        ContextBudget {
            context_window: 8192,
            system_prompt_tokens: 100,
            reserved_completion_tokens: 1024,
            conversation_history_tokens: 0,
        }
    }

    #[test]
    fn normalization_lowercases_and_collapses_whitespace() {
        assert_eq!(
            normalize_question("  What   DOES\tsection 2\nsay? "),
            "what does section 2 say?"
        );
    }

    #[test]
    fn budget_available_saturates() {
        let b = ContextBudget {
            context_window: 1000,
            system_prompt_tokens: 600,
            reserved_completion_tokens: 600,
            conversation_history_tokens: 0,
        };
        assert_eq!(b.available(), 0);
    }

    #[tokio::test]
    async fn best_matching_chunk_ranks_first_with_citation() {
        let fx = fixture().await;
        let doc = seed_document(
            &fx,
            &[
                "the quick brown fox jumps over the lazy dog",
                "an entirely unrelated passage about databases",
            ],
        )
        .await;

        let req = RetrievalRequest::new("the quick brown fox jumps over the lazy dog");
        let ctx = fx.engine.retrieve(&req, &wide_budget()).await.unwrap();
        assert!(!ctx.insufficient_context);
        assert!(ctx.chunks[0].text.contains("quick brown fox"));
        assert_eq!(ctx.citations[0].document_id, doc.id);
        assert_eq!(ctx.citations[0].chunk_id, ctx.chunks[0].chunk_id);
        assert!(ctx.citations[0].score > 0.9);
    }

    #[tokio::test]
    async fn k_zero_never_touches_the_vector_store() {
        struct PanicVectors;
        #[async_trait]
        impl VectorStore for PanicVectors {
            async fn upsert(&self, _: Vec<VectorRecord>) -> Result<(), lectern_index::IndexError> {
                unreachable!()
            }
            async fn search(
                &self,
                _: &[f32],
                _: usize,
                _: &MetadataFilter,
            ) -> Result<Vec<lectern_index::SearchHit>, lectern_index::IndexError> {
                panic!("search must not be called for k = 0");
            }
            async fn delete_by_document(&self, _: Uuid) -> Result<usize, lectern_index::IndexError> {
                unreachable!()
            }
            async fn delete_by_collection(
                &self,
                _: Uuid,
            ) -> Result<usize, lectern_index::IndexError> {
                unreachable!()
            }
            async fn chunk_ids_for_document(
                &self,
                _: Uuid,
            ) -> Result<Vec<Uuid>, lectern_index::IndexError> {
                unreachable!()
            }
            async fn ping(&self) -> Result<(), lectern_index::IndexError> {
                Ok(())
            }
        }

        let fx = fixture().await;
        let engine = RetrievalEngine::new(
            Arc::clone(&fx.embedder) as Arc<dyn Embedder>,
            Arc::new(PanicVectors),
            Arc::clone(&fx.store) as Arc<dyn Store>,
        );
        let mut req = RetrievalRequest::new("anything");
        req.k = 0;
        let ctx = engine.retrieve(&req, &wide_budget()).await.unwrap();
        assert!(ctx.chunks.is_empty());
        assert!(ctx.insufficient_context);
    }

    #[tokio::test]
    async fn threshold_filters_weak_matches() {
        let fx = fixture().await;
        seed_document(
            &fx,
            &["alpha beta gamma delta", "zzz qqq www completely disjoint"],
        )
        .await;

        let mut req = RetrievalRequest::new("alpha beta gamma delta");
        req.similarity_threshold = 0.9;
        let ctx = fx.engine.retrieve(&req, &wide_budget()).await.unwrap();
        assert_eq!(ctx.chunks.len(), 1);
    }

    #[tokio::test]
    async fn collection_filter_excludes_other_collections() {
        let fx = fixture().await;
        seed_document(&fx, &["shared topic text about retrieval"]).await;

        let mut req = RetrievalRequest::new("shared topic text about retrieval");
        req.collection_ids = Some(vec![Uuid::new_v4()]); // not the seeded one
        let ctx = fx.engine.retrieve(&req, &wide_budget()).await.unwrap();
        assert!(ctx.insufficient_context);

        req.collection_ids = Some(vec![fx.collection.id]);
        let ctx = fx.engine.retrieve(&req, &wide_budget()).await.unwrap();
        assert_eq!(ctx.chunks.len(), 1);
    }

    #[tokio::test]
    async fn packing_skips_oversized_candidates_and_flags_truncation() {
        let fx = fixture().await;
        let query = "shared keywords appear everywhere in this corpus";
        // Best match is huge; runner-up is small and shares fewer trigrams.
        let huge = format!("{query} {}", "filler ".repeat(2000));
        seed_document(&fx, &[huge.as_str(), "shared keywords appear sometimes"]).await;

        let budget = ContextBudget {
            context_window: 1200,
            system_prompt_tokens: 50,
            reserved_completion_tokens: 1024,
            conversation_history_tokens: 0,
        };
        let req = RetrievalRequest::new(query);
        let ctx = fx.engine.retrieve(&req, &budget).await.unwrap();
        assert_eq!(ctx.chunks.len(), 1, "only the small chunk fits");
        assert!(ctx.chunks[0].text.contains("sometimes"));
        assert!(ctx.truncated);
    }

    #[tokio::test]
    async fn zero_fitting_candidates_is_insufficient_context() {
        let fx = fixture().await;
        let text = format!("relevant answer text {}", "pad ".repeat(4000));
        seed_document(&fx, &[text.as_str()]).await;

        let budget = ContextBudget {
            context_window: 1100,
            system_prompt_tokens: 50,
            reserved_completion_tokens: 1024,
            conversation_history_tokens: 0,
        };
        let req = RetrievalRequest::new("relevant answer text");
        let ctx = fx.engine.retrieve(&req, &budget).await.unwrap();
        assert!(ctx.chunks.is_empty());
        assert!(ctx.insufficient_context);
        assert!(ctx.truncated);
    }

    #[tokio::test]
    async fn equal_scores_break_by_document_recency() {
        let fx = fixture().await;
        let text = "identical chunk text in both documents";
        let older = seed_document(&fx, &[text]).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = seed_document(&fx, &[text]).await;
        assert!(older.updated_at <= newer.updated_at);

        let mut req = RetrievalRequest::new(text);
        req.k = 2;
        let ctx = fx.engine.retrieve(&req, &wide_budget()).await.unwrap();
        assert_eq!(ctx.chunks.len(), 2);
        assert_eq!(ctx.chunks[0].document_id, newer.id);
    }

    #[tokio::test]
    async fn deleted_document_chunks_are_dropped_at_hydration() {
        let fx = fixture().await;
        let doc = seed_document(&fx, &["text that will be soft deleted"]).await;
        DocumentRepo::soft_delete(&*fx.store, doc.id).await.unwrap();

        let req = RetrievalRequest::new("text that will be soft deleted");
        let ctx = fx.engine.retrieve(&req, &wide_budget()).await.unwrap();
        assert!(ctx.insufficient_context);
    }

    #[tokio::test]
    async fn empty_question_is_a_validation_error() {
        let fx = fixture().await;
        let req = RetrievalRequest::new("   ");
        let err = fx.engine.retrieve(&req, &wide_budget()).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Validation(_)));
    }
}
