// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The ingestion worker: drives one job through fetch → parse → split →
//! embed → store → finalize, publishing `(stage, percentage, message)` on
//! every stage change and every processed batch.
//!
//! Stage percentage bands: fetching 0–5, parsing 5–15, splitting 15–30,
//! embedding 30–80, storing 80–95, finalizing 95–100.
//!
//! # Failure semantics
//!
//! Transient embed/store failures retry with exponential backoff; after
//! exhaustion — or on any terminal fetch/parse error — the document moves to
//! `failed` and a compensating purge removes partial chunks from both the
//! transactional store and the vector index.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lectern_config::{IngestSettings, SettingsResolver};
use lectern_embed::Embedder;
use lectern_index::{ChunkMetadata, VectorRecord, VectorStore};
use lectern_store::{
    Chunk, ChunkRepo, Document, DocumentRepo, DocumentStatus, IngestStage, Progress, Store,
};

use crate::{
    chunker::{chunk_text, ChunkPolicy},
    parser::extract_text,
    progress::{ProgressHub, ProgressUpdate},
    IngestError, IngestJob,
};

/// Per-batch deadline for the embedder call.
const EMBED_BATCH_DEADLINE: Duration = Duration::from_secs(30);

pub struct IngestWorker {
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    settings: Arc<SettingsResolver>,
    progress: Arc<ProgressHub>,
}

impl IngestWorker {
    pub fn new(
        store: Arc<dyn Store>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        settings: Arc<SettingsResolver>,
        progress: Arc<ProgressHub>,
    ) -> Self {
        Self {
            store,
            vectors,
            embedder,
            settings,
            progress,
        }
    }

    /// Process one job.  Idempotent keyed on the document id: an already
    /// complete document is a no-op; a failed or interrupted one restarts
    /// from scratch after purging partial chunks.
    pub async fn process(&self, job: IngestJob) -> Result<(), IngestError> {
        let doc = match self.store.documents().get_any(job.document_id).await {
            Ok(d) => d,
            Err(_) => {
                warn!(document = %job.document_id, "job references a missing document; skipping");
                return Ok(());
            }
        };
        if doc.deleted_at.is_some() {
            debug!(document = %doc.id, "document deleted before processing; skipping");
            return Ok(());
        }
        match doc.status {
            DocumentStatus::Complete => {
                debug!(document = %doc.id, "document already complete; no-op");
                return Ok(());
            }
            DocumentStatus::Failed | DocumentStatus::Processing => {
                // Re-delivery or retry: start from scratch.
                self.purge_partial(doc.id).await?;
            }
            DocumentStatus::Pending => {}
        }

        match self.pipeline(&job, &doc).await {
            Ok(chunk_count) => {
                info!(document = %doc.id, chunk_count, "ingestion complete");
                Ok(())
            }
            Err(e) => {
                error!(document = %doc.id, error = %e, "ingestion failed");
                self.fail_document(&doc, &e).await;
                Err(e)
            }
        }
    }

    async fn pipeline(&self, job: &IngestJob, doc: &Document) -> Result<u32, IngestError> {
        let settings = self.settings.effective();

        // ── fetching ──────────────────────────────────────────────────────────
        self.publish(doc.id, DocumentStatus::Processing, IngestStage::Fetching, 0, "loading upload", None)
            .await?;
        let bytes = tokio::fs::read(&job.upload_handle)
            .await
            .map_err(|e| IngestError::Fetch(format!("cannot read upload bytes: {e}")))?;
        if bytes.len() as u64 != doc.size_bytes {
            return Err(IngestError::Fetch(format!(
                "staged bytes ({}) do not match declared size ({})",
                bytes.len(),
                doc.size_bytes
            )));
        }
        self.publish(doc.id, DocumentStatus::Processing, IngestStage::Fetching, 5, "upload verified", None)
            .await?;

        // ── parsing ───────────────────────────────────────────────────────────
        let text = extract_text(&bytes, &doc.mime_type)?;
        self.publish(doc.id, DocumentStatus::Processing, IngestStage::Parsing, 15, "text extracted", None)
            .await?;

        // ── splitting ─────────────────────────────────────────────────────────
        let policy = ChunkPolicy {
            target_chars: settings.chunking.target_chars,
            overlap_chars: settings.chunking.overlap_chars,
            min_chars: settings.chunking.min_chars,
        };
        let drafts = chunk_text(&text, &policy);
        if drafts.is_empty() {
            return Err(IngestError::Parse("no chunks produced".into()));
        }
        let chunks: Vec<Chunk> = drafts
            .iter()
            .enumerate()
            .map(|(i, d)| Chunk {
                id: Uuid::new_v4(),
                document_id: doc.id,
                ordinal: i as u32,
                token_estimate: Chunk::approx_tokens(&d.text),
                text: d.text.clone(),
                page: None,
                section: d.section.clone(),
            })
            .collect();
        self.publish(
            doc.id,
            DocumentStatus::Processing,
            IngestStage::Splitting,
            30,
            &format!("split into {} chunks", chunks.len()),
            None,
        )
        .await?;

        // ── embedding ─────────────────────────────────────────────────────────
        let batch_size = settings.embedder.batch_size.max(1);
        let batches: Vec<&[Chunk]> = chunks.chunks(batch_size).collect();
        let total = batches.len();
        let mut embedded: Vec<Vec<f32>> = Vec::with_capacity(chunks.len());
        for (i, batch) in batches.iter().enumerate() {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedder = Arc::clone(&self.embedder);
            let vectors = self
                .with_retries(&settings.ingest, "embed batch", move || {
                    let embedder = Arc::clone(&embedder);
                    let texts = texts.clone();
                    async move {
                        match tokio::time::timeout(EMBED_BATCH_DEADLINE, embedder.embed(&texts))
                            .await
                        {
                            Ok(result) => result.map_err(IngestError::from),
                            Err(_) => Err(IngestError::Embed(
                                lectern_embed::EmbedError::Unavailable(
                                    "embed batch deadline exceeded".into(),
                                ),
                            )),
                        }
                    }
                })
                .await?;
            embedded.extend(vectors);
            let pct = 30 + (50 * (i + 1) / total) as u8;
            self.publish(
                doc.id,
                DocumentStatus::Processing,
                IngestStage::Embedding,
                pct,
                &format!("embedded batch {}/{total}", i + 1),
                None,
            )
            .await?;
        }

        // ── storing ───────────────────────────────────────────────────────────
        // Vectors and chunk rows land batch by batch; each batch is one
        // store transaction so a mid-flight crash leaves a dense prefix.
        for (i, batch) in batches.iter().enumerate() {
            let records: Vec<VectorRecord> = batch
                .iter()
                .map(|c| VectorRecord {
                    chunk_id: c.id,
                    vector: embedded[c.ordinal as usize].clone(),
                    metadata: ChunkMetadata {
                        document_id: doc.id,
                        collection_id: job.collection_id,
                        ordinal: c.ordinal,
                        page: c.page,
                        section: c.section.clone(),
                    },
                })
                .collect();
            let vector_store = Arc::clone(&self.vectors);
            self.with_retries(&settings.ingest, "upsert vectors", move || {
                let vector_store = Arc::clone(&vector_store);
                let records = records.clone();
                async move { vector_store.upsert(records).await.map_err(IngestError::from) }
            })
            .await?;
            self.store
                .chunks()
                .append_batch(doc.id, batch.to_vec())
                .await?;
            let pct = 80 + (15 * (i + 1) / total) as u8;
            self.publish(
                doc.id,
                DocumentStatus::Processing,
                IngestStage::Storing,
                pct,
                &format!("stored batch {}/{total}", i + 1),
                None,
            )
            .await?;
        }

        // ── finalizing ────────────────────────────────────────────────────────
        let count = chunks.len() as u32;
        self.publish(
            doc.id,
            DocumentStatus::Complete,
            IngestStage::Finalizing,
            100,
            "complete",
            Some(count),
        )
        .await?;
        Ok(count)
    }

    /// Remove every trace of partial processing from C1 and C2.
    async fn purge_partial(&self, document_id: Uuid) -> Result<(), IngestError> {
        let removed_chunks = self.store.chunks().delete_by_document(document_id).await?;
        let removed_vectors = self.vectors.delete_by_document(document_id).await?;
        if removed_chunks > 0 || removed_vectors > 0 {
            debug!(
                document = %document_id,
                removed_chunks, removed_vectors,
                "purged partial chunks before reprocessing"
            );
        }
        Ok(())
    }

    /// Compensating action for a terminal failure.
    async fn fail_document(&self, doc: &Document, cause: &IngestError) {
        if let Err(e) = self.purge_partial(doc.id).await {
            error!(document = %doc.id, "compensating purge failed: {e}");
        }
        let stage = match cause {
            IngestError::Fetch(_) => IngestStage::Fetching,
            IngestError::Parse(_) => IngestStage::Parsing,
            IngestError::Embed(_) => IngestStage::Embedding,
            _ => IngestStage::Storing,
        };
        if let Err(e) = self
            .publish(
                doc.id,
                DocumentStatus::Failed,
                stage,
                doc.progress.percentage,
                &cause.to_string(),
                Some(0),
            )
            .await
        {
            error!(document = %doc.id, "failed to record failure state: {e}");
        }
    }

    /// Persist progress on the document row and fan it out to live
    /// subscribers.  Batches arrive well inside the two-second publishing
    /// contract, so no separate ticker is needed.
    async fn publish(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        stage: IngestStage,
        percentage: u8,
        message: &str,
        chunk_count: Option<u32>,
    ) -> Result<(), IngestError> {
        let progress = Progress {
            stage,
            percentage,
            message: message.to_string(),
        };
        let doc = self
            .store
            .documents()
            .set_status(document_id, status, progress, chunk_count)
            .await?;
        self.progress.publish(ProgressUpdate {
            document_id,
            status,
            stage,
            percentage,
            message: message.to_string(),
            chunk_count: doc.chunk_count,
        });
        Ok(())
    }

    /// Run `op` with exponential backoff on transient failures: base delay
    /// doubling per attempt up to the cap, at most `max_retries` attempts.
    async fn with_retries<T, Fut>(
        &self,
        settings: &IngestSettings,
        what: &str,
        mut op: impl FnMut() -> Fut,
    ) -> Result<T, IngestError>
    where
        Fut: std::future::Future<Output = Result<T, IngestError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < settings.max_retries.max(1) => {
                    let delay = backoff_delay(attempt, settings.backoff_base_ms, settings.backoff_cap_ms);
                    warn!(what, attempt, ?delay, error = %e, "transient failure; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `base × 2^attempt`, capped.
fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
    Duration::from_millis(exp.min(cap_ms))
}

/// Spawn `parallelism` workers sharing one queue receiver.  The pool drains
/// until the queue's sender side closes.
pub fn run_worker_pool(
    parallelism: usize,
    rx: mpsc::Receiver<IngestJob>,
    worker: Arc<IngestWorker>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..parallelism.max(1))
        .map(|i| {
            let rx = Arc::clone(&rx);
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => {
                            let document = job.document_id;
                            if let Err(e) = worker.process(job).await {
                                error!(document = %document, "ingestion job failed: {e}");
                            }
                        }
                        None => break,
                    }
                }
                debug!(worker = i, "ingestion worker stopped");
            })
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
