// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lectern_config::SettingsResolver;
use lectern_index::VectorStore;
use lectern_ingest::{IngestError, IngestJob, IngestQueue};
use lectern_store::{
    ChunkRepo, Collection, CollectionKind, CollectionRepo, Document, DocumentRepo, ListParams,
    Store, StoreError, Upload, UploadRepo, UploadState,
};

use crate::{Actor, LibraryError, StagingArea};

#[derive(Debug, Clone)]
pub struct CreateCollection {
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub kind: CollectionKind,
    pub parent_id: Option<Uuid>,
}

/// Patch for rename/move/cosmetics.  `parent_id` distinguishes "leave
/// alone" (`None`) from "move to root" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct UpdateCollection {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub icon: Option<Option<String>>,
    pub color: Option<Option<String>>,
    pub parent_id: Option<Option<Uuid>>,
}

#[derive(Debug, Clone)]
pub struct BindUpload {
    pub upload_id: Uuid,
    pub collection_id: Uuid,
    pub title: Option<String>,
}

pub struct LibraryService {
    store: Arc<dyn Store>,
    vectors: Arc<dyn VectorStore>,
    queue: IngestQueue,
    staging: Arc<StagingArea>,
    settings: Arc<SettingsResolver>,
}

impl LibraryService {
    pub fn new(
        store: Arc<dyn Store>,
        vectors: Arc<dyn VectorStore>,
        queue: IngestQueue,
        staging: Arc<StagingArea>,
        settings: Arc<SettingsResolver>,
    ) -> Self {
        Self {
            store,
            vectors,
            queue,
            staging,
            settings,
        }
    }

    fn ensure_owner(&self, actor: &Actor, owner_id: Uuid) -> Result<(), LibraryError> {
        if actor.is_admin || actor.user_id == owner_id {
            Ok(())
        } else {
            Err(LibraryError::Forbidden)
        }
    }

    // ── Collections ───────────────────────────────────────────────────────────

    pub async fn create_collection(
        &self,
        actor: &Actor,
        req: CreateCollection,
    ) -> Result<Collection, LibraryError> {
        if req.name.trim().is_empty() {
            return Err(LibraryError::Validation("collection name is empty".into()));
        }
        if let Some(parent_id) = req.parent_id {
            let parent = self.store.collections().get(parent_id).await?;
            self.ensure_owner(actor, parent.owner_id)?;
        }
        let mut collection =
            Collection::new(actor.user_id, req.name.trim(), req.kind, req.parent_id);
        collection.description = req.description;
        collection.icon = req.icon;
        collection.color = req.color;
        let created = self.store.collections().create(collection).await?;
        info!(collection = %created.id, path = %created.path, "collection created");
        Ok(created)
    }

    pub async fn get_collection(
        &self,
        actor: &Actor,
        id: Uuid,
    ) -> Result<Collection, LibraryError> {
        let collection = self.store.collections().get(id).await?;
        self.ensure_owner(actor, collection.owner_id)?;
        Ok(collection)
    }

    pub async fn list_collections(
        &self,
        actor: &Actor,
        parent_id: Option<Uuid>,
        params: &ListParams,
    ) -> Result<Vec<Collection>, LibraryError> {
        Ok(self
            .store
            .collections()
            .list(actor.user_id, parent_id, params)
            .await?)
    }

    /// Rename/move/update a collection.  Moves recompute every descendant's
    /// materialized path atomically in the store.
    pub async fn update_collection(
        &self,
        actor: &Actor,
        id: Uuid,
        patch: UpdateCollection,
        expected_version: u64,
    ) -> Result<Collection, LibraryError> {
        let mut collection = self.store.collections().get(id).await?;
        self.ensure_owner(actor, collection.owner_id)?;

        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(LibraryError::Validation("collection name is empty".into()));
            }
            collection.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            collection.description = description;
        }
        if let Some(icon) = patch.icon {
            collection.icon = icon;
        }
        if let Some(color) = patch.color {
            collection.color = color;
        }
        if let Some(parent_id) = patch.parent_id {
            if let Some(pid) = parent_id {
                let parent = self.store.collections().get(pid).await?;
                self.ensure_owner(actor, parent.owner_id)?;
            }
            collection.parent_id = parent_id;
        }

        Ok(self
            .store
            .collections()
            .update(collection, expected_version)
            .await?)
    }

    /// Soft delete by default; `hard` cascades to descendants, documents,
    /// chunks, and vectors, and is not reversible.
    pub async fn delete_collection(
        &self,
        actor: &Actor,
        id: Uuid,
        hard: bool,
    ) -> Result<(), LibraryError> {
        let collection = self.store.collections().get_any(id).await?;
        self.ensure_owner(actor, collection.owner_id)?;

        if !hard {
            self.store.collections().soft_delete(id).await?;
            for descendant in self.store.collections().descendants(id).await? {
                self.store.collections().soft_delete(descendant.id).await?;
            }
            info!(collection = %id, "collection soft-deleted");
            return Ok(());
        }

        // Deepest first so children vanish before their parents.
        let mut targets = self.store.collections().descendants(id).await?;
        targets.push(collection);
        targets.reverse();
        for target in targets {
            let docs = self
                .store
                .documents()
                .list_by_collection(
                    target.id,
                    &ListParams {
                        limit: usize::MAX,
                        offset: 0,
                        include_deleted: true,
                    },
                )
                .await?;
            for doc in docs {
                self.store.chunks().delete_by_document(doc.id).await?;
                self.store.documents().hard_delete(doc.id).await?;
            }
            self.vectors.delete_by_collection(target.id).await?;
            self.store.collections().hard_delete(target.id).await?;
        }
        info!(collection = %id, "collection hard-deleted with cascade");
        Ok(())
    }

    // ── Two-phase upload ──────────────────────────────────────────────────────

    /// Phase 1: stage bytes and create the `Upload` record.
    pub async fn begin_upload(
        &self,
        actor: &Actor,
        file_name: &str,
        declared_size: u64,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Upload, LibraryError> {
        let settings = self.settings.effective();
        if bytes.len() as u64 > settings.uploads.max_bytes {
            return Err(LibraryError::PayloadTooLarge {
                got: bytes.len() as u64,
                limit: settings.uploads.max_bytes,
            });
        }
        // Exactly the declared size is fine; anything over it is oversized,
        // anything under is a truncated transfer.
        if bytes.len() as u64 > declared_size {
            return Err(LibraryError::PayloadTooLarge {
                got: bytes.len() as u64,
                limit: declared_size,
            });
        }
        if (bytes.len() as u64) < declared_size {
            return Err(LibraryError::Validation(format!(
                "received {} bytes but {} were declared",
                bytes.len(),
                declared_size
            )));
        }

        let upload_id = Uuid::new_v4();
        let handle = self.staging.save(upload_id, &bytes).await?;
        let upload = Upload {
            id: upload_id,
            owner_id: actor.user_id,
            file_name: file_name.to_string(),
            declared_size,
            mime_type: mime_type.to_string(),
            storage_handle: handle,
            state: UploadState::Uploaded,
            created_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::seconds(settings.uploads.ttl_secs as i64),
            version: 1,
        };
        let created = self.store.uploads().create(upload).await?;
        info!(upload = %created.id, bytes = declared_size, "upload accepted");
        Ok(created)
    }

    /// Phase 2: bind the upload, create the `pending` document, and enqueue
    /// ingestion.
    pub async fn bind_upload(
        &self,
        actor: &Actor,
        req: BindUpload,
    ) -> Result<Document, LibraryError> {
        let upload = self.store.uploads().get(req.upload_id).await?;
        self.ensure_owner(actor, upload.owner_id)?;
        match upload.state {
            UploadState::Bound => {
                return Err(LibraryError::Conflict(
                    "upload is already bound to a document".into(),
                ))
            }
            UploadState::Expired => {
                return Err(LibraryError::Gone("upload has expired".into()));
            }
            UploadState::Uploaded if upload.expires_at <= Utc::now() => {
                return Err(LibraryError::Gone("upload has expired".into()));
            }
            UploadState::Uploaded => {}
        }
        let collection = self.store.collections().get(req.collection_id).await?;
        self.ensure_owner(actor, collection.owner_id)?;

        let upload = self.store.uploads().bind(req.upload_id).await?;

        let mut document = Document::new(
            collection.id,
            req.title.unwrap_or_else(|| upload.file_name.clone()),
            upload.file_name.clone(),
            upload.declared_size,
            upload.mime_type.clone(),
        );
        document.upload_id = Some(upload.id);
        let document = self.store.documents().create(document).await?;
        self.store
            .collections()
            .adjust_document_count(collection.id, 1)
            .await?;

        let job = IngestJob {
            document_id: document.id,
            upload_handle: upload.storage_handle.clone(),
            collection_id: collection.id,
            requested_at: Utc::now(),
        };
        if let Err(IngestError::Busy) = self.queue.enqueue(job) {
            // Compensate so the client can retry the bind later.
            warn!(document = %document.id, "ingestion queue full; rolling back bind");
            let _ = self.store.documents().hard_delete(document.id).await;
            let _ = self
                .store
                .collections()
                .adjust_document_count(collection.id, -1)
                .await;
            let _ = self.store.uploads().release(upload.id).await;
            return Err(LibraryError::Busy);
        }
        info!(document = %document.id, upload = %upload.id, "document created and queued");
        Ok(document)
    }

    /// Expire unbound uploads past their TTL and reclaim staged bytes.
    pub async fn sweep_expired_uploads(&self) -> Result<usize, LibraryError> {
        let expired = self.store.uploads().expire_due(Utc::now()).await?;
        for upload in &expired {
            if let Err(e) = self.staging.remove(&upload.storage_handle).await {
                warn!(upload = %upload.id, "staged bytes reclamation failed: {e}");
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired unbound uploads");
        }
        Ok(expired.len())
    }

    /// Background sweep driven by `uploads.sweep_interval_secs`.
    pub fn spawn_upload_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let interval = self.settings.effective().uploads.sweep_interval_secs;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = service.sweep_expired_uploads().await {
                    warn!("upload sweep failed: {e}");
                }
            }
        })
    }

    // ── Documents ─────────────────────────────────────────────────────────────

    pub async fn get_document(&self, actor: &Actor, id: Uuid) -> Result<Document, LibraryError> {
        let document = self.store.documents().get(id).await?;
        let collection = self.store.collections().get_any(document.collection_id).await?;
        self.ensure_owner(actor, collection.owner_id)?;
        Ok(document)
    }

    pub async fn list_documents(
        &self,
        actor: &Actor,
        collection_id: Uuid,
        params: &ListParams,
    ) -> Result<Vec<Document>, LibraryError> {
        let collection = self.store.collections().get(collection_id).await?;
        self.ensure_owner(actor, collection.owner_id)?;
        Ok(self
            .store
            .documents()
            .list_by_collection(collection_id, params)
            .await?)
    }

    /// Delete a document.  Chunks leave both stores either way; `hard`
    /// additionally removes the row.  Idempotent: deleting again succeeds.
    pub async fn delete_document(
        &self,
        actor: &Actor,
        id: Uuid,
        hard: bool,
    ) -> Result<(), LibraryError> {
        let document = match self.store.documents().get_any(id).await {
            Ok(d) => d,
            // Hard-deleted already: idempotent success.
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let collection = self.store.collections().get_any(document.collection_id).await?;
        self.ensure_owner(actor, collection.owner_id)?;

        self.store.chunks().delete_by_document(id).await?;
        self.vectors.delete_by_document(id).await?;

        let already_gone = document.deleted_at.is_some();
        if hard {
            self.store.documents().hard_delete(id).await?;
        } else {
            self.store.documents().soft_delete(id).await?;
        }
        if !already_gone {
            self.store
                .collections()
                .adjust_document_count(document.collection_id, -1)
                .await?;
        }
        debug!(document = %id, hard, "document deleted");
        Ok(())
    }

    /// Re-enqueue a failed document for processing from its staged bytes.
    pub async fn retry_document(&self, actor: &Actor, id: Uuid) -> Result<Document, LibraryError> {
        let document = self.get_document(actor, id).await?;
        if document.status != lectern_store::DocumentStatus::Failed {
            return Err(LibraryError::Conflict(format!(
                "document is {:?}; only failed documents can be retried",
                document.status
            )));
        }
        let upload_id = document
            .upload_id
            .ok_or(LibraryError::Validation("document has no staged upload".into()))?;
        let upload = self.store.uploads().get(upload_id).await?;
        let job = IngestJob {
            document_id: document.id,
            upload_handle: upload.storage_handle,
            collection_id: document.collection_id,
            requested_at: Utc::now(),
        };
        self.queue.enqueue(job).map_err(|e| match e {
            IngestError::Busy => LibraryError::Busy,
            other => LibraryError::Validation(other.to_string()),
        })?;
        Ok(document)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
