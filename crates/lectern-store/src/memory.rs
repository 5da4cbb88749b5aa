// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Single-node reference implementation of the [`Store`] trait.
//!
//! All tables live behind one `RwLock`, which is what makes multi-entity
//! writes transactional here: a write guard spans the whole operation, so
//! readers never observe a half-applied cascade.  A SQL adapter replaces
//! this with real transactions behind the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::repo::*;
use crate::types::*;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    sessions: HashMap<Uuid, Session>,
    collections: HashMap<Uuid, Collection>,
    documents: HashMap<Uuid, Document>,
    chunks: HashMap<Uuid, Chunk>,
    /// Chunk ids per document, ordinal order.
    chunks_by_document: HashMap<Uuid, Vec<Uuid>>,
    uploads: HashMap<Uuid, Upload>,
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, StoredMessage>,
    /// Message ids per conversation, append order.
    messages_by_conversation: HashMap<Uuid, Vec<Uuid>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ─── Collection helpers ───────────────────────────────────────────────────────

/// Walk the parent chain upward.  Returns `Validation` if a link is missing.
fn ancestor_chain(inner: &Inner, mut parent_id: Option<Uuid>) -> Result<Vec<Uuid>, StoreError> {
    let mut chain = Vec::new();
    while let Some(pid) = parent_id {
        let parent = inner
            .collections
            .get(&pid)
            .ok_or(StoreError::Validation(format!("parent {pid} does not exist")))?;
        chain.push(pid);
        parent_id = parent.parent_id;
        if chain.len() > inner.collections.len() {
            return Err(StoreError::Validation("collection parent cycle".into()));
        }
    }
    Ok(chain)
}

fn path_for(inner: &Inner, parent_id: Option<Uuid>, name: &str) -> Result<String, StoreError> {
    match parent_id {
        None => Ok(name.to_string()),
        Some(pid) => {
            let parent = inner
                .collections
                .get(&pid)
                .filter(|p| p.deleted_at.is_none())
                .ok_or(StoreError::Validation(format!(
                    "parent collection {pid} does not exist"
                )))?;
            Ok(format!("{}/{}", parent.path, name))
        }
    }
}

/// Direct children of `id`, any state.
fn children_of(inner: &Inner, id: Uuid) -> Vec<Uuid> {
    inner
        .collections
        .values()
        .filter(|c| c.parent_id == Some(id))
        .map(|c| c.id)
        .collect()
}

/// Recompute materialized paths for the whole subtree rooted at `id`.
fn recompute_subtree_paths(inner: &mut Inner, id: Uuid) {
    let mut stack = vec![id];
    while let Some(cur) = stack.pop() {
        let (parent_path, name) = {
            let node = &inner.collections[&cur];
            let parent_path = node
                .parent_id
                .and_then(|pid| inner.collections.get(&pid))
                .map(|p| p.path.clone());
            (parent_path, node.name.clone())
        };
        let path = match parent_path {
            Some(pp) => format!("{pp}/{name}"),
            None => name,
        };
        inner.collections.get_mut(&cur).unwrap().path = path;
        stack.extend(children_of(inner, cur));
    }
}

// ─── UserRepo ─────────────────────────────────────────────────────────────────

#[async_trait]
impl UserRepo for MemoryStore {
    async fn create(&self, mut user: User) -> Result<User, StoreError> {
        let mut inner = self.inner.write().await;
        user.email = user.email.to_lowercase();
        if inner.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Validation(format!(
                "email {} is already registered",
                user.email
            )));
        }
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get(&self, id: Uuid) -> Result<User, StoreError> {
        self.inner
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("user"))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = email.to_lowercase();
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn update(&self, mut user: User, expected_version: u64) -> Result<User, StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner.users.get_mut(&user.id).ok_or(StoreError::NotFound("user"))?;
        if stored.version != expected_version {
            return Err(StoreError::stale(expected_version, stored.version));
        }
        user.version = expected_version + 1;
        user.updated_at = Utc::now();
        *stored = user.clone();
        Ok(user)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.read().await.users.len())
    }
}

// ─── SessionRepo ──────────────────────────────────────────────────────────────

#[async_trait]
impl SessionRepo for MemoryStore {
    async fn create(&self, session: Session) -> Result<Session, StoreError> {
        let mut inner = self.inner.write().await;
        inner.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn get(&self, id: Uuid) -> Result<Session, StoreError> {
        self.inner
            .read()
            .await
            .sessions
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("session"))
    }

    async fn find_by_access_digest(&self, digest: &str) -> Result<Option<Session>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .find(|s| s.access_digest == digest)
            .cloned())
    }

    async fn find_by_refresh_digest(&self, digest: &str) -> Result<Option<Session>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .values()
            .find(|s| s.refresh_digest == digest)
            .cloned())
    }

    async fn revoke(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(s) = inner.sessions.get_mut(&id) {
            s.revoked = true;
        }
        Ok(())
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut n = 0;
        for s in inner.sessions.values_mut() {
            if s.user_id == user_id && !s.revoked {
                s.revoked = true;
                n += 1;
            }
        }
        Ok(n)
    }
}

// ─── CollectionRepo ───────────────────────────────────────────────────────────

#[async_trait]
impl CollectionRepo for MemoryStore {
    async fn create(&self, mut collection: Collection) -> Result<Collection, StoreError> {
        let mut inner = self.inner.write().await;
        if collection.name.contains('/') {
            return Err(StoreError::Validation(
                "collection names may not contain '/'".into(),
            ));
        }
        collection.path = path_for(&inner, collection.parent_id, &collection.name)?;
        inner.collections.insert(collection.id, collection.clone());
        Ok(collection)
    }

    async fn get(&self, id: Uuid) -> Result<Collection, StoreError> {
        self.inner
            .read()
            .await
            .collections
            .get(&id)
            .filter(|c| c.deleted_at.is_none())
            .cloned()
            .ok_or(StoreError::NotFound("collection"))
    }

    async fn get_any(&self, id: Uuid) -> Result<Collection, StoreError> {
        self.inner
            .read()
            .await
            .collections
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("collection"))
    }

    async fn list(
        &self,
        owner_id: Uuid,
        parent_id: Option<Uuid>,
        params: &ListParams,
    ) -> Result<Vec<Collection>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Collection> = inner
            .collections
            .values()
            .filter(|c| c.owner_id == owner_id && c.parent_id == parent_id)
            .filter(|c| params.include_deleted || c.deleted_at.is_none())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(rows.into_iter().skip(params.offset).take(params.limit).collect())
    }

    async fn update(
        &self,
        mut collection: Collection,
        expected_version: u64,
    ) -> Result<Collection, StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .collections
            .get(&collection.id)
            .ok_or(StoreError::NotFound("collection"))?
            .clone();
        if stored.version != expected_version {
            return Err(StoreError::stale(expected_version, stored.version));
        }
        if collection.name.contains('/') {
            return Err(StoreError::Validation(
                "collection names may not contain '/'".into(),
            ));
        }

        let moved = collection.parent_id != stored.parent_id;
        let renamed = collection.name != stored.name;
        if moved {
            // A collection may not become its own ancestor.
            let chain = ancestor_chain(&inner, collection.parent_id)?;
            if chain.contains(&collection.id) {
                return Err(StoreError::Validation(
                    "a collection may not be moved under its own descendant".into(),
                ));
            }
        }

        collection.version = expected_version + 1;
        collection.updated_at = Utc::now();
        collection.path = path_for(&inner, collection.parent_id, &collection.name)?;
        inner.collections.insert(collection.id, collection.clone());

        if moved || renamed {
            recompute_subtree_paths(&mut inner, collection.id);
        }
        Ok(inner.collections[&collection.id].clone())
    }

    async fn descendants(&self, id: Uuid) -> Result<Vec<Collection>, StoreError> {
        let inner = self.inner.read().await;
        if !inner.collections.contains_key(&id) {
            return Err(StoreError::NotFound("collection"));
        }
        let mut out = Vec::new();
        let mut stack = children_of(&inner, id);
        while let Some(cur) = stack.pop() {
            stack.extend(children_of(&inner, cur));
            out.push(inner.collections[&cur].clone());
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let c = inner
            .collections
            .get_mut(&id)
            .ok_or(StoreError::NotFound("collection"))?;
        if c.deleted_at.is_none() {
            c.deleted_at = Some(Utc::now());
            c.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn hard_delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.write().await.collections.remove(&id);
        Ok(())
    }

    async fn adjust_document_count(&self, id: Uuid, delta: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let mut cur = Some(id);
        while let Some(cid) = cur {
            let c = inner
                .collections
                .get_mut(&cid)
                .ok_or(StoreError::NotFound("collection"))?;
            c.document_count = (c.document_count as i64 + delta).max(0) as u64;
            cur = c.parent_id;
        }
        Ok(())
    }
}

// ─── DocumentRepo ─────────────────────────────────────────────────────────────

#[async_trait]
impl DocumentRepo for MemoryStore {
    async fn create(&self, document: Document) -> Result<Document, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner
            .collections
            .get(&document.collection_id)
            .map(|c| c.deleted_at.is_none())
            .unwrap_or(false)
        {
            return Err(StoreError::Validation(format!(
                "collection {} does not exist",
                document.collection_id
            )));
        }
        inner.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn get(&self, id: Uuid) -> Result<Document, StoreError> {
        self.inner
            .read()
            .await
            .documents
            .get(&id)
            .filter(|d| d.deleted_at.is_none())
            .cloned()
            .ok_or(StoreError::NotFound("document"))
    }

    async fn get_any(&self, id: Uuid) -> Result<Document, StoreError> {
        self.inner
            .read()
            .await
            .documents
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("document"))
    }

    async fn list_by_collection(
        &self,
        collection_id: Uuid,
        params: &ListParams,
    ) -> Result<Vec<Document>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Document> = inner
            .documents
            .values()
            .filter(|d| d.collection_id == collection_id)
            .filter(|d| params.include_deleted || d.deleted_at.is_none())
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(rows.into_iter().skip(params.offset).take(params.limit).collect())
    }

    async fn update(
        &self,
        mut document: Document,
        expected_version: u64,
    ) -> Result<Document, StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .documents
            .get_mut(&document.id)
            .ok_or(StoreError::NotFound("document"))?;
        if stored.version != expected_version {
            return Err(StoreError::stale(expected_version, stored.version));
        }
        document.version = expected_version + 1;
        document.updated_at = Utc::now();
        *stored = document.clone();
        Ok(document)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        progress: Progress,
        chunk_count: Option<u32>,
    ) -> Result<Document, StoreError> {
        let mut inner = self.inner.write().await;
        let doc = inner
            .documents
            .get_mut(&id)
            .ok_or(StoreError::NotFound("document"))?;
        doc.status = status;
        doc.progress = progress;
        if let Some(n) = chunk_count {
            doc.chunk_count = n;
        }
        if matches!(status, DocumentStatus::Complete | DocumentStatus::Failed) {
            doc.processed_at = Some(Utc::now());
        }
        doc.updated_at = Utc::now();
        doc.version += 1;
        Ok(doc.clone())
    }

    async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let d = inner
            .documents
            .get_mut(&id)
            .ok_or(StoreError::NotFound("document"))?;
        if d.deleted_at.is_none() {
            d.deleted_at = Some(Utc::now());
            d.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn hard_delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.write().await.documents.remove(&id);
        Ok(())
    }
}

// ─── ChunkRepo ────────────────────────────────────────────────────────────────

#[async_trait]
impl ChunkRepo for MemoryStore {
    async fn append_batch(&self, document_id: Uuid, chunks: Vec<Chunk>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.documents.contains_key(&document_id) {
            return Err(StoreError::NotFound("document"));
        }
        let existing = inner
            .chunks_by_document
            .get(&document_id)
            .map(|v| v.len())
            .unwrap_or(0) as u32;
        for (i, chunk) in chunks.iter().enumerate() {
            let expected = existing + i as u32;
            if chunk.document_id != document_id {
                return Err(StoreError::Validation(
                    "chunk belongs to a different document".into(),
                ));
            }
            if chunk.ordinal != expected {
                return Err(StoreError::Validation(format!(
                    "ordinal {} breaks the dense range (expected {expected})",
                    chunk.ordinal
                )));
            }
        }
        // All validated; apply as one unit under the held write guard.
        let ids = inner.chunks_by_document.entry(document_id).or_default();
        let mut new_ids: Vec<Uuid> = chunks.iter().map(|c| c.id).collect();
        ids.append(&mut new_ids);
        for chunk in chunks {
            inner.chunks.insert(chunk.id, chunk);
        }
        Ok(())
    }

    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Chunk>, StoreError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.chunks.get(id).cloned())
            .collect())
    }

    async fn list_by_document(&self, document_id: Uuid) -> Result<Vec<Chunk>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Chunk> = inner
            .chunks_by_document
            .get(&document_id)
            .map(|ids| ids.iter().filter_map(|id| inner.chunks.get(id).cloned()).collect())
            .unwrap_or_default();
        rows.sort_by_key(|c| c.ordinal);
        Ok(rows)
    }

    async fn delete_by_document(&self, document_id: Uuid) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let ids = inner.chunks_by_document.remove(&document_id).unwrap_or_default();
        for id in &ids {
            inner.chunks.remove(id);
        }
        Ok(ids.len())
    }

    async fn count_by_document(&self, document_id: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .chunks_by_document
            .get(&document_id)
            .map(|v| v.len())
            .unwrap_or(0))
    }
}

// ─── UploadRepo ───────────────────────────────────────────────────────────────

#[async_trait]
impl UploadRepo for MemoryStore {
    async fn create(&self, upload: Upload) -> Result<Upload, StoreError> {
        let mut inner = self.inner.write().await;
        inner.uploads.insert(upload.id, upload.clone());
        Ok(upload)
    }

    async fn get(&self, id: Uuid) -> Result<Upload, StoreError> {
        self.inner
            .read()
            .await
            .uploads
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("upload"))
    }

    async fn bind(&self, id: Uuid) -> Result<Upload, StoreError> {
        let mut inner = self.inner.write().await;
        let upload = inner
            .uploads
            .get_mut(&id)
            .ok_or(StoreError::NotFound("upload"))?;
        match upload.state {
            UploadState::Uploaded => {
                upload.state = UploadState::Bound;
                upload.version += 1;
                Ok(upload.clone())
            }
            UploadState::Bound => Err(StoreError::Conflict(
                "upload is already bound to a document".into(),
            )),
            UploadState::Expired => Err(StoreError::Conflict("upload has expired".into())),
        }
    }

    async fn release(&self, id: Uuid) -> Result<Upload, StoreError> {
        let mut inner = self.inner.write().await;
        let upload = inner
            .uploads
            .get_mut(&id)
            .ok_or(StoreError::NotFound("upload"))?;
        match upload.state {
            UploadState::Bound => {
                upload.state = UploadState::Uploaded;
                upload.version += 1;
                Ok(upload.clone())
            }
            _ => Err(StoreError::Conflict(
                "only a bound upload can be released".into(),
            )),
        }
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Upload>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut expired = Vec::new();
        for upload in inner.uploads.values_mut() {
            if upload.state == UploadState::Uploaded && upload.expires_at <= now {
                upload.state = UploadState::Expired;
                upload.version += 1;
                expired.push(upload.clone());
            }
        }
        Ok(expired)
    }
}

// ─── ConversationRepo ─────────────────────────────────────────────────────────

#[async_trait]
impl ConversationRepo for MemoryStore {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get(&self, id: Uuid) -> Result<Conversation, StoreError> {
        self.inner
            .read()
            .await
            .conversations
            .get(&id)
            .filter(|c| c.status != ConversationStatus::Deleted)
            .cloned()
            .ok_or(StoreError::NotFound("conversation"))
    }

    async fn list(
        &self,
        owner_id: Uuid,
        search: Option<&str>,
        params: &ListParams,
    ) -> Result<Vec<Conversation>, StoreError> {
        let needle = search.map(|s| s.to_lowercase());
        let inner = self.inner.read().await;
        let mut rows: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| c.owner_id == owner_id && c.status != ConversationStatus::Deleted)
            .filter(|c| match &needle {
                Some(n) => c.title.to_lowercase().contains(n),
                None => true,
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(rows.into_iter().skip(params.offset).take(params.limit).collect())
    }

    async fn update(
        &self,
        mut conversation: Conversation,
        expected_version: u64,
    ) -> Result<Conversation, StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .conversations
            .get_mut(&conversation.id)
            .ok_or(StoreError::NotFound("conversation"))?;
        if stored.version != expected_version {
            return Err(StoreError::stale(expected_version, stored.version));
        }
        conversation.version = expected_version + 1;
        conversation.updated_at = Utc::now();
        *stored = conversation.clone();
        Ok(conversation)
    }

    async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let c = inner
            .conversations
            .get_mut(&id)
            .ok_or(StoreError::NotFound("conversation"))?;
        c.status = ConversationStatus::Deleted;
        c.updated_at = Utc::now();
        c.version += 1;
        Ok(())
    }
}

// ─── MessageRepo ──────────────────────────────────────────────────────────────

#[async_trait]
impl MessageRepo for MemoryStore {
    async fn append(&self, message: StoredMessage) -> Result<StoredMessage, StoreError> {
        let mut inner = self.inner.write().await;
        let conv = inner
            .conversations
            .get_mut(&message.conversation_id)
            .filter(|c| c.status != ConversationStatus::Deleted)
            .ok_or(StoreError::NotFound("conversation"))?;
        conv.message_count += 1;
        conv.updated_at = Utc::now();
        inner
            .messages_by_conversation
            .entry(message.conversation_id)
            .or_default()
            .push(message.id);
        inner.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn get(&self, id: Uuid) -> Result<StoredMessage, StoreError> {
        self.inner
            .read()
            .await
            .messages
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound("message"))
    }

    async fn list_by_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<StoredMessage> = inner
            .messages_by_conversation
            .get(&conversation_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.messages.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn update_streaming(
        &self,
        id: Uuid,
        content: &str,
        thinking: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound("message"))?;
        if msg.status.is_terminal() {
            return Err(StoreError::Conflict(
                "message is terminal; streaming writes rejected".into(),
            ));
        }
        msg.status = MessageStatus::Streaming;
        msg.content = content.to_string();
        if let Some(t) = thinking {
            msg.thinking = Some(t.to_string());
        }
        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: MessageStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound("message"))?;
        if !msg.status.can_transition_to(status) {
            return Err(StoreError::Conflict(format!(
                "illegal message status transition {:?} → {:?}",
                msg.status, status
            )));
        }
        msg.status = status;
        Ok(())
    }

    async fn finalize(
        &self,
        id: Uuid,
        status: MessageStatus,
        content: &str,
        thinking: Option<&str>,
        tool_calls: Vec<ToolCallRecord>,
        citations: Vec<Citation>,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Validation(
                "finalize requires a terminal status".into(),
            ));
        }
        let mut inner = self.inner.write().await;
        let msg = inner
            .messages
            .get_mut(&id)
            .ok_or(StoreError::NotFound("message"))?;
        if !msg.status.can_transition_to(status) {
            return Err(StoreError::Conflict(format!(
                "illegal message status transition {:?} → {:?}",
                msg.status, status
            )));
        }
        msg.status = status;
        msg.content = content.to_string();
        msg.thinking = thinking.map(|t| t.to_string());
        msg.tool_calls = tool_calls;
        msg.citations = citations;
        msg.prompt_tokens = prompt_tokens;
        msg.completion_tokens = completion_tokens;
        Ok(())
    }

    async fn upsert_tool_call(
        &self,
        message_id: Uuid,
        record: ToolCallRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let msg = inner
            .messages
            .get_mut(&message_id)
            .ok_or(StoreError::NotFound("message"))?;
        match msg.tool_calls.iter_mut().find(|tc| tc.id == record.id) {
            Some(existing) => *existing = record,
            None => msg.tool_calls.push(record),
        }
        Ok(())
    }

    async fn find_assistant_reply(
        &self,
        conversation_id: Uuid,
        user_message_id: Uuid,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let ordered = self.list_by_conversation(conversation_id).await?;
        let pos = match ordered.iter().position(|m| m.id == user_message_id) {
            Some(p) => p,
            None => return Ok(None),
        };
        Ok(ordered
            .into_iter()
            .skip(pos + 1)
            .find(|m| m.role == MessageRole::Assistant))
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn users(&self) -> &dyn UserRepo {
        self
    }
    fn sessions(&self) -> &dyn SessionRepo {
        self
    }
    fn collections(&self) -> &dyn CollectionRepo {
        self
    }
    fn documents(&self) -> &dyn DocumentRepo {
        self
    }
    fn chunks(&self) -> &dyn ChunkRepo {
        self
    }
    fn uploads(&self) -> &dyn UploadRepo {
        self
    }
    fn conversations(&self) -> &dyn ConversationRepo {
        self
    }
    fn messages(&self) -> &dyn MessageRepo {
        self
    }
    async fn ping(&self) -> Result<(), StoreError> {
        let _ = self.inner.read().await;
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
