// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::*;

/// Pagination and visibility options shared by list operations.
///
/// Defaults: first page of 50, soft-deleted rows excluded.
#[derive(Debug, Clone)]
pub struct ListParams {
    pub limit: usize,
    pub offset: usize,
    pub include_deleted: bool,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            include_deleted: false,
        }
    }
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Fails with `Validation` when the email is already taken
    /// (case-insensitive).
    async fn create(&self, user: User) -> Result<User, StoreError>;
    async fn get(&self, id: Uuid) -> Result<User, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn update(&self, user: User, expected_version: u64) -> Result<User, StoreError>;
    async fn count(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn create(&self, session: Session) -> Result<Session, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Session, StoreError>;
    async fn find_by_access_digest(&self, digest: &str) -> Result<Option<Session>, StoreError>;
    async fn find_by_refresh_digest(&self, digest: &str) -> Result<Option<Session>, StoreError>;
    /// Idempotent: revoking an already-revoked session succeeds.
    async fn revoke(&self, id: Uuid) -> Result<(), StoreError>;
    /// Returns the number of sessions revoked.
    async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait CollectionRepo: Send + Sync {
    /// Computes the materialized path from the parent chain.  Fails with
    /// `Validation` when the parent does not exist or is soft-deleted.
    async fn create(&self, collection: Collection) -> Result<Collection, StoreError>;
    /// Default read: soft-deleted rows surface as `NotFound`.
    async fn get(&self, id: Uuid) -> Result<Collection, StoreError>;
    /// Read that also returns soft-deleted rows (hard-delete cascades).
    async fn get_any(&self, id: Uuid) -> Result<Collection, StoreError>;
    /// Children of `parent_id` (roots when `None`), name order.
    async fn list(
        &self,
        owner_id: Uuid,
        parent_id: Option<Uuid>,
        params: &ListParams,
    ) -> Result<Vec<Collection>, StoreError>;
    /// Full update.  A changed name or parent recomputes the subtree's
    /// materialized paths in the same transaction; a move that would make
    /// the collection its own ancestor fails with `Validation`.
    async fn update(
        &self,
        collection: Collection,
        expected_version: u64,
    ) -> Result<Collection, StoreError>;
    /// All transitive descendants, path order.  Includes soft-deleted rows.
    async fn descendants(&self, id: Uuid) -> Result<Vec<Collection>, StoreError>;
    async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError>;
    async fn hard_delete(&self, id: Uuid) -> Result<(), StoreError>;
    /// Adjust the cached document count on this collection and every
    /// ancestor, in one transaction.
    async fn adjust_document_count(&self, id: Uuid, delta: i64) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DocumentRepo: Send + Sync {
    async fn create(&self, document: Document) -> Result<Document, StoreError>;
    /// Default read: soft-deleted rows surface as `NotFound`.
    async fn get(&self, id: Uuid) -> Result<Document, StoreError>;
    async fn get_any(&self, id: Uuid) -> Result<Document, StoreError>;
    /// Documents of one collection, newest first.
    async fn list_by_collection(
        &self,
        collection_id: Uuid,
        params: &ListParams,
    ) -> Result<Vec<Document>, StoreError>;
    async fn update(
        &self,
        document: Document,
        expected_version: u64,
    ) -> Result<Document, StoreError>;
    /// Worker-side status write.  The ingestion worker is the only writer
    /// while a document is processing, so no version token is taken.
    async fn set_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        progress: Progress,
        chunk_count: Option<u32>,
    ) -> Result<Document, StoreError>;
    async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError>;
    async fn hard_delete(&self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ChunkRepo: Send + Sync {
    /// Append a batch of chunks for a document in one transaction.
    ///
    /// Ordinals must continue the document's dense range: the first chunk of
    /// the batch carries ordinal `count`, the next `count + 1`, and so on.
    /// Anything else fails with `Validation` and writes nothing.
    async fn append_batch(&self, document_id: Uuid, chunks: Vec<Chunk>) -> Result<(), StoreError>;
    /// Batch fetch; unknown ids are skipped.
    async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Chunk>, StoreError>;
    /// All chunks of a document, ordinal order.
    async fn list_by_document(&self, document_id: Uuid) -> Result<Vec<Chunk>, StoreError>;
    /// Idempotent; returns the number of chunks removed.
    async fn delete_by_document(&self, document_id: Uuid) -> Result<usize, StoreError>;
    async fn count_by_document(&self, document_id: Uuid) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait UploadRepo: Send + Sync {
    async fn create(&self, upload: Upload) -> Result<Upload, StoreError>;
    async fn get(&self, id: Uuid) -> Result<Upload, StoreError>;
    /// Transition `uploaded → bound`.  Exactly-once: a second bind fails
    /// with `Conflict`, binding an expired upload fails with `Conflict`.
    async fn bind(&self, id: Uuid) -> Result<Upload, StoreError>;
    /// Compensation for a bind whose document creation could not complete
    /// (e.g. the ingestion queue was full): `bound → uploaded`.
    async fn release(&self, id: Uuid) -> Result<Upload, StoreError>;
    /// Transition every `uploaded` record past its expiry to `expired` and
    /// return them so the caller can reclaim staged bytes.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Upload>, StoreError>;
}

#[async_trait]
pub trait ConversationRepo: Send + Sync {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, StoreError>;
    /// Deleted conversations surface as `NotFound` on every read path.
    async fn get(&self, id: Uuid) -> Result<Conversation, StoreError>;
    /// Most recently updated first.  `search` is a case-insensitive
    /// substring match on the title.
    async fn list(
        &self,
        owner_id: Uuid,
        search: Option<&str>,
        params: &ListParams,
    ) -> Result<Vec<Conversation>, StoreError>;
    async fn update(
        &self,
        conversation: Conversation,
        expected_version: u64,
    ) -> Result<Conversation, StoreError>;
    async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MessageRepo: Send + Sync {
    /// Append-only: messages are never removed or reordered.  Bumps the
    /// conversation's message count in the same transaction.
    async fn append(&self, message: StoredMessage) -> Result<StoredMessage, StoreError>;
    async fn get(&self, id: Uuid) -> Result<StoredMessage, StoreError>;
    /// Stable `(created_at, id)` order.
    async fn list_by_conversation(
        &self,
        conversation_id: Uuid,
    ) -> Result<Vec<StoredMessage>, StoreError>;
    /// Replace streamed partial content; moves `pending → streaming`.
    /// Fails with `Conflict` once the message is terminal.
    async fn update_streaming(
        &self,
        id: Uuid,
        content: &str,
        thinking: Option<&str>,
    ) -> Result<(), StoreError>;
    /// Forward-only status write; regressions fail with `Conflict`.
    async fn set_status(&self, id: Uuid, status: MessageStatus) -> Result<(), StoreError>;
    /// Terminal write: content, thinking, tool calls, citations, and usage
    /// in one transaction.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<(), StoreError>;
    /// Insert or replace one tool-call record on a message, matched by the
    /// provider-assigned call id.
    async fn upsert_tool_call(
        &self,
        message_id: Uuid,
        record: ToolCallRecord,
    ) -> Result<(), StoreError>;
    /// The assistant message that directly follows `user_message_id` in the
    /// conversation's order, when one exists.  Used for resubmit idempotency.
    async fn find_assistant_reply(
        &self,
        conversation_id: Uuid,
        user_message_id: Uuid,
    ) -> Result<Option<StoredMessage>, StoreError>;
}

/// The full transactional store: one typed repository per entity.
#[async_trait]
pub trait Store: Send + Sync {
    fn users(&self) -> &dyn UserRepo;
    fn sessions(&self) -> &dyn SessionRepo;
    fn collections(&self) -> &dyn CollectionRepo;
    fn documents(&self) -> &dyn DocumentRepo;
    fn chunks(&self) -> &dyn ChunkRepo;
    fn uploads(&self) -> &dyn UploadRepo;
    fn conversations(&self) -> &dyn ConversationRepo;
    fn messages(&self) -> &dyn MessageRepo;
    /// Cheap reachability probe for readiness checks.
    async fn ping(&self) -> Result<(), StoreError>;
}
