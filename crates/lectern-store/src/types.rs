use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Users and sessions ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// Stored lowercase; uniqueness is case-insensitive.
    pub email: String,
    pub display_name: String,
    pub roles: Vec<Role>,
    pub active: bool,
    /// Hex SHA-256 of `salt || password`.  Never the password itself.
    #[serde(skip_serializing)]
    pub password_digest: String,
    #[serde(skip_serializing)]
    pub password_salt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl User {
    pub fn new(email: impl Into<String>, display_name: impl Into<String>, roles: Vec<Role>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: email.into().to_lowercase(),
            display_name: display_name.into(),
            roles,
            active: true,
            password_digest: String::new(),
            password_salt: String::new(),
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.contains(&Role::Admin)
    }
}

/// One issued token pair.  Token material is stored as hex SHA-256 digests;
/// the raw tokens exist only in the response that issued them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub access_digest: String,
    pub refresh_digest: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

// ─── Collections ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Collection,
    Folder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub kind: CollectionKind,
    pub parent_id: Option<Uuid>,
    /// Materialized path: ancestor names joined by `/`, ending in this
    /// node's name.  Maintained by the store on every rename/move.
    pub path: String,
    /// Cached document count including all descendants.
    pub document_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Collection {
    pub fn new(
        owner_id: Uuid,
        name: impl Into<String>,
        kind: CollectionKind,
        parent_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        let name = name.into();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            path: name.clone(),
            name,
            description: None,
            icon: None,
            color: None,
            kind,
            parent_id,
            document_count: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 1,
        }
    }
}

// ─── Documents, uploads, chunks ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Fetching,
    Parsing,
    Splitting,
    Embedding,
    Storing,
    Finalizing,
}

/// Point-in-time processing progress, persisted on the document so status
/// polling survives worker restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub stage: IngestStage,
    pub percentage: u8,
    pub message: String,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            stage: IngestStage::Fetching,
            percentage: 0,
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub collection_id: Uuid,
    /// The upload this document was created from; kept so a failed
    /// ingestion can be retried from the staged bytes.
    pub upload_id: Option<Uuid>,
    pub title: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub status: DocumentStatus,
    pub progress: Progress,
    pub chunk_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Document {
    pub fn new(
        collection_id: Uuid,
        title: impl Into<String>,
        file_name: impl Into<String>,
        size_bytes: u64,
        mime_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            collection_id,
            upload_id: None,
            title: title.into(),
            file_name: file_name.into(),
            size_bytes,
            mime_type: mime_type.into(),
            status: DocumentStatus::Pending,
            progress: Progress::default(),
            chunk_count: 0,
            created_at: now,
            updated_at: now,
            processed_at: None,
            deleted_at: None,
            version: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Uploaded,
    Bound,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Upload {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub file_name: String,
    pub declared_size: u64,
    pub mime_type: String,
    /// Server-controlled handle to the staged bytes (opaque to clients).
    pub storage_handle: String,
    pub state: UploadState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Dense within a document: ordinals form the range `[0, chunk_count)`.
    pub ordinal: u32,
    pub text: String,
    pub token_estimate: u32,
    pub page: Option<u32>,
    pub section: Option<String>,
}

impl Chunk {
    /// Approximate token count used for context budgeting (4 chars/token).
    pub fn approx_tokens(text: &str) -> u32 {
        ((text.len() / 4).max(1)) as u32
    }
}

// ─── Conversations and messages ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Archived,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub status: ConversationStatus,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Conversation {
    pub fn new(owner_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            title: title.into(),
            status: ConversationStatus::Active,
            model: None,
            system_prompt: None,
            message_count: 0,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Complete,
    Error,
}

impl MessageStatus {
    /// Status transitions form a prefix of `pending → streaming →
    /// {complete | error}`; a message never regresses.  Same-state writes
    /// are allowed so status updates stay idempotent.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, Streaming) | (Pending, Complete) | (Pending, Error) => true,
            (Streaming, Complete) | (Streaming, Error) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageStatus::Complete | MessageStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallState {
    Pending,
    Running,
    Complete,
    Failed,
}

/// One tool invocation made while producing an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Provider-assigned call id, forwarded verbatim.
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub state: ToolCallState,
    pub duration_ms: Option<u64>,
}

/// Structured reference from an assistant message back to a retrieved chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: Uuid,
    pub chunk_id: Uuid,
    pub score: f32,
    pub page: Option<u32>,
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    /// May be empty while the message is still streaming.
    pub content: String,
    pub thinking: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub citations: Vec<Citation>,
    pub status: MessageStatus,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    fn base(conversation_id: Uuid, role: MessageRole, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role,
            content,
            thinking: None,
            tool_calls: Vec::new(),
            citations: Vec::new(),
            status: MessageStatus::Complete,
            prompt_tokens: 0,
            completion_tokens: 0,
            created_at: Utc::now(),
        }
    }

    pub fn user(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self::base(conversation_id, MessageRole::User, content.into())
    }

    /// A new assistant message in `pending` state; the orchestrator moves it
    /// through `streaming` to a terminal state.
    pub fn assistant_pending(conversation_id: Uuid) -> Self {
        let mut m = Self::base(conversation_id, MessageRole::Assistant, String::new());
        m.status = MessageStatus::Pending;
        m
    }

    pub fn tool(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self::base(conversation_id, MessageRole::Tool, content.into())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
