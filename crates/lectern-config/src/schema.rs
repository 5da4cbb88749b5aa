// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub embedder: EmbedderSettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub rate_limits: RateLimitSettings,
    #[serde(default)]
    pub uploads: UploadSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address for the HTTP gateway.
    pub bind: String,
    /// Seconds a dependency may be unreachable before readiness fails.
    pub readiness_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8098".into(),
            readiness_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Model name forwarded to the completion provider.
    pub default_name: String,
    /// Context window in tokens.  When `None` the static catalog is
    /// consulted; unknown models fall back to 8192.
    pub context_window: Option<u32>,
    /// Base URL of the OpenAI-compatible completion endpoint.
    pub base_url: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            default_name: "gpt-4o-mini".into(),
            context_window: None,
            base_url: "http://localhost:11434/v1".into(),
            api_key_env: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderSettings {
    /// Base URL of the OpenAI-compatible embeddings endpoint.
    pub base_url: String,
    pub model: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Expected vector dimensionality.
    pub dimension: usize,
    /// Texts per embed request.
    pub batch_size: usize,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".into(),
            model: "nomic-embed-text".into(),
            api_key_env: None,
            dimension: 768,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub default_k: usize,
    pub max_k: usize,
    pub similarity_threshold: f32,
    /// Tokens held back from the context window for the completion itself.
    pub reserved_completion_tokens: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            default_k: 5,
            max_k: 50,
            similarity_threshold: 0.0,
            reserved_completion_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub target_chars: usize,
    pub overlap_chars: usize,
    /// Chunks shorter than this are merged into the previous chunk.
    pub min_chars: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            target_chars: 1000,
            overlap_chars: 200,
            min_chars: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Worker tasks per node.  Bounded by the CPU count at startup.
    pub parallelism: usize,
    /// Queue capacity; enqueue returns Busy when full.
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            parallelism: 2,
            queue_capacity: 1024,
            max_retries: 5,
            backoff_base_ms: 1000,
            backoff_cap_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Upper bound on provider→tool→provider round trips per user message.
    pub max_tool_iterations: u32,
    /// Per-tool-call deadline in seconds.
    pub tool_deadline_secs: u64,
    /// Whether streamed thinking content is kept on the message record.
    pub persist_thinking: bool,
    /// Milliseconds between partial-content flushes to the store.
    pub flush_interval_ms: u64,
    /// Characters accumulated before an early flush.
    pub flush_chars: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_tool_iterations: 5,
            tool_deadline_secs: 30,
            persist_thinking: true,
            flush_interval_ms: 500,
            flush_chars: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Access-token lifetime in seconds.
    pub access_token_ttl_secs: u64,
    /// Refresh-token lifetime in seconds.
    pub refresh_token_ttl_secs: u64,
    /// Consecutive failures before an account is locked.
    pub lockout_threshold: u32,
    /// Lock duration in seconds.
    pub lockout_secs: u64,
    /// Seed admin account created at startup when no users exist.
    pub bootstrap_email: String,
    pub bootstrap_password: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            access_token_ttl_secs: 3600,
            refresh_token_ttl_secs: 30 * 24 * 3600,
            lockout_threshold: 5,
            lockout_secs: 15 * 60,
            bootstrap_email: "admin@localhost".into(),
            bootstrap_password: None,
        }
    }
}

/// Requests per minute for each route class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub standard: u32,
    pub chat: u32,
    pub upload: u32,
    pub admin: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            standard: 100,
            chat: 20,
            upload: 10,
            admin: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Directory where uploaded bytes are staged until bound.
    pub staging_dir: String,
    /// Maximum accepted upload size in bytes.
    pub max_bytes: u64,
    /// Unbound uploads expire after this many seconds.
    pub ttl_secs: u64,
    /// Period of the expiry sweep task in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            staging_dir: "/var/lib/lectern/staging".into(),
            max_bytes: 50 * 1024 * 1024,
            ttl_secs: 24 * 3600,
            sweep_interval_secs: 15 * 60,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.retrieval.default_k, 5);
        assert_eq!(s.retrieval.max_k, 50);
        assert_eq!(s.retrieval.reserved_completion_tokens, 1024);
        assert_eq!(s.chunking.target_chars, 1000);
        assert_eq!(s.chunking.overlap_chars, 200);
        assert_eq!(s.ingest.max_retries, 5);
        assert_eq!(s.ingest.backoff_base_ms, 1000);
        assert_eq!(s.auth.access_token_ttl_secs, 3600);
        assert_eq!(s.auth.refresh_token_ttl_secs, 30 * 24 * 3600);
        assert_eq!(s.rate_limits.standard, 100);
        assert_eq!(s.rate_limits.chat, 20);
        assert_eq!(s.rate_limits.upload, 10);
        assert_eq!(s.rate_limits.admin, 50);
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_sections() {
        let s: Settings = serde_yaml::from_str("retrieval:\n  default_k: 9\n").unwrap();
        assert_eq!(s.retrieval.default_k, 9);
        assert_eq!(s.chunking.target_chars, 1000);
    }

    #[test]
    fn settings_round_trip_through_yaml() {
        let s = Settings::default();
        let text = serde_yaml::to_string(&s).unwrap();
        let back: Settings = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.rate_limits.chat, s.rate_limits.chat);
        assert_eq!(back.model.default_name, s.model.default_name);
    }
}
