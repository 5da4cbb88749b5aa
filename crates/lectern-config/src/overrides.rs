// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Runtime settings overrides.
//!
//! Settings are resolved in priority order: request overrides (applied by
//! callers at the use site) → runtime overrides (this module, admin-writable)
//! → config files → built-in defaults.  The resolver hands out a cached
//! snapshot so hot paths never pay for re-merging; the cache is invalidated
//! on every write and expires on its own within the propagation TTL.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::Settings;

/// Snapshot lifetime.  Matches the documented "overrides propagate within
/// 60 seconds" contract; local writes invalidate immediately.
const SNAPSHOT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum OverrideError {
    #[error("unknown setting key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Layered settings resolver: file-level settings plus a runtime key/value
/// override layer.
pub struct SettingsResolver {
    file: Settings,
    entries: RwLock<HashMap<String, Value>>,
    snapshot: RwLock<Option<(Instant, Arc<Settings>)>>,
    snapshot_ttl: Duration,
}

impl SettingsResolver {
    pub fn new(file: Settings) -> Self {
        Self {
            file,
            entries: RwLock::new(HashMap::new()),
            snapshot: RwLock::new(None),
            snapshot_ttl: SNAPSHOT_TTL,
        }
    }

    /// Effective settings with all runtime overrides applied.
    ///
    /// Returns a cached snapshot when one is younger than the TTL; otherwise
    /// re-merges and caches.  Never fails: every override was validated when
    /// it was set.
    pub fn effective(&self) -> Arc<Settings> {
        if let Some((at, snap)) = self.snapshot.read().unwrap().as_ref() {
            if at.elapsed() < self.snapshot_ttl {
                return Arc::clone(snap);
            }
        }

        let mut merged = self.file.clone();
        for (key, value) in self.entries.read().unwrap().iter() {
            // Validated on set; a failure here would mean the schema changed
            // underneath a stored override, in which case skipping is correct.
            let _ = apply(&mut merged, key, value);
        }
        let snap = Arc::new(merged);
        *self.snapshot.write().unwrap() = Some((Instant::now(), Arc::clone(&snap)));
        snap
    }

    /// Set a runtime override.  The key must be one of the recognized
    /// dotted setting names and the value must coerce to the field type.
    pub fn set(&self, key: &str, value: Value) -> Result<(), OverrideError> {
        // Validate against a scratch copy before committing.
        let mut scratch = self.file.clone();
        apply(&mut scratch, key, &value)?;

        info!(key, %value, "runtime setting override applied");
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), value);
        *self.snapshot.write().unwrap() = None;
        Ok(())
    }

    /// Remove a runtime override.  Returns `true` when one was present.
    pub fn unset(&self, key: &str) -> bool {
        let removed = self.entries.write().unwrap().remove(key).is_some();
        if removed {
            info!(key, "runtime setting override removed");
            *self.snapshot.write().unwrap() = None;
        }
        removed
    }

    /// Current override entries, sorted by key.
    pub fn overrides(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<(String, Value)> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

/// Apply one dotted-key override onto a settings value.
fn apply(s: &mut Settings, key: &str, value: &Value) -> Result<(), OverrideError> {
    match key {
        "model.default_name" => s.model.default_name = as_str(key, value)?,
        "model.context_window" => s.model.context_window = Some(as_u64(key, value)? as u32),
        "retrieval.default_k" => s.retrieval.default_k = as_u64(key, value)? as usize,
        "retrieval.similarity_threshold" => {
            s.retrieval.similarity_threshold = as_f32(key, value)?
        }
        "retrieval.reserved_completion_tokens" => {
            s.retrieval.reserved_completion_tokens = as_u64(key, value)? as usize
        }
        "chunking.target_chars" => s.chunking.target_chars = as_u64(key, value)? as usize,
        "chunking.overlap_chars" => s.chunking.overlap_chars = as_u64(key, value)? as usize,
        "ingest.max_retries" => s.ingest.max_retries = as_u64(key, value)? as u32,
        "ingest.backoff_base_ms" => s.ingest.backoff_base_ms = as_u64(key, value)?,
        "auth.access_token_ttl" => s.auth.access_token_ttl_secs = as_u64(key, value)?,
        "auth.refresh_token_ttl" => s.auth.refresh_token_ttl_secs = as_u64(key, value)?,
        "rate_limits.standard" => s.rate_limits.standard = as_u64(key, value)? as u32,
        "rate_limits.chat" => s.rate_limits.chat = as_u64(key, value)? as u32,
        "rate_limits.upload" => s.rate_limits.upload = as_u64(key, value)? as u32,
        "rate_limits.admin" => s.rate_limits.admin = as_u64(key, value)? as u32,
        "chat.max_tool_iterations" => s.chat.max_tool_iterations = as_u64(key, value)? as u32,
        "chat.persist_thinking" => s.chat.persist_thinking = as_bool(key, value)?,
        other => return Err(OverrideError::UnknownKey(other.to_string())),
    }
    Ok(())
}

fn as_u64(key: &str, v: &Value) -> Result<u64, OverrideError> {
    v.as_u64().ok_or_else(|| OverrideError::InvalidValue {
        key: key.to_string(),
        reason: "expected a non-negative integer".into(),
    })
}

fn as_f32(key: &str, v: &Value) -> Result<f32, OverrideError> {
    v.as_f64()
        .map(|f| f as f32)
        .ok_or_else(|| OverrideError::InvalidValue {
            key: key.to_string(),
            reason: "expected a number".into(),
        })
}

fn as_bool(key: &str, v: &Value) -> Result<bool, OverrideError> {
    v.as_bool().ok_or_else(|| OverrideError::InvalidValue {
        key: key.to_string(),
        reason: "expected a boolean".into(),
    })
}

fn as_str(key: &str, v: &Value) -> Result<String, OverrideError> {
    v.as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| OverrideError::InvalidValue {
            key: key.to_string(),
            reason: "expected a string".into(),
        })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn effective_without_overrides_equals_file_settings() {
        let r = SettingsResolver::new(Settings::default());
        assert_eq!(r.effective().retrieval.default_k, 5);
    }

    #[test]
    fn set_override_is_visible_immediately() {
        let r = SettingsResolver::new(Settings::default());
        r.set("retrieval.default_k", json!(12)).unwrap();
        assert_eq!(r.effective().retrieval.default_k, 12);
    }

    #[test]
    fn unset_restores_file_value() {
        let r = SettingsResolver::new(Settings::default());
        r.set("chunking.target_chars", json!(500)).unwrap();
        assert_eq!(r.effective().chunking.target_chars, 500);
        assert!(r.unset("chunking.target_chars"));
        assert_eq!(r.effective().chunking.target_chars, 1000);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let r = SettingsResolver::new(Settings::default());
        let err = r.set("no.such.key", json!(1)).unwrap_err();
        assert!(matches!(err, OverrideError::UnknownKey(_)));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let r = SettingsResolver::new(Settings::default());
        let err = r.set("retrieval.default_k", json!("five")).unwrap_err();
        assert!(matches!(err, OverrideError::InvalidValue { .. }));
    }

    #[test]
    fn float_override_for_threshold() {
        let r = SettingsResolver::new(Settings::default());
        r.set("retrieval.similarity_threshold", json!(0.35)).unwrap();
        let got = r.effective().retrieval.similarity_threshold;
        assert!((got - 0.35).abs() < 1e-6);
    }

    #[test]
    fn overrides_listing_is_sorted() {
        let r = SettingsResolver::new(Settings::default());
        r.set("rate_limits.chat", json!(30)).unwrap();
        r.set("chunking.target_chars", json!(800)).unwrap();
        let keys: Vec<String> = r.overrides().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["chunking.target_chars", "rate_limits.chat"]);
    }

    #[test]
    fn bool_override_round_trips() {
        let r = SettingsResolver::new(Settings::default());
        r.set("chat.persist_thinking", json!(false)).unwrap();
        assert!(!r.effective().chat.persist_thinking);
    }
}
