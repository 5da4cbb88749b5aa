// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Static model catalog: context windows for the models this platform is
//! commonly deployed against.  Used as the budget source of truth when the
//! operator has not pinned `model.context_window` in config.

/// Fallback when the model is unknown to the catalog.
pub const DEFAULT_CONTEXT_WINDOW: u32 = 8192;

/// Context window in tokens for a known model name, prefix-matched so dated
/// releases (`gpt-4o-2024-08-06`) resolve like their base name.
pub fn context_window_for(model: &str) -> Option<u32> {
    const TABLE: &[(&str, u32)] = &[
        ("gpt-4o-mini", 128_000),
        ("gpt-4o", 128_000),
        ("gpt-4.1", 1_000_000),
        ("o3", 200_000),
        ("claude-3-5-haiku", 200_000),
        ("claude-sonnet", 200_000),
        ("claude-opus", 200_000),
        ("llama3.2", 128_000),
        ("llama3.1", 128_000),
        ("mistral-small", 32_000),
        ("qwen2.5", 32_768),
        ("gemma2", 8192),
    ];
    TABLE
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, window)| *window)
}

/// Resolve the effective context window: explicit configuration wins, then
/// the catalog, then [`DEFAULT_CONTEXT_WINDOW`].
pub fn effective_context_window(configured: Option<u32>, model: &str) -> u32 {
    configured
        .or_else(|| context_window_for(model))
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_resolves() {
        assert_eq!(context_window_for("gpt-4o-mini"), Some(128_000));
    }

    #[test]
    fn dated_release_prefix_matches() {
        assert_eq!(context_window_for("gpt-4o-2024-08-06"), Some(128_000));
    }

    #[test]
    fn unknown_model_is_none() {
        assert_eq!(context_window_for("weird-model-7b"), None);
    }

    #[test]
    fn configured_value_wins() {
        assert_eq!(effective_context_window(Some(4096), "gpt-4o"), 4096);
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        assert_eq!(
            effective_context_window(None, "weird-model-7b"),
            DEFAULT_CONTEXT_WINDOW
        );
    }
}
