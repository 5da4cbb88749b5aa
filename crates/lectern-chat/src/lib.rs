// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chat orchestration.
//!
//! The orchestrator turns `(conversation, user message, options)` into a
//! streaming assistant reply: transcript assembly with a history cap,
//! optional retrieval context, a bounded provider ↔ tool loop, partial
//! persistence, and cooperative cancellation.  At most one run is active
//! per conversation at a time.

pub mod events;
pub mod locks;
pub mod orchestrator;
pub mod transcript;

use thiserror::Error;

pub use events::ChatEvent;
pub use locks::ConversationLocks;
pub use orchestrator::{ChatOptions, ChatOrchestrator};

use lectern_model::ModelError;
use lectern_retrieval::RetrievalError;
use lectern_store::StoreError;

/// Stable error code for a tool loop that exceeded its round budget.
pub const CODE_TOOL_LOOP_LIMIT: &str = "TOOL_LOOP_LIMIT";
/// Stable error code for a run cancelled before any content was produced.
pub const CODE_CANCELLED: &str = "CANCELLED";
/// Stable error code for a provider that stayed unavailable after a retry.
pub const CODE_PROVIDER_UNAVAILABLE: &str = "PROVIDER_UNAVAILABLE";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("validation: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
}
