// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

use crate::{CompletionRequest, StreamEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ModelError>> + Send>>;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Transient: provider unreachable or overloaded.  The orchestrator
    /// retries this once before giving up.
    #[error("completion provider unavailable: {0}")]
    Unavailable(String),
    /// Permanent: the request itself was rejected.
    #[error("invalid completion request: {0}")]
    Invalid(String),
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::Unavailable(_))
    }
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Start streaming a completion for the transcript.
    ///
    /// Cancellation is cooperative: dropping the returned stream aborts the
    /// underlying request without emitting further events.
    async fn stream(&self, req: CompletionRequest) -> Result<EventStream, ModelError>;

    /// Cheap reachability probe for readiness checks.  Defaults to `Ok` for
    /// providers without a health endpoint.
    async fn ping(&self) -> Result<(), ModelError> {
        Ok(())
    }
}
