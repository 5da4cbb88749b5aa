// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Optimistic-concurrency failure: the caller's `expected_version` no
    /// longer matches the stored row.
    pub fn stale(expected: u64, actual: u64) -> Self {
        StoreError::Conflict(format!(
            "stale version: expected {expected}, found {actual}"
        ))
    }
}
