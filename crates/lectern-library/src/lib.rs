// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Collection, document, and upload service.
//!
//! Collections form a strict tree with materialized paths; deleting is soft
//! by default and hard on request, cascading through descendants, documents,
//! chunks, and vectors in that order.  Uploads follow the two-phase
//! contract: bytes are staged against an `Upload` record first, and a later
//! bind creates the `pending` document and enqueues ingestion.

pub mod service;
pub mod staging;

use thiserror::Error;
use uuid::Uuid;

pub use service::{BindUpload, CreateCollection, LibraryService, UpdateCollection};
pub use staging::StagingArea;

use lectern_index::IndexError;
use lectern_store::StoreError;

/// The caller a service operation runs as.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub user_id: Uuid,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("not allowed to access this resource")]
    Forbidden,

    #[error("conflict: {0}")]
    Conflict(String),

    /// The resource existed but is permanently unavailable (expired upload).
    #[error("gone: {0}")]
    Gone(String),

    #[error("payload of {got} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { got: u64, limit: u64 },

    #[error("validation: {0}")]
    Validation(String),

    /// The ingestion queue is full; retry later.
    #[error("ingestion queue is full")]
    Busy,

    #[error("storage i/o: {0}")]
    Io(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),
}
