// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Text extraction.
//!
//! The worker handles text-based media natively; binary formats (PDF, Office)
//! are extracted by a converter sidecar before upload in deployments that
//! need them, so an unreadable or unsupported payload is a terminal parse
//! failure here, never a retry.

use crate::IngestError;

/// Media types accepted for extraction.
const TEXT_TYPES: &[&str] = &[
    "text/plain",
    "text/markdown",
    "text/x-markdown",
    "text/csv",
    "application/json",
];

/// Extract UTF-8 text from the uploaded bytes.
pub fn extract_text(bytes: &[u8], mime_type: &str) -> Result<String, IngestError> {
    let essence = mime_type.split(';').next().unwrap_or(mime_type).trim();
    if !TEXT_TYPES.contains(&essence) {
        return Err(IngestError::Parse(format!(
            "unsupported media type: {essence}"
        )));
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|_| IngestError::Parse("file is not valid UTF-8".into()))?;
    let normalized = text.replace("\r\n", "\n");
    if normalized.trim().is_empty() {
        return Err(IngestError::Parse("file contains no extractable text".into()));
    }
    Ok(normalized)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
