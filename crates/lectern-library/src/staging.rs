// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use tracing::debug;
use uuid::Uuid;

use crate::LibraryError;

/// Server-controlled byte staging for two-phase uploads.
///
/// Handles returned by [`StagingArea::save`] are opaque to clients; only the
/// ingestion worker and the expiry sweeper dereference them.
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LibraryError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| LibraryError::Io(format!("cannot create staging dir: {e}")))?;
        Ok(Self { dir })
    }

    pub async fn save(&self, upload_id: Uuid, bytes: &[u8]) -> Result<String, LibraryError> {
        let path = self.dir.join(format!("{upload_id}.upload"));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| LibraryError::Io(format!("cannot stage upload bytes: {e}")))?;
        debug!(upload = %upload_id, bytes = bytes.len(), "upload staged");
        Ok(path.to_string_lossy().into_owned())
    }

    /// Reclaim staged bytes.  Missing files are fine (already reclaimed).
    pub async fn remove(&self, handle: &str) -> Result<(), LibraryError> {
        match tokio::fs::remove_file(handle).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LibraryError::Io(format!("cannot reclaim upload bytes: {e}"))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        let handle = staging.save(id, b"payload").await.unwrap();
        assert_eq!(tokio::fs::read(&handle).await.unwrap(), b"payload");
        staging.remove(&handle).await.unwrap();
        assert!(tokio::fs::read(&handle).await.is_err());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::new(dir.path()).unwrap();
        let handle = staging.save(Uuid::new_v4(), b"x").await.unwrap();
        staging.remove(&handle).await.unwrap();
        staging.remove(&handle).await.unwrap();
    }
}
