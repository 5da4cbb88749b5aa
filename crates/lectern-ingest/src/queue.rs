// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::IngestError;

/// One unit of ingestion work.  Delivery is at-least-once: the worker must
/// tolerate seeing the same document id more than once.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub document_id: Uuid,
    /// Server-controlled handle to the staged upload bytes.
    pub upload_handle: String,
    pub collection_id: Uuid,
    pub requested_at: DateTime<Utc>,
}

/// Bounded producer handle.  When the queue is full the caller gets
/// [`IngestError::Busy`] and surfaces HTTP 503 with Retry-After.
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<IngestJob>,
}

impl IngestQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<IngestJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, job: IngestJob) -> Result<(), IngestError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IngestError::Busy,
            mpsc::error::TrySendError::Closed(_) => IngestError::Busy,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> IngestJob {
        IngestJob {
            document_id: Uuid::new_v4(),
            upload_handle: "h".into(),
            collection_id: Uuid::new_v4(),
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn enqueue_delivers_to_receiver() {
        let (q, mut rx) = IngestQueue::bounded(4);
        let j = job();
        q.enqueue(j.clone()).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.document_id, j.document_id);
    }

    #[tokio::test]
    async fn full_queue_is_busy() {
        let (q, _rx) = IngestQueue::bounded(1);
        q.enqueue(job()).unwrap();
        let err = q.enqueue(job()).unwrap_err();
        assert!(matches!(err, IngestError::Busy));
    }

    #[tokio::test]
    async fn closed_queue_is_busy() {
        let (q, rx) = IngestQueue::bounded(1);
        drop(rx);
        assert!(matches!(q.enqueue(job()).unwrap_err(), IngestError::Busy));
    }
}
