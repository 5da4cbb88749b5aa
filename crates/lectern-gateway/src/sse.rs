// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! SSE bridging.
//!
//! Orchestrator events are forwarded unchanged: the event's name becomes the
//! SSE event name, its JSON payload the data line.  A heartbeat comment goes
//! out at least every 15 seconds.
//!
//! # Disconnect propagation
//!
//! The response stream owns a cancellation drop-guard: when the client goes
//! away axum drops the stream, the guard fires, and the orchestrator aborts
//! its in-flight provider and tool calls.
//!
//! # Slow consumers
//!
//! A drain task decouples the orchestrator from the client.  Frames the
//! client has not consumed accumulate against a byte high-water mark; past
//! it the stream terminates with `error(SLOW_CONSUMER)` instead of exerting
//! unbounded backpressure upstream.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::DropGuard;
use tracing::warn;

use lectern_chat::ChatEvent;

pub const HEARTBEAT: Duration = Duration::from_secs(15);
/// Default send-buffer high-water mark (1 MB).
pub const HIGH_WATER_BYTES: usize = 1024 * 1024;

#[derive(Default)]
struct FrameQueue {
    frames: VecDeque<(Event, usize)>,
    buffered: usize,
    /// No more frames will be pushed; drain and end the stream.
    finished: bool,
}

/// Turn an orchestrator event channel into an SSE response.
///
/// `guard` must be the drop-guard of the cancellation token handed to the
/// orchestrator run.
pub fn chat_sse(
    rx: mpsc::Receiver<ChatEvent>,
    guard: DropGuard,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = frame_stream(rx, HIGH_WATER_BYTES, guard);
    Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT))
}

fn frame_stream(
    mut rx: mpsc::Receiver<ChatEvent>,
    high_water: usize,
    guard: DropGuard,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let queue = Arc::new((Mutex::new(FrameQueue::default()), Notify::new()));

    // Drain task: keeps consuming orchestrator events even when the client
    // reads slowly, so byte accounting reflects the real backlog.
    let producer = Arc::clone(&queue);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(p) => p,
                Err(e) => {
                    warn!("unserializable chat event: {e}");
                    continue;
                }
            };
            let size = payload.len();
            let terminal = event.is_terminal();
            let frame = Event::default().event(event.name()).data(payload);

            let (lock, notify) = &*producer;
            let mut q = lock.lock().unwrap();
            if q.finished {
                break;
            }
            if q.buffered + size > high_water {
                warn!(
                    buffered = q.buffered,
                    high_water, "dropping slow SSE consumer"
                );
                let err = Event::default()
                    .event("error")
                    .data(r#"{"code":"SLOW_CONSUMER","message":"client cannot keep up with the event stream"}"#);
                q.frames.push_back((err, 0));
                q.finished = true;
                notify.notify_one();
                break;
            }
            q.buffered += size;
            q.frames.push_back((frame, size));
            if terminal {
                q.finished = true;
            }
            notify.notify_one();
            if q.finished {
                break;
            }
        }
        let (lock, notify) = &*producer;
        lock.lock().unwrap().finished = true;
        notify.notify_one();
    });

    let consumer = Arc::clone(&queue);
    async_stream::stream! {
        // Dropping this (client disconnect or normal end) cancels the
        // orchestrator run.
        let _guard = guard;
        loop {
            let popped = {
                let (lock, _) = &*consumer;
                let mut q = lock.lock().unwrap();
                match q.frames.pop_front() {
                    Some((frame, size)) => {
                        q.buffered -= size;
                        Some(frame)
                    }
                    None if q.finished => break,
                    None => None,
                }
            };
            match popped {
                Some(frame) => yield Ok(frame),
                None => {
                    let (_, notify) = &*consumer;
                    notify.notified().await;
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
