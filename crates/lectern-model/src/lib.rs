// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Completion provider port.
//!
//! A provider turns a chat transcript into an asynchronous sequence of
//! [`StreamEvent`]s.  For any tool-call id the stream guarantees that
//! `ToolCallStart` precedes every `ToolCallDelta` and that `ToolCallEnd`
//! follows all of them; content and tool-call events may interleave freely.
//! Dropping the stream cancels the request promptly.

pub mod catalog;
pub mod mock;
pub mod openai_compat;
pub mod provider;
pub mod types;

pub use mock::ScriptedProvider;
pub use openai_compat::OpenAICompatProvider;
pub use provider::{CompletionProvider, EventStream, ModelError};
pub use types::*;
