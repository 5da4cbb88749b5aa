// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tool registry.
//!
//! Tools are callable functions the model may invoke during a chat turn.
//! The registry enumerates descriptors (name, description, JSON-Schema
//! parameters, cost hint) and executes invocations synchronously with a
//! per-call deadline.  Unknown tools are rejected with `NotFound`,
//! schema-invalid arguments with `Validation`.

pub mod builtin;
#[cfg(feature = "mcp-server")]
pub mod mcp;
pub mod registry;
pub mod tool;
pub mod validate;

pub use registry::ToolRegistry;
pub use tool::{CostHint, Tool, ToolDescriptor, ToolError};
