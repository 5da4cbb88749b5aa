// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "lectern",
    version,
    about = "Self-hosted retrieval-augmented generation platform"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the API gateway and ingestion workers
    Serve {
        /// Explicit config file path (merged over the search-path layers)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the effective configuration as YAML and exit
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Serve the built-in tool registry to an MCP client over stdio
    #[cfg(feature = "mcp-server")]
    Mcp,
}
