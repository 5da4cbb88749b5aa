// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Process entry point — assembles all subsystems and starts them.
//!
//! # Startup sequence
//!
//! `serve` performs these steps in order:
//!
//! 1. Load layered settings (files + explicit `--config`).
//! 2. Build the transactional store, vector index, embedder, and
//!    completion-provider adapters.
//! 3. Bootstrap the admin account when the user table is empty.
//! 4. Start the ingestion queue and worker pool.
//! 5. Start the upload expiry sweeper.
//! 6. Wire the retrieval engine, tool registry, and chat orchestrator.
//! 7. Spawn readiness probes.
//! 8. Start the Axum gateway (blocks until shutdown).

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lectern_auth::AuthService;
use lectern_chat::ChatOrchestrator;
use lectern_config::SettingsResolver;
use lectern_embed::{Embedder, HttpEmbedder};
use lectern_gateway::{
    build_router,
    health::{spawn_probes, HealthState},
    ratelimit::RouteLimiters,
    serve,
    state::{AppState, TokenCache},
};
use lectern_index::{MemoryVectorIndex, VectorStore};
use lectern_ingest::{run_worker_pool, IngestQueue, IngestWorker, ProgressHub};
use lectern_library::{LibraryService, StagingArea};
use lectern_model::{CompletionProvider, OpenAICompatProvider};
use lectern_retrieval::RetrievalEngine;
use lectern_store::{MemoryStore, Role, Store, UserRepo};
use lectern_tools::ToolRegistry;

use crate::cli::{Cli, Command};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config, bind } => run_serve(config.as_deref(), bind).await,
        Command::Config { config } => {
            let settings = lectern_config::loader::load(config.as_deref())?;
            println!("{}", serde_yaml::to_string(&settings)?);
            Ok(())
        }
        #[cfg(feature = "mcp-server")]
        Command::Mcp => {
            let registry = Arc::new(ToolRegistry::with_builtins());
            lectern_tools::mcp::serve_stdio(registry)
                .await
                .context("MCP stdio server failed")
        }
    }
}

async fn run_serve(config: Option<&std::path::Path>, bind: Option<String>) -> anyhow::Result<()> {
    let file_settings = lectern_config::loader::load(config)?;
    let settings = Arc::new(SettingsResolver::new(file_settings));
    let effective = settings.effective();

    // ── Ports ─────────────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let vectors: Arc<dyn VectorStore> =
        Arc::new(MemoryVectorIndex::new(effective.embedder.dimension));
    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(
        &effective.embedder.base_url,
        effective.embedder.model.clone(),
        resolve_key(effective.embedder.api_key_env.as_deref()),
        effective.embedder.dimension,
    ));
    let provider: Arc<dyn CompletionProvider> = Arc::new(OpenAICompatProvider::new(
        "openai-compat",
        &effective.model.base_url,
        resolve_key(effective.model.api_key_env.as_deref()),
    ));
    info!(
        model = %effective.model.default_name,
        embedder = %effective.embedder.model,
        dimension = effective.embedder.dimension,
        "ports wired"
    );

    // ── Auth + bootstrap admin ────────────────────────────────────────────────
    let auth = Arc::new(AuthService::new(Arc::clone(&store), Arc::clone(&settings)));
    if store.users().count().await? == 0 {
        let generated;
        let password = match &effective.auth.bootstrap_password {
            Some(p) => p.as_str(),
            None => {
                generated = uuid::Uuid::new_v4().simple().to_string();
                info!("=======================================================");
                info!("bootstrap admin credentials (shown once — save them now!)");
                info!("  email:    {}", effective.auth.bootstrap_email);
                info!("  password: {generated}");
                info!("=======================================================");
                generated.as_str()
            }
        };
        auth.register_user(
            &effective.auth.bootstrap_email,
            "Administrator",
            password,
            vec![Role::Admin, Role::User],
        )
        .await
        .context("creating bootstrap admin")?;
    }

    // ── Ingestion queue + workers ─────────────────────────────────────────────
    let (queue, queue_rx) = IngestQueue::bounded(effective.ingest.queue_capacity);
    let progress = Arc::new(ProgressHub::new());
    let worker = Arc::new(IngestWorker::new(
        Arc::clone(&store),
        Arc::clone(&vectors),
        Arc::clone(&embedder),
        Arc::clone(&settings),
        Arc::clone(&progress),
    ));
    let parallelism = effective
        .ingest
        .parallelism
        .min(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2));
    let _workers = run_worker_pool(parallelism, queue_rx, worker);
    info!(parallelism, capacity = effective.ingest.queue_capacity, "ingestion workers started");

    // ── Library + upload sweeper ──────────────────────────────────────────────
    let staging = Arc::new(StagingArea::new(effective.uploads.staging_dir.clone())?);
    let library = Arc::new(LibraryService::new(
        Arc::clone(&store),
        Arc::clone(&vectors),
        queue,
        staging,
        Arc::clone(&settings),
    ));
    let _sweeper = library.spawn_upload_sweeper();

    // ── Retrieval + chat ──────────────────────────────────────────────────────
    let retrieval = Arc::new(RetrievalEngine::new(
        Arc::clone(&embedder),
        Arc::clone(&vectors),
        Arc::clone(&store),
    ));
    let tools = Arc::new(ToolRegistry::with_builtins());
    let orchestrator = Arc::new(ChatOrchestrator::new(
        Arc::clone(&store),
        Arc::clone(&provider),
        tools,
        Arc::clone(&retrieval),
        Arc::clone(&settings),
    ));

    // ── Health probes ─────────────────────────────────────────────────────────
    let health = Arc::new(HealthState::new(Duration::from_secs(
        effective.server.readiness_grace_secs,
    )));
    let _probes = spawn_probes(
        Arc::clone(&health),
        Arc::clone(&store),
        Arc::clone(&vectors),
        Arc::clone(&embedder),
        Arc::clone(&provider),
    );

    // ── Gateway (blocks until shutdown) ───────────────────────────────────────
    let state = AppState {
        store,
        auth,
        library,
        orchestrator,
        retrieval,
        progress,
        settings: Arc::clone(&settings),
        limits: Arc::new(RouteLimiters::from_settings(&effective.rate_limits)),
        login_limiter: Arc::new(lectern_gateway::state::default_login_limiter()),
        token_cache: Arc::new(TokenCache::new()),
        health,
    };
    let router = build_router(state);
    let bind_addr = bind.unwrap_or_else(|| effective.server.bind.clone());
    serve(&bind_addr, router).await.context("gateway server failed")
}

fn resolve_key(env_var: Option<&str>) -> Option<String> {
    env_var.and_then(|name| std::env::var(name).ok())
}
