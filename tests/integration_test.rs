// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end scenarios across the full pipeline: two-phase upload →
//! ingestion workers → retrieval → chat orchestration, using the in-memory
//! ports, the deterministic mock embedder, and a scripted completion
//! provider.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use lectern_auth::AuthService;
use lectern_chat::{ChatEvent, ChatOptions, ChatOrchestrator};
use lectern_config::{Settings, SettingsResolver};
use lectern_embed::{Embedder, MockEmbedder};
use lectern_index::{MemoryVectorIndex, VectorStore};
use lectern_ingest::{run_worker_pool, IngestQueue, IngestWorker, ProgressHub};
use lectern_library::{Actor, BindUpload, CreateCollection, LibraryService, UpdateCollection};
use lectern_model::{CompletionProvider, ScriptedProvider};
use lectern_retrieval::RetrievalEngine;
use lectern_store::{
    ChunkRepo, Collection, CollectionKind, Conversation, ConversationRepo, DocumentStatus,
    IngestStage, MemoryStore, MessageRepo, MessageStatus, Role, Store,
};
use lectern_tools::ToolRegistry;

const DIM: usize = 64;

struct Platform {
    store: Arc<MemoryStore>,
    vectors: Arc<MemoryVectorIndex>,
    library: Arc<LibraryService>,
    progress: Arc<ProgressHub>,
    auth: AuthService,
    actor: Actor,
    settings: Arc<SettingsResolver>,
    _staging_dir: tempfile::TempDir,
}

/// Assemble the whole platform against in-memory ports with fast retry
/// timings, plus a live two-worker ingestion pool.
async fn platform() -> Platform {
    let mut settings = Settings::default();
    settings.embedder.dimension = DIM;
    settings.embedder.batch_size = 8;
    settings.ingest.backoff_base_ms = 1;
    settings.ingest.backoff_cap_ms = 2;
    settings.chat.flush_interval_ms = 1;
    settings.chat.flush_chars = 1;
    let settings = Arc::new(SettingsResolver::new(settings));

    let store = Arc::new(MemoryStore::new());
    let vectors = Arc::new(MemoryVectorIndex::new(DIM));
    let embedder = Arc::new(MockEmbedder::new(DIM));
    let progress = Arc::new(ProgressHub::new());

    let (queue, queue_rx) = IngestQueue::bounded(64);
    let worker = Arc::new(IngestWorker::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&vectors) as Arc<dyn VectorStore>,
        Arc::clone(&embedder) as Arc<dyn Embedder>,
        Arc::clone(&settings),
        Arc::clone(&progress),
    ));
    let _pool = run_worker_pool(2, queue_rx, worker);

    let staging_dir = tempfile::tempdir().unwrap();
    let staging = Arc::new(lectern_library::StagingArea::new(staging_dir.path()).unwrap());
    let library = Arc::new(LibraryService::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&vectors) as Arc<dyn VectorStore>,
        queue,
        staging,
        Arc::clone(&settings),
    ));

    let auth = AuthService::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&settings));
    let user = auth
        .register_user("owner@example.com", "Owner", "a sturdy passphrase", vec![Role::User])
        .await
        .unwrap();

    Platform {
        store,
        vectors,
        library,
        progress,
        auth,
        actor: Actor::user(user.id),
        settings,
        _staging_dir: staging_dir,
    }
}

fn orchestrator(p: &Platform, provider: Arc<dyn CompletionProvider>) -> ChatOrchestrator {
    let embedder = Arc::new(MockEmbedder::new(DIM));
    let retrieval = Arc::new(RetrievalEngine::new(
        embedder,
        Arc::clone(&p.vectors) as Arc<dyn VectorStore>,
        Arc::clone(&p.store) as Arc<dyn Store>,
    ));
    ChatOrchestrator::new(
        Arc::clone(&p.store) as Arc<dyn Store>,
        provider,
        Arc::new(ToolRegistry::with_builtins()),
        retrieval,
        Arc::clone(&p.settings),
    )
}

async fn make_collection(p: &Platform, name: &str) -> Collection {
    p.library
        .create_collection(
            &p.actor,
            CreateCollection {
                name: name.into(),
                description: None,
                icon: None,
                color: None,
                kind: CollectionKind::Collection,
                parent_id: None,
            },
        )
        .await
        .unwrap()
}

/// Upload, bind, and wait for ingestion to reach a terminal status.
async fn ingest(
    p: &Platform,
    collection: Uuid,
    file_name: &str,
    mime: &str,
    content: &[u8],
) -> lectern_store::Document {
    let upload = p
        .library
        .begin_upload(&p.actor, file_name, content.len() as u64, mime, content.to_vec())
        .await
        .unwrap();
    let document = p
        .library
        .bind_upload(
            &p.actor,
            BindUpload {
                upload_id: upload.id,
                collection_id: collection,
                title: None,
            },
        )
        .await
        .unwrap();
    wait_terminal(p, document.id).await
}

async fn wait_terminal(p: &Platform, document_id: Uuid) -> lectern_store::Document {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let doc = p.store.documents().get_any(document_id).await.unwrap();
            if matches!(doc.status, DocumentStatus::Complete | DocumentStatus::Failed) {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("ingestion did not reach a terminal status")
}

fn twelve_paragraph_text() -> String {
    (0..12)
        .map(|i| {
            format!(
                "Paragraph {i}: {}",
                "the retrieval platform splits documents into chunks and embeds them "
                    .repeat(14)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ── Scenario: happy ingestion ─────────────────────────────────────────────────

#[tokio::test]
async fn happy_ingestion_runs_all_stages_and_indexes_every_chunk() {
    let p = platform().await;
    let collection = make_collection(&p, "papers").await;

    // Subscribe before binding so every stage is observed.
    let upload = p
        .library
        .begin_upload(
            &p.actor,
            "guide.txt",
            twelve_paragraph_text().len() as u64,
            "text/plain",
            twelve_paragraph_text().into_bytes(),
        )
        .await
        .unwrap();
    let document = p
        .library
        .bind_upload(
            &p.actor,
            BindUpload {
                upload_id: upload.id,
                collection_id: collection.id,
                title: Some("The Guide".into()),
            },
        )
        .await
        .unwrap();
    let mut progress_rx = p.progress.subscribe(document.id);
    let document = wait_terminal(&p, document.id).await;

    assert_eq!(document.status, DocumentStatus::Complete);
    assert!(document.chunk_count >= 12, "expected ≥12 chunks, got {}", document.chunk_count);
    assert_eq!(document.progress.percentage, 100);

    // Stage order is fetch → parse → split → embed → store → finalize.
    let mut stages = Vec::new();
    while let Ok(update) = progress_rx.try_recv() {
        if stages.last() != Some(&update.stage) {
            stages.push(update.stage);
        }
    }
    let expected_tail = [
        IngestStage::Embedding,
        IngestStage::Storing,
        IngestStage::Finalizing,
    ];
    assert!(
        stages.windows(3).any(|w| w == expected_tail),
        "stage sequence incomplete: {stages:?}"
    );

    // Chunk id multisets agree between the transactional store and the index.
    let rows = p.store.chunks().list_by_document(document.id).await.unwrap();
    let mut c1: Vec<Uuid> = rows.iter().map(|c| c.id).collect();
    c1.sort();
    let c2 = p.vectors.chunk_ids_for_document(document.id).await.unwrap();
    assert_eq!(c1, c2);
}

// ── Scenario: failed ingestion and retry ──────────────────────────────────────

#[tokio::test]
async fn corrupt_pdf_fails_cleanly_and_retry_fails_again() {
    let p = platform().await;
    let collection = make_collection(&p, "inbox").await;

    let document = ingest(&p, collection.id, "broken.pdf", "application/pdf", b"%PDF-1.7 \xff\xfe").await;
    assert_eq!(document.status, DocumentStatus::Failed);
    assert_eq!(document.chunk_count, 0);
    assert!(p.vectors.chunk_ids_for_document(document.id).await.unwrap().is_empty());
    assert_eq!(p.store.chunks().count_by_document(document.id).await.unwrap(), 0);

    // Retry re-enqueues; the media type is still unsupported, so the
    // document lands in failed again with no stray chunks.  Wait on the
    // version so the second processing attempt is actually observed.
    let before_retry = document.version;
    p.library.retry_document(&p.actor, document.id).await.unwrap();
    let document = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let doc = p.store.documents().get_any(document.id).await.unwrap();
            if doc.version > before_retry
                && matches!(doc.status, DocumentStatus::Complete | DocumentStatus::Failed)
            {
                return doc;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("retry did not reprocess the document");
    assert_eq!(document.status, DocumentStatus::Failed);
    assert_eq!(p.store.chunks().count_by_document(document.id).await.unwrap(), 0);
}

// ── Scenario: RAG answer with citations ───────────────────────────────────────

#[tokio::test]
async fn rag_answer_cites_the_ingested_document() {
    let p = platform().await;
    let collection = make_collection(&p, "kb").await;
    let document = ingest(
        &p,
        collection.id,
        "notes.md",
        "text/markdown",
        twelve_paragraph_text().as_bytes(),
    )
    .await;
    assert_eq!(document.status, DocumentStatus::Complete);

    let provider = Arc::new(ScriptedProvider::always_text(
        "The document describes chunking and embedding.",
    ));
    let orch = orchestrator(&p, Arc::clone(&provider) as Arc<dyn CompletionProvider>);
    let conversation = ConversationRepo::create(
        &*p.store,
        Conversation::new(p.actor.user_id, "about the guide"),
    )
    .await
    .unwrap();

    let (tx, mut rx) = mpsc::channel(256);
    orch.send_message(
        conversation.id,
        "what does the retrieval platform do with documents?",
        ChatOptions {
            attachments: vec![document.id],
            ..Default::default()
        },
        tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut saw_delta = false;
    let mut complete = None;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            ChatEvent::ContentDelta { .. } => saw_delta = true,
            ChatEvent::MessageComplete { message_id, citations, .. } => {
                complete = Some((message_id, citations));
            }
            _ => {}
        }
    }
    assert!(saw_delta);
    let (message_id, citations) = complete.expect("message_complete emitted");
    assert!(!citations.is_empty());
    assert!(citations.iter().any(|c| c.document_id == document.id));

    let message = MessageRepo::get(&*p.store, message_id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Complete);
    assert!(message.content.contains("chunking"));
    assert!(message.citations.iter().any(|c| c.document_id == document.id));

    // The provider saw the retrieved context under the stable marker.
    let req = provider.last_request.lock().unwrap().clone().unwrap();
    assert!(req.messages.iter().any(|m| m.content.starts_with("CONTEXT:\n")));
}

// ── Scenario: calculator tool loop ────────────────────────────────────────────

#[tokio::test]
async fn calculator_tool_loop_round_trips() {
    let p = platform().await;
    let provider = Arc::new(ScriptedProvider::tool_then_text(
        "call-1",
        "calculator",
        r#"{"a":2,"b":2}"#,
        "2 plus 2 is 4.",
    ));
    let orch = orchestrator(&p, provider);
    let conversation =
        ConversationRepo::create(&*p.store, Conversation::new(p.actor.user_id, "math"))
            .await
            .unwrap();

    let (tx, mut rx) = mpsc::channel(256);
    orch.send_message(
        conversation.id,
        "add 2 and 2 using the calculator",
        ChatOptions::default(),
        tx,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    assert!(events
        .iter()
        .any(|e| matches!(e, ChatEvent::ToolCallResult { result: Some(v), .. } if v == &serde_json::json!(4))));
    let content: String = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::ContentDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert!(content.contains('4'));
}

// ── Scenario: optimistic concurrency on collections ───────────────────────────

#[tokio::test]
async fn concurrent_collection_updates_yield_one_conflict() {
    let p = platform().await;
    let collection = make_collection(&p, "shared").await;

    let rename = |name: &str| UpdateCollection {
        name: Some(name.into()),
        ..Default::default()
    };
    let first = p
        .library
        .update_collection(&p.actor, collection.id, rename("alpha"), collection.version)
        .await;
    let second = p
        .library
        .update_collection(&p.actor, collection.id, rename("beta"), collection.version)
        .await;
    assert!(first.is_ok());
    assert!(second.is_err());
}

// ── Scenario: auth round trip across the platform ─────────────────────────────

#[tokio::test]
async fn login_refresh_logout_lifecycle() {
    let p = platform().await;
    let pair = p
        .auth
        .login("owner@example.com", "a sturdy passphrase", None)
        .await
        .unwrap();
    let principal = p.auth.validate(&pair.access_token).await.unwrap();
    assert_eq!(principal.user_id, p.actor.user_id);

    let rotated = p.auth.refresh(&pair.refresh_token).await.unwrap();
    assert!(p.auth.validate(&pair.access_token).await.is_err());
    p.auth.logout(&rotated.refresh_token, false).await.unwrap();
    assert!(p.auth.validate(&rotated.access_token).await.is_err());
}
