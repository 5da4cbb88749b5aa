// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! OpenAI-compatible `/embeddings` adapter.  Works against OpenAI, Ollama,
//! vLLM, LM Studio and every other server that speaks the same wire format.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{EmbedError, Embedder};

pub struct HttpEmbedder {
    /// Full embeddings URL, e.g. `https://api.openai.com/v1/embeddings`.
    url: String,
    model: String,
    /// Pre-resolved API key; `None` for local servers.
    api_key: Option<String>,
    dimension: usize,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// `base_url` ends before `/embeddings`, e.g. `http://localhost:11434/v1`.
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        dimension: usize,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            url: format!("{base}/embeddings"),
            model: model.into(),
            api_key,
            dimension,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = json!({
            "model": self.model,
            "input": texts,
        });
        debug!(model = %self.model, batch = texts.len(), "embedding batch");

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EmbedError::Unavailable(format!("embeddings request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            // 4xx means the input was rejected (too long, bad model name);
            // everything else is a server-side problem worth retrying.
            return if status.is_client_error() && status.as_u16() != 429 {
                Err(EmbedError::Invalid(format!("embeddings error {status}: {text}")))
            } else {
                Err(EmbedError::Unavailable(format!(
                    "embeddings error {status}: {text}"
                )))
            };
        }

        let parsed: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Unavailable(format!("malformed embeddings response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(EmbedError::Unavailable(format!(
                "embeddings response had {} rows for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        // The API is allowed to return rows out of order; `index` restores
        // the 1:1 alignment with the input batch.
        let mut rows = parsed.data;
        rows.sort_by_key(|r| r.index);
        for row in &rows {
            if row.embedding.len() != self.dimension {
                return Err(EmbedError::Invalid(format!(
                    "embedding dimension {} does not match configured {}",
                    row.embedding.len(),
                    self.dimension
                )));
            }
        }
        Ok(rows.into_iter().map(|r| r.embedding).collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
