//! Retrieval Engine
//!
//! Embeds a query and returns the knowledge entries whose cosine similarity
//! strictly exceeds a threshold, best match first. The similarity search
//! itself is delegated to a [`KnowledgeStore`], which may be the database's
//! native vector operator or the in-process [`InMemoryKnowledgeStore`]; the
//! engine re-applies the threshold, ordering and limit so the contract holds
//! regardless of the store.

use crate::{
    error::RetrievalError,
    model::{KnowledgeEntry, ScoredEntry},
};
use anyhow::{Context, Result};
use async_openai::{Client, config::OpenAIConfig, types::CreateEmbeddingRequestArgs};
use async_trait::async_trait;
use std::{cmp::Ordering, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// Converts text into an embedding vector.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Similarity search over stored knowledge entries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Returns entries with similarity above `threshold`, best first, at most `match_count`.
    async fn match_knowledge(
        &self,
        query_embedding: &[f32],
        threshold: f32,
        match_count: usize,
    ) -> Result<Vec<ScoredEntry>>;
}

/// Embedding provider backed by any OpenAI-compatible embeddings endpoint.
pub struct OpenAIEmbeddingProvider {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAIEmbeddingProvider {
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let input = text.replace('\0', "");
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(input)
            .build()?;
        let response = self.client.embeddings().create(request).await?;
        let embedding = response
            .data
            .into_iter()
            .next()
            .context("Embedding response contained no data")?
            .embedding;
        debug!(dimensions = embedding.len(), "Generated embedding");
        Ok(embedding)
    }
}

/// Cosine similarity of two vectors, or `None` when it is undefined.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Best match first; equal scores ordered by entry id.
fn rank(a: &ScoredEntry, b: &ScoredEntry) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.entry.id.cmp(&b.entry.id))
}

/// Linear-scan store for small corpora, local development and tests.
#[derive(Default)]
pub struct InMemoryKnowledgeStore {
    entries: RwLock<Vec<(KnowledgeEntry, Vec<f32>)>>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, entry: KnowledgeEntry, embedding: Vec<f32>) {
        self.entries.write().await.push((entry, embedding));
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn match_knowledge(
        &self,
        query_embedding: &[f32],
        threshold: f32,
        match_count: usize,
    ) -> Result<Vec<ScoredEntry>> {
        let entries = self.entries.read().await;
        let mut matches: Vec<ScoredEntry> = entries
            .iter()
            .filter_map(|(entry, embedding)| {
                let similarity = cosine_similarity(query_embedding, embedding)?;
                (similarity > threshold).then(|| ScoredEntry {
                    entry: entry.clone(),
                    similarity,
                })
            })
            .collect();
        matches.sort_by(rank);
        matches.truncate(match_count);
        Ok(matches)
    }
}

pub struct RetrievalEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn KnowledgeStore>,
    timeout: Duration,
}

impl RetrievalEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn KnowledgeStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            timeout,
        }
    }

    /// Returns entries scoring strictly above `threshold`, best first, at most `top_k`.
    ///
    /// An empty result means nothing matched; a failing embedding capability
    /// is an error, never an empty result. The whole call, embedding included,
    /// is bounded by the engine's timeout.
    pub async fn retrieve(
        &self,
        query: &str,
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<ScoredEntry>, RetrievalError> {
        if query.trim().is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let search = async {
            let embedding = self.embedder.embed(query).await.map_err(|e| {
                error!(error = ?e, "Embedding capability failed");
                RetrievalError::EmbeddingUnavailable(e.to_string())
            })?;
            self.store
                .match_knowledge(&embedding, threshold, top_k)
                .await
                .map_err(|e| {
                    error!(error = ?e, "Knowledge store query failed");
                    RetrievalError::Store(e.to_string())
                })
        };

        let mut matches = tokio::time::timeout(self.timeout, search)
            .await
            .map_err(|_| RetrievalError::Timeout)??;

        matches.retain(|m| m.similarity > threshold);
        matches.sort_by(rank);
        matches.truncate(top_k);

        info!(
            matches = matches.len(),
            threshold,
            top_k,
            "Knowledge retrieval completed"
        );
        Ok(matches)
    }
}
