use crate::models::{DocumentChunk, EmbeddingVector};
use crate::traits::EmbeddingBackend;
use crate::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// Offline embedder: hashed character trigrams, L2-normalised.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn vector(&self, text: &str) -> EmbeddingVector {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingBackend for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        "character-ngram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        Ok(self.vector(text))
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Remote embedding model: `POST {endpoint}/model/{model_id}/invoke` with
/// `{"inputText": ...}`, answered by `{"embedding": [...]}`.
pub struct HttpEmbeddingBackend {
    model_id: String,
    endpoint: Url,
    dimensions: usize,
    client: Client,
}

impl HttpEmbeddingBackend {
    pub fn new(
        endpoint: &str,
        model_id: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, EmbeddingError> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        Ok(Self {
            model_id: model_id.into(),
            endpoint,
            dimensions,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbeddingBackend {
    fn name(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        let url = self
            .endpoint
            .join(&format!("model/{}/invoke", self.model_id))?;

        let response = self
            .client
            .post(url)
            .json(&json!({ "inputText": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Backend {
                backend: self.model_id.clone(),
                details: format!("status {status}: {body}"),
            });
        }

        let parsed: EmbeddingResponse = serde_json::from_slice(&response.bytes().await?)?;
        if parsed.embedding.len() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                found: parsed.embedding.len(),
            });
        }

        Ok(parsed.embedding)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Content-addressed cache in front of an [`EmbeddingBackend`].
///
/// Entries are keyed by [`DocumentChunk::content_hash`] and live for the
/// lifetime of the cache. Each key owns a `OnceCell`, so concurrent misses
/// on the same content wait for a single backend call. Failed calls leave the
/// cell empty and the next lookup retries.
pub struct EmbeddingCache {
    backend: Arc<dyn EmbeddingBackend>,
    entries: Mutex<HashMap<String, Arc<OnceCell<EmbeddingVector>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            backend,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &dyn EmbeddingBackend {
        self.backend.as_ref()
    }

    pub fn dimensions(&self) -> usize {
        self.backend.dimensions()
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<EmbeddingVector>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(key.to_string()).or_default())
    }

    pub async fn embed(&self, chunk: &DocumentChunk) -> Result<EmbeddingVector, EmbeddingError> {
        let cell = self.cell(&chunk.content_hash);
        let computed = AtomicBool::new(false);

        let vector = cell
            .get_or_try_init(|| async {
                computed.store(true, Ordering::Relaxed);
                self.backend.embed(&chunk.text).await
            })
            .await?;

        if computed.load(Ordering::Relaxed) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %chunk.content_hash, backend = self.backend.name(), "embedding cache miss");
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        Ok(vector.clone())
    }

    /// Embeds chunks in order, one lookup per chunk.
    pub async fn embed_documents(
        &self,
        chunks: &[DocumentChunk],
    ) -> Result<Vec<EmbeddingVector>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            vectors.push(self.embed(chunk).await?);
        }
        Ok(vectors)
    }

    /// Query strings bypass the cache.
    pub async fn embed_query(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        self.backend.embed(text).await
    }

    /// Keys with a stored vector, sorted.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.keys().len(),
        }
    }
}
