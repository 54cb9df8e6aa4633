use crate::chunking::{Chunker, ChunkingConfig};
use crate::embeddings::EmbeddingCache;
use crate::index::MemoryVectorIndex;
use crate::ingest::DocumentLoader;
use crate::models::SourceDocument;
use crate::ChainError;
use std::time::Instant;
use tracing::info;

const LOGGED_CACHE_KEYS: usize = 5;

/// Everything built once at cold start: the loaded document and its index.
pub struct KnowledgeBase {
    pub document: SourceDocument,
    pub index: MemoryVectorIndex,
}

impl KnowledgeBase {
    /// Loads `source_id`, chunks it, embeds every chunk through `cache` and
    /// indexes the result.
    pub async fn cold_start(
        loader: &DocumentLoader,
        source_id: &str,
        chunking: ChunkingConfig,
        cache: &EmbeddingCache,
    ) -> Result<Self, ChainError> {
        let started = Instant::now();
        let chunker = Chunker::new(chunking)?;

        let document = loader.load(source_id).await?;
        let chunks = chunker.chunk_document(&document.source_id, &document.text);
        info!(source = %document.source_id, chunks = chunks.len(), "document chunked");

        let index = MemoryVectorIndex::from_documents(chunks, cache).await?;

        let keys = cache.keys();
        let sample: Vec<&str> = keys
            .iter()
            .take(LOGGED_CACHE_KEYS)
            .map(String::as_str)
            .collect();
        info!(
            cached = keys.len(),
            keys = ?sample,
            duration_ms = started.elapsed().as_millis() as u64,
            "cold start complete"
        );

        Ok(Self { document, index })
    }
}
