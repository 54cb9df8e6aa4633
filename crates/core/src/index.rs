use crate::embeddings::EmbeddingCache;
use crate::models::{DocumentChunk, EmbeddingVector, ScoredChunk};
use crate::EmbeddingError;
use std::cmp::Ordering;
use std::time::Instant;
use tracing::info;

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.is_empty() || left.len() != right.len() {
        return 0.0;
    }

    let dot = left.iter().zip(right).map(|(a, b)| a * b).sum::<f32>();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }

    dot / (left_norm * right_norm)
}

struct Entry {
    chunk: DocumentChunk,
    vector: EmbeddingVector,
}

/// Immutable in-memory index. Ranking is cosine similarity, highest first,
/// with ties going to the lower ordinal.
pub struct MemoryVectorIndex {
    entries: Vec<Entry>,
    dimensions: usize,
}

impl MemoryVectorIndex {
    pub fn build(
        chunks: Vec<DocumentChunk>,
        embeddings: Vec<EmbeddingVector>,
    ) -> Result<Self, EmbeddingError> {
        if chunks.len() != embeddings.len() {
            return Err(EmbeddingError::CountMismatch {
                chunks: chunks.len(),
                embeddings: embeddings.len(),
            });
        }

        let dimensions = embeddings.first().map(Vec::len).unwrap_or_default();
        if let Some(bad) = embeddings.iter().find(|vector| vector.len() != dimensions) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dimensions,
                found: bad.len(),
            });
        }

        let entries = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, vector)| Entry { chunk, vector })
            .collect();

        Ok(Self {
            entries,
            dimensions,
        })
    }

    /// Embeds every chunk through `cache`, then builds the index.
    pub async fn from_documents(
        chunks: Vec<DocumentChunk>,
        cache: &EmbeddingCache,
    ) -> Result<Self, EmbeddingError> {
        let started = Instant::now();
        let embeddings = cache.embed_documents(&chunks).await?;
        let index = Self::build(chunks, embeddings)?;

        info!(
            chunks = index.len(),
            dimensions = index.dimensions,
            duration_ms = started.elapsed().as_millis() as u64,
            "vector index built"
        );
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn chunks(&self) -> impl Iterator<Item = &DocumentChunk> {
        self.entries.iter().map(|entry| &entry.chunk)
    }

    pub fn retrieve_scored(&self, query: &[f32], k: usize) -> Vec<ScoredChunk> {
        let mut scored: Vec<(f32, &DocumentChunk)> = self
            .entries
            .iter()
            .map(|entry| (cosine_similarity(query, &entry.vector), &entry.chunk))
            .collect();

        scored.sort_by(|(left_score, left), (right_score, right)| {
            match right_score.total_cmp(left_score) {
                Ordering::Equal => left.ordinal.cmp(&right.ordinal),
                other => other,
            }
        });

        scored
            .into_iter()
            .take(k)
            .map(|(score, chunk)| ScoredChunk {
                chunk: chunk.clone(),
                score,
            })
            .collect()
    }

    pub fn retrieve(&self, query: &[f32], k: usize) -> Vec<DocumentChunk> {
        self.retrieve_scored(query, k)
            .into_iter()
            .map(|scored| scored.chunk)
            .collect()
    }
}
