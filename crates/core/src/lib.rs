pub mod backend;
pub mod chain;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod index;
pub mod ingest;
pub mod knowledge;
pub mod models;
pub mod relay;
pub mod traits;

pub use backend::{
    HttpCompletionBackend, Invocation, InvocationState, InvocationStrategy, Invoker,
    PromptTemplate,
};
pub use chain::{render_prompt, ChainSettings, PreparedPrompt, RetrievalChain};
pub use chunking::{content_hash, split, Chunker, ChunkingConfig};
pub use embeddings::{
    CacheStats, CharacterNgramEmbedder, EmbeddingCache, HttpEmbeddingBackend,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{
    ChainError, Classify, EmbeddingError, Failure, FailureKind, IngestError, InvocationError,
    RelayError,
};
pub use extractor::{parser_for_key, DocumentParser, PdfParser, PlainTextParser};
pub use index::{cosine_similarity, MemoryVectorIndex};
pub use ingest::{DocumentLoader, FsObjectStore, HttpObjectStore};
pub use knowledge::KnowledgeBase;
pub use models::{
    render_chunks, BackendKind, ChunkBoundary, DocumentChunk, EmbeddingVector, InferenceRequest,
    RelayConfig, ScoredChunk, SourceDocument, TextChunk, SEGMENT_SEPARATOR,
};
pub use relay::{
    DeliveryMode, MemorySink, RelayState, RelaySummary, ResponseRelay, ResponseSink, WriterSink,
};
pub use traits::{CompletionBackend, EmbeddingBackend, ObjectStore};
