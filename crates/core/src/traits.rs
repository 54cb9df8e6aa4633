use crate::backend::{CompletionPayload, EventListener, FrameStream};
use crate::{EmbeddingError, EmbeddingVector, IngestError, InvocationError};
use async_trait::async_trait;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches the full object. A missing object is `IngestError::SourceUnavailable`.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, IngestError>;
}

#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError>;
}

/// A completion service reachable in three styles.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Single blocking call; returns the raw response body.
    async fn invoke(&self, payload: &CompletionPayload) -> Result<Vec<u8>, InvocationError>;

    /// Opens a stream of encoded frames.
    async fn invoke_stream(&self, payload: &CompletionPayload)
        -> Result<FrameStream, InvocationError>;

    /// Starts delivery in the background and pushes every event into `listener`.
    fn subscribe(&self, payload: CompletionPayload, listener: EventListener);
}
