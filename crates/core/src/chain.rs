use crate::backend::{Invocation, Invoker};
use crate::embeddings::EmbeddingCache;
use crate::index::MemoryVectorIndex;
use crate::models::{BackendKind, DocumentChunk, InferenceRequest, RelayConfig};
use crate::relay::{RelaySummary, ResponseRelay, ResponseSink};
use crate::{ChainError, Failure};
use tracing::{debug, info};

pub const SYSTEM_TEMPLATE: &str = "Use the following pieces of context to answer the question at the end.\n\
If you don't know the answer, just say that you don't know, don't try to make up an answer.\n\
----------------\n\
{context}";

const CONTEXT_SEPARATOR: &str = "\n\n";

/// Fills the system template with `context` and appends the question verbatim.
pub fn render_prompt(context: &str, question: &str) -> String {
    let system = SYSTEM_TEMPLATE.replacen("{context}", context, 1);
    format!("{system}\n\n{question}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainSettings {
    pub model_id: String,
    pub backend: BackendKind,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: usize,
}

impl From<&RelayConfig> for ChainSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            model_id: config.completion_model.clone(),
            backend: config.backend,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            top_k: config.top_k,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    pub question: String,
    pub retrieved: Vec<DocumentChunk>,
    pub context: String,
    pub prompt: String,
}

/// Question answering over a built index: embed, retrieve, render, stream.
pub struct RetrievalChain<'a> {
    cache: &'a EmbeddingCache,
    index: &'a MemoryVectorIndex,
    invoker: &'a Invoker,
    settings: ChainSettings,
}

impl<'a> RetrievalChain<'a> {
    pub fn new(
        cache: &'a EmbeddingCache,
        index: &'a MemoryVectorIndex,
        invoker: &'a Invoker,
        settings: ChainSettings,
    ) -> Self {
        Self {
            cache,
            index,
            invoker,
            settings,
        }
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    /// Retrieves context for `question` and renders the prompt. An empty
    /// retrieval still produces a prompt, with an empty context block.
    pub async fn prepare(&self, question: &str) -> Result<PreparedPrompt, ChainError> {
        let query = self.cache.embed_query(question).await?;
        let retrieved = self.index.retrieve(&query, self.settings.top_k);

        let context = retrieved
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect::<Vec<_>>()
            .join(CONTEXT_SEPARATOR);

        info!(
            retrieved = retrieved.len(),
            ordinals = ?retrieved.iter().map(|chunk| chunk.ordinal).collect::<Vec<_>>(),
            "context retrieved"
        );

        Ok(PreparedPrompt {
            question: question.to_string(),
            prompt: render_prompt(&context, question),
            retrieved,
            context,
        })
    }

    pub fn request(&self, prompt: impl Into<String>) -> InferenceRequest {
        InferenceRequest::new(self.settings.model_id.clone(), prompt)
            .with_max_tokens(self.settings.max_tokens)
            .with_temperature(self.settings.temperature)
            .with_backend(self.settings.backend)
            .with_streaming(true)
    }

    /// The answer as a lazy chunk stream, always requested in streaming mode.
    pub async fn stream(&self, question: &str) -> Result<Invocation, ChainError> {
        let prepared = self.prepare(question).await?;
        Ok(self.invoker.invoke(&self.request(prepared.prompt)))
    }

    /// Streams the answer into `relay` and terminates it, on failure too.
    pub async fn answer<S: ResponseSink>(
        &self,
        question: &str,
        relay: &mut ResponseRelay<S>,
    ) -> Result<RelaySummary, ChainError> {
        let invocation = match self.stream(question).await {
            Ok(invocation) => invocation,
            Err(error) => {
                relay.fail(&Failure::from(&error)).await?;
                return Err(error);
            }
        };

        debug!(invocation = %invocation.id(), strategy = ?invocation.strategy(), "answering");
        relay.pump(invocation).await
    }
}
