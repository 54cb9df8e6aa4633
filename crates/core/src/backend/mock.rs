//! In-process backends for tests and offline runs.

use super::{codec, CompletionPayload, EventListener, FrameStream};
use crate::embeddings::CharacterNgramEmbedder;
use crate::traits::{CompletionBackend, EmbeddingBackend};
use crate::{EmbeddingError, EmbeddingVector, InvocationError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// One event pushed to a manual-drain listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedEvent {
    /// A completion fragment, encoded as a regular frame.
    Data(String),
    Error { name: String, message: String },
    End,
    /// Drops the listener without an end event.
    Hangup,
}

/// Completion backend that answers every call with the same scripted text.
///
/// Buffered calls return the whole completion, native streams emit it as
/// word-sized frames and subscriptions replay [`ScriptedEvent`]s.
pub struct MockCompletionBackend {
    completion: String,
    frames: Vec<Vec<u8>>,
    events: Vec<ScriptedEvent>,
    failure: Option<(String, String)>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockCompletionBackend {
    pub fn answering(completion: impl Into<String>) -> Self {
        let completion = completion.into();
        let fragments = fragments(&completion);
        let frames = fragments.iter().map(|part| codec::encode_frame(part)).collect();
        let events = fragments
            .into_iter()
            .map(ScriptedEvent::Data)
            .chain(std::iter::once(ScriptedEvent::End))
            .collect();

        Self {
            completion,
            frames,
            events,
            failure: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every call style fails with the named backend error.
    pub fn failing(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let mut backend = Self::answering("");
        backend.frames = vec![codec::encode_error_frame(&name, &message)];
        backend.events = vec![ScriptedEvent::Error {
            name: name.clone(),
            message: message.clone(),
        }];
        backend.failure = Some((name, message));
        backend
    }

    pub fn with_events(mut self, events: Vec<ScriptedEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn with_frames(mut self, frames: Vec<Vec<u8>>) -> Self {
        self.frames = frames;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Rendered prompts in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, payload: &CompletionPayload) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.prompt.clone());
    }
}

fn fragments(text: &str) -> Vec<String> {
    text.split_inclusive(' ').map(str::to_string).collect()
}

#[async_trait]
impl CompletionBackend for MockCompletionBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, payload: &CompletionPayload) -> Result<Vec<u8>, InvocationError> {
        self.record(payload);
        if let Some((name, message)) = &self.failure {
            return Err(InvocationError::from_event(name, message.clone()));
        }
        Ok(codec::encode_completion(&self.completion))
    }

    async fn invoke_stream(
        &self,
        payload: &CompletionPayload,
    ) -> Result<FrameStream, InvocationError> {
        self.record(payload);
        let frames = self.frames.clone();
        Ok(stream::iter(frames.into_iter().map(Ok)).boxed())
    }

    fn subscribe(&self, payload: CompletionPayload, listener: EventListener) {
        self.record(&payload);
        let events = self.events.clone();
        tokio::spawn(async move {
            for event in events {
                match event {
                    ScriptedEvent::Data(text) => {
                        if !listener.data(codec::encode_frame(&text)).await {
                            return;
                        }
                    }
                    ScriptedEvent::Error { name, message } => {
                        return listener.error(&name, &message).await;
                    }
                    ScriptedEvent::End => return listener.end().await,
                    ScriptedEvent::Hangup => return,
                }
            }
        });
    }
}

/// Wraps [`CharacterNgramEmbedder`] with a call counter, optional latency
/// and a number of leading calls that fail.
pub struct CountingEmbedder {
    inner: CharacterNgramEmbedder,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    latency: Option<Duration>,
}

impl CountingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            inner: CharacterNgramEmbedder { dimensions },
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            latency: None,
        }
    }

    pub fn failing_first(mut self, failures: usize) -> Self {
        self.failures_left = AtomicUsize::new(failures);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for CountingEmbedder {
    fn default() -> Self {
        Self::new(crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl EmbeddingBackend for CountingEmbedder {
    fn name(&self) -> &str {
        "counting"
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions
    }

    async fn embed(&self, text: &str) -> Result<EmbeddingVector, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EmbeddingError::Backend {
                backend: self.name().to_string(),
                details: "scripted failure".to_string(),
            });
        }

        self.inner.embed(text).await
    }
}
