//! Backend invocation: one lazy chunk stream over three call styles.
//!
//! `Buffered` makes one call and re-segments the payload, `NativeStreaming`
//! decodes frames as they arrive, and `ManualDrain` bridges push-style events
//! through a bounded queue. All three end with exactly one terminal outcome.

pub mod codec;
pub mod http;
pub mod mock;

use crate::models::{BackendKind, InferenceRequest, TextChunk};
use crate::traits::CompletionBackend;
use crate::InvocationError;
use futures::stream::{self, BoxStream, FusedStream, Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub use http::HttpCompletionBackend;

/// Encoded frames as delivered by a streaming backend.
pub type FrameStream = BoxStream<'static, Result<Vec<u8>, InvocationError>>;

pub type ChunkStream = BoxStream<'static, Result<TextChunk, InvocationError>>;

const DEFAULT_DRAIN_CAPACITY: usize = 64;

pub const HUMAN_PROMPT: &str = "\n\nHuman:";
pub const AI_PROMPT: &str = "\n\nAssistant:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationStrategy {
    Buffered,
    NativeStreaming,
    ManualDrain,
}

impl InvocationStrategy {
    pub fn select(backend: BackendKind, streaming: bool) -> Self {
        match (backend, streaming) {
            (_, false) => Self::Buffered,
            (BackendKind::Primary, true) => Self::NativeStreaming,
            (BackendKind::Secondary, true) => Self::ManualDrain,
        }
    }

    pub fn for_request(request: &InferenceRequest) -> Self {
        Self::select(request.backend(), request.streaming())
    }
}

/// Role markers wrapped around a prompt before it reaches a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptTemplate {
    /// `\n\nHuman:{prompt}Assistant:`
    Compact,
    /// `\n\nHuman: {prompt} \n\nAssistant:`
    Spaced,
}

impl PromptTemplate {
    pub fn for_backend(backend: BackendKind) -> Self {
        match backend {
            BackendKind::Primary => Self::Compact,
            BackendKind::Secondary => Self::Spaced,
        }
    }

    pub fn render(&self, prompt: &str) -> String {
        match self {
            Self::Compact => format!("{HUMAN_PROMPT}{prompt}Assistant:"),
            Self::Spaced => format!("{HUMAN_PROMPT} {prompt} {AI_PROMPT}"),
        }
    }
}

/// Request body sent to a completion backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionPayload {
    #[serde(skip)]
    pub model_id: String,
    pub prompt: String,
    #[serde(rename = "max_tokens_to_sample")]
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(skip)]
    pub streaming: bool,
}

impl CompletionPayload {
    /// Builds the payload, applying the backend template to the request prompt.
    pub fn from_request(request: &InferenceRequest) -> Self {
        let template = PromptTemplate::for_backend(request.backend());
        Self {
            model_id: request.model_id().to_string(),
            prompt: template.render(request.prompt()),
            max_tokens: request.max_tokens(),
            temperature: request.temperature(),
            streaming: request.streaming(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Idle,
    Invoking,
    Streaming,
    Draining,
    Complete,
    Failed,
}

impl InvocationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

enum DrainEvent {
    Data(Vec<u8>),
    Failed(InvocationError),
    End,
}

/// Producer half of the manual-drain bridge.
///
/// `data` suspends while the queue is full. `error`, `fail` and `end` consume
/// the listener, so a backend can only terminate a subscription once.
pub struct EventListener {
    tx: mpsc::Sender<DrainEvent>,
}

impl EventListener {
    /// Pushes one encoded frame. Returns `false` once the consumer is gone.
    pub async fn data(&self, frame: Vec<u8>) -> bool {
        self.tx.send(DrainEvent::Data(frame)).await.is_ok()
    }

    /// Reports a named backend error event such as `throttlingException`.
    pub async fn error(self, name: &str, message: &str) {
        self.fail(InvocationError::from_event(name, message)).await;
    }

    pub async fn fail(self, error: InvocationError) {
        if self.tx.send(DrainEvent::Failed(error)).await.is_err() {
            debug!("drain consumer dropped before failure delivery");
        }
    }

    pub async fn end(self) {
        if self.tx.send(DrainEvent::End).await.is_err() {
            debug!("drain consumer dropped before end delivery");
        }
    }
}

fn drain_events(rx: mpsc::Receiver<DrainEvent>) -> impl Stream<Item = Result<TextChunk, InvocationError>> {
    stream::unfold(Some(rx), |state| async move {
        let Some(mut rx) = state else {
            return None;
        };
        match rx.recv().await {
            Some(DrainEvent::Data(frame)) => match codec::decode_frame(&frame) {
                Ok(chunk) => Some((Ok(chunk), Some(rx))),
                Err(error) => Some((Err(error), None)),
            },
            Some(DrainEvent::Failed(error)) => Some((Err(error), None)),
            Some(DrainEvent::End) => None,
            None => Some((
                Err(InvocationError::Internal(
                    "event source closed without an end event".to_string(),
                )),
                None,
            )),
        }
    })
    .filter_map(|item| async move { item.transpose() })
}

/// Routes requests to the backend selected by their [`BackendKind`].
#[derive(Clone)]
pub struct Invoker {
    primary: Arc<dyn CompletionBackend>,
    secondary: Arc<dyn CompletionBackend>,
    drain_capacity: usize,
}

impl Invoker {
    pub fn new(primary: Arc<dyn CompletionBackend>, secondary: Arc<dyn CompletionBackend>) -> Self {
        Self {
            primary,
            secondary,
            drain_capacity: DEFAULT_DRAIN_CAPACITY,
        }
    }

    /// Serves both backend kinds from the same service.
    pub fn single(backend: Arc<dyn CompletionBackend>) -> Self {
        Self::new(Arc::clone(&backend), backend)
    }

    pub fn with_drain_capacity(mut self, capacity: usize) -> Self {
        self.drain_capacity = capacity.max(1);
        self
    }

    pub fn backend(&self, kind: BackendKind) -> &Arc<dyn CompletionBackend> {
        match kind {
            BackendKind::Primary => &self.primary,
            BackendKind::Secondary => &self.secondary,
        }
    }

    /// Returns the lazy chunk sequence for `request`. Nothing is sent to the
    /// backend until the returned [`Invocation`] is first polled.
    pub fn invoke(&self, request: &InferenceRequest) -> Invocation {
        let strategy = InvocationStrategy::for_request(request);
        let payload = CompletionPayload::from_request(request);
        let backend = Arc::clone(self.backend(request.backend()));

        let inner = match strategy {
            InvocationStrategy::Buffered => buffered(backend, payload),
            InvocationStrategy::NativeStreaming => native_streaming(backend, payload),
            InvocationStrategy::ManualDrain => manual_drain(backend, payload, self.drain_capacity),
        };

        Invocation::new(strategy, inner)
    }
}

fn buffered(backend: Arc<dyn CompletionBackend>, payload: CompletionPayload) -> ChunkStream {
    stream::once(async move {
        let body = backend.invoke(&payload).await?;
        let completion = codec::decode_completion(&body)?;
        Ok::<_, InvocationError>(codec::segment_completion(&completion))
    })
    .flat_map(|result| match result {
        Ok(segments) => stream::iter(segments.into_iter().map(Ok)).left_stream(),
        Err(error) => stream::iter(vec![Err(error)]).right_stream(),
    })
    .boxed()
}

fn native_streaming(backend: Arc<dyn CompletionBackend>, payload: CompletionPayload) -> ChunkStream {
    stream::once(async move { backend.invoke_stream(&payload).await })
        .flat_map(|opened| match opened {
            Ok(frames) => frames
                .map(|frame| frame.and_then(|bytes| codec::decode_frame(&bytes)))
                .left_stream(),
            Err(error) => stream::iter(vec![Err(error)]).right_stream(),
        })
        .filter_map(|item| async move { item.transpose() })
        .boxed()
}

fn manual_drain(
    backend: Arc<dyn CompletionBackend>,
    payload: CompletionPayload,
    capacity: usize,
) -> ChunkStream {
    stream::once(async move {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        backend.subscribe(payload, EventListener { tx });
        drain_events(rx)
    })
    .flatten()
    .boxed()
}

/// One in-flight invocation. Yields chunks in production order, at most one
/// error, and then ends for good.
pub struct Invocation {
    id: Uuid,
    strategy: InvocationStrategy,
    state: InvocationState,
    inner: ChunkStream,
    chunks: usize,
}

impl Invocation {
    fn new(strategy: InvocationStrategy, inner: ChunkStream) -> Self {
        Self {
            id: Uuid::new_v4(),
            strategy,
            state: InvocationState::Idle,
            inner,
            chunks: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn strategy(&self) -> InvocationStrategy {
        self.strategy
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn chunks_yielded(&self) -> usize {
        self.chunks
    }
}

impl Stream for Invocation {
    type Item = Result<TextChunk, InvocationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.state {
            InvocationState::Complete | InvocationState::Failed => return Poll::Ready(None),
            InvocationState::Idle => {
                debug!(invocation = %this.id, strategy = ?this.strategy, "invoking backend");
                this.state = InvocationState::Invoking;
            }
            _ => {}
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.chunks += 1;
                this.state = match this.strategy {
                    InvocationStrategy::Buffered => InvocationState::Draining,
                    _ => InvocationState::Streaming,
                };
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(error))) => {
                this.state = InvocationState::Failed;
                warn!(invocation = %this.id, chunks = this.chunks, error = %error, "invocation failed");
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.state = InvocationState::Complete;
                debug!(invocation = %this.id, chunks = this.chunks, "invocation complete");
                Poll::Ready(None)
            }
        }
    }
}

impl FusedStream for Invocation {
    fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{MockCompletionBackend, ScriptedEvent};
    use super::*;
    use crate::models::render_chunks;
    use crate::{Classify, FailureKind};

    const ANSWER: &str = "Lambda adds up to 300 concurrent executions per minute.\n\nIt scales pollers faster.";

    fn request(backend: BackendKind, streaming: bool) -> InferenceRequest {
        InferenceRequest::new("anthropic.claude-v2", "How fast?")
            .with_backend(backend)
            .with_streaming(streaming)
    }

    async fn collect(invocation: Invocation) -> Result<Vec<TextChunk>, InvocationError> {
        let items: Vec<_> = invocation.collect().await;
        items.into_iter().collect()
    }

    #[test]
    fn strategy_is_selected_once_from_kind_and_flag() {
        assert_eq!(
            InvocationStrategy::select(BackendKind::Primary, false),
            InvocationStrategy::Buffered
        );
        assert_eq!(
            InvocationStrategy::select(BackendKind::Secondary, false),
            InvocationStrategy::Buffered
        );
        assert_eq!(
            InvocationStrategy::select(BackendKind::Primary, true),
            InvocationStrategy::NativeStreaming
        );
        assert_eq!(
            InvocationStrategy::select(BackendKind::Secondary, true),
            InvocationStrategy::ManualDrain
        );
    }

    #[test]
    fn templates_wrap_prompt_with_role_markers() {
        assert_eq!(
            PromptTemplate::Compact.render("hi"),
            "\n\nHuman:hiAssistant:"
        );
        assert_eq!(
            PromptTemplate::Spaced.render("hi"),
            "\n\nHuman: hi \n\nAssistant:"
        );
    }

    #[test]
    fn template_is_not_reapplied_when_request_is_reused() {
        let request = request(BackendKind::Primary, true);
        let first = CompletionPayload::from_request(&request);
        let second = CompletionPayload::from_request(&request);
        assert_eq!(first, second);
        assert_eq!(request.prompt(), "How fast?");
        assert_eq!(first.prompt.matches("Human:").count(), 1);
    }

    #[tokio::test]
    async fn invocation_is_lazy_until_polled() {
        let backend = Arc::new(MockCompletionBackend::answering(ANSWER));
        let invoker = Invoker::single(backend.clone());
        let invocation = invoker.invoke(&request(BackendKind::Primary, false));
        assert_eq!(invocation.state(), InvocationState::Idle);
        assert_eq!(backend.calls(), 0);

        let chunks = collect(invocation).await.expect("buffered invocation succeeds");
        assert_eq!(backend.calls(), 1);
        assert_eq!(render_chunks(&chunks), ANSWER);
    }

    #[tokio::test]
    async fn all_strategies_render_identical_text() {
        let backend = Arc::new(MockCompletionBackend::answering(ANSWER));
        let invoker = Invoker::single(backend.clone());

        let buffered = collect(invoker.invoke(&request(BackendKind::Primary, false)))
            .await
            .expect("buffered");
        let native = collect(invoker.invoke(&request(BackendKind::Primary, true)))
            .await
            .expect("native");
        let drained = collect(invoker.invoke(&request(BackendKind::Secondary, true)))
            .await
            .expect("drained");

        assert!(buffered.len() > 1);
        assert!(native.len() > 1);
        assert_eq!(render_chunks(&buffered), ANSWER);
        assert_eq!(render_chunks(&native), ANSWER);
        assert_eq!(render_chunks(&drained), ANSWER);
    }

    #[tokio::test]
    async fn state_machine_reaches_complete() {
        let backend = Arc::new(MockCompletionBackend::answering(ANSWER));
        let invoker = Invoker::single(backend);
        let mut invocation = invoker.invoke(&request(BackendKind::Primary, true));

        let first = invocation.next().await;
        assert!(matches!(first, Some(Ok(_))));
        assert_eq!(invocation.state(), InvocationState::Streaming);

        while invocation.next().await.is_some() {}
        assert_eq!(invocation.state(), InvocationState::Complete);
        assert!(invocation.is_terminated());
        assert!(invocation.next().await.is_none());
    }

    #[tokio::test]
    async fn buffered_invocation_drains_segments() {
        let backend = Arc::new(MockCompletionBackend::answering("a\nb"));
        let invoker = Invoker::single(backend);
        let mut invocation = invoker.invoke(&request(BackendKind::Secondary, false));
        assert!(matches!(invocation.next().await, Some(Ok(_))));
        assert_eq!(invocation.state(), InvocationState::Draining);
    }

    #[tokio::test]
    async fn throttling_event_without_data_fails_invocation() {
        let backend = Arc::new(MockCompletionBackend::answering(ANSWER).with_events(vec![
            ScriptedEvent::Error {
                name: "throttlingException".to_string(),
                message: "Too many requests".to_string(),
            },
        ]));
        let invoker = Invoker::single(backend);
        let mut invocation = invoker.invoke(&request(BackendKind::Secondary, true));

        let error = match invocation.next().await {
            Some(Err(error)) => error,
            other => panic!("expected failure, got {other:?}"),
        };
        assert_eq!(error.kind(), FailureKind::InvocationThrottled);
        assert_eq!(invocation.state(), InvocationState::Failed);
        assert!(invocation.next().await.is_none());
    }

    #[tokio::test]
    async fn end_without_data_is_empty_success() {
        let backend = Arc::new(
            MockCompletionBackend::answering(ANSWER).with_events(vec![ScriptedEvent::End]),
        );
        let invoker = Invoker::single(backend);
        let chunks = collect(invoker.invoke(&request(BackendKind::Secondary, true)))
            .await
            .expect("empty drain succeeds");
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn source_closing_without_end_is_internal_error() {
        let backend = Arc::new(MockCompletionBackend::answering(ANSWER).with_events(vec![
            ScriptedEvent::Data("partial".to_string()),
            ScriptedEvent::Hangup,
        ]));
        let invoker = Invoker::single(backend);
        let items: Vec<_> = invoker
            .invoke(&request(BackendKind::Secondary, true))
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok(chunk) if chunk.text == "partial"));
        assert!(matches!(
            &items[1],
            Err(error) if error.kind() == FailureKind::InvocationInternalError
        ));
    }

    #[tokio::test]
    async fn tiny_drain_queue_preserves_order() {
        let fragments: Vec<String> = (0..50).map(|index| format!("{index} ")).collect();
        let events = fragments
            .iter()
            .cloned()
            .map(ScriptedEvent::Data)
            .chain(std::iter::once(ScriptedEvent::End))
            .collect();
        let backend = Arc::new(MockCompletionBackend::answering("").with_events(events));
        let invoker = Invoker::single(backend).with_drain_capacity(1);

        let chunks = collect(invoker.invoke(&request(BackendKind::Secondary, true)))
            .await
            .expect("drain succeeds");
        assert_eq!(render_chunks(&chunks), fragments.concat());
    }

    #[tokio::test]
    async fn error_frame_mid_stream_stops_native_stream() {
        let backend = Arc::new(MockCompletionBackend::answering(ANSWER).with_frames(vec![
            codec::encode_frame("one"),
            codec::encode_error_frame("modelTimeoutException", "too slow"),
            codec::encode_frame("never"),
        ]));
        let invoker = Invoker::single(backend);
        let items: Vec<_> = invoker
            .invoke(&request(BackendKind::Primary, true))
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert!(matches!(
            &items[1],
            Err(error) if error.kind() == FailureKind::InvocationTimeout
        ));
    }

    #[tokio::test]
    async fn routes_by_backend_kind() {
        let primary = Arc::new(MockCompletionBackend::answering("from primary"));
        let secondary = Arc::new(MockCompletionBackend::answering("from secondary"));
        let invoker = Invoker::new(primary.clone(), secondary.clone());

        let chunks = collect(invoker.invoke(&request(BackendKind::Secondary, false)))
            .await
            .expect("secondary answers");
        assert_eq!(render_chunks(&chunks), "from secondary");
        assert_eq!(primary.calls(), 0);
        assert_eq!(secondary.calls(), 1);
        assert_eq!(
            secondary.prompts(),
            vec!["\n\nHuman: How fast? \n\nAssistant:".to_string()]
        );
    }
}
