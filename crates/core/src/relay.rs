//! Response relay: forwards text chunks to a sink and terminates it once.

use crate::backend::InvocationStrategy;
use crate::models::{ChunkBoundary, TextChunk, SEGMENT_SEPARATOR};
use crate::{ChainError, Classify, Failure, InvocationError, RelayError};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Destination of relayed output. Implementations apply backpressure by
/// suspending inside `write`.
#[async_trait]
pub trait ResponseSink: Send {
    async fn write(&mut self, text: &str) -> Result<(), RelayError>;

    async fn end(&mut self) -> Result<(), RelayError>;

    async fn fail(&mut self, failure: &Failure) -> Result<(), RelayError>;
}

/// Writes each chunk to an async writer and flushes it immediately.
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ResponseSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, text: &str) -> Result<(), RelayError> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn end(&mut self) -> Result<(), RelayError> {
        self.writer.flush().await?;
        Ok(())
    }

    async fn fail(&mut self, failure: &Failure) -> Result<(), RelayError> {
        debug!(kind = %failure.kind, "writer sink failed");
        self.writer.flush().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Data(String),
    End,
    Failed(Failure),
}

/// Forwards relay events over a bounded channel.
pub struct ChannelSink {
    tx: mpsc::Sender<SinkEvent>,
}

pub fn channel(capacity: usize) -> (ChannelSink, mpsc::Receiver<SinkEvent>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx }, rx)
}

impl ChannelSink {
    async fn send(&self, event: SinkEvent) -> Result<(), RelayError> {
        self.tx.send(event).await.map_err(|_| RelayError::SinkClosed)
    }
}

#[async_trait]
impl ResponseSink for ChannelSink {
    async fn write(&mut self, text: &str) -> Result<(), RelayError> {
        self.send(SinkEvent::Data(text.to_string())).await
    }

    async fn end(&mut self) -> Result<(), RelayError> {
        self.send(SinkEvent::End).await
    }

    async fn fail(&mut self, failure: &Failure) -> Result<(), RelayError> {
        self.send(SinkEvent::Failed(failure.clone())).await
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemorySink {
    pub writes: Vec<String>,
    pub ends: usize,
    pub failures: Vec<Failure>,
}

impl MemorySink {
    pub fn output(&self) -> String {
        self.writes.concat()
    }
}

#[async_trait]
impl ResponseSink for MemorySink {
    async fn write(&mut self, text: &str) -> Result<(), RelayError> {
        self.writes.push(text.to_string());
        Ok(())
    }

    async fn end(&mut self) -> Result<(), RelayError> {
        self.ends += 1;
        Ok(())
    }

    async fn fail(&mut self, failure: &Failure) -> Result<(), RelayError> {
        self.failures.push(failure.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    #[default]
    Incremental,
    /// Output is held back and written once on termination.
    Buffered,
}

impl DeliveryMode {
    pub fn for_strategy(strategy: InvocationStrategy) -> Self {
        match strategy {
            InvocationStrategy::Buffered => Self::Buffered,
            InvocationStrategy::NativeStreaming | InvocationStrategy::ManualDrain => {
                Self::Incremental
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Open,
    Ended,
    Failed,
}

impl RelayState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Ended => "ended",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub chunks: usize,
    pub bytes: usize,
    pub mode: DeliveryMode,
}

/// Relays one response. Exactly one of [`end`](Self::end) and
/// [`fail`](Self::fail) succeeds; every later call is a
/// [`RelayError::TerminationViolation`].
///
/// Both modes render chunks identically: a [`ChunkBoundary::Segment`] after
/// the first chunk is preceded by [`SEGMENT_SEPARATOR`].
pub struct ResponseRelay<S> {
    sink: S,
    mode: DeliveryMode,
    state: RelayState,
    buffer: String,
    chunks: usize,
    bytes: usize,
}

impl<S: ResponseSink> ResponseRelay<S> {
    pub fn new(sink: S, mode: DeliveryMode) -> Self {
        Self {
            sink,
            mode,
            state: RelayState::Open,
            buffer: String::new(),
            chunks: 0,
            bytes: 0,
        }
    }

    pub fn incremental(sink: S) -> Self {
        Self::new(sink, DeliveryMode::Incremental)
    }

    pub fn buffered(sink: S) -> Self {
        Self::new(sink, DeliveryMode::Buffered)
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn summary(&self) -> RelaySummary {
        RelaySummary {
            chunks: self.chunks,
            bytes: self.bytes,
            mode: self.mode,
        }
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), RelayError> {
        match self.state {
            RelayState::Open => Ok(()),
            state => Err(RelayError::TerminationViolation {
                operation,
                state: state.as_str(),
            }),
        }
    }

    pub async fn write(&mut self, chunk: &TextChunk) -> Result<(), RelayError> {
        self.ensure_open("write")?;

        let mut piece = String::with_capacity(chunk.text.len() + SEGMENT_SEPARATOR.len());
        if self.chunks > 0 && chunk.boundary == ChunkBoundary::Segment {
            piece.push_str(SEGMENT_SEPARATOR);
        }
        piece.push_str(&chunk.text);
        self.chunks += 1;
        self.bytes += piece.len();

        match self.mode {
            DeliveryMode::Buffered => {
                self.buffer.push_str(&piece);
                Ok(())
            }
            DeliveryMode::Incremental if piece.is_empty() => Ok(()),
            DeliveryMode::Incremental => {
                if let Err(error) = self.sink.write(&piece).await {
                    self.abandon(&error).await;
                    return Err(error);
                }
                Ok(())
            }
        }
    }

    /// Writes `text` ahead of the response without counting it as a chunk,
    /// so the first chunk that follows renders the same in both modes.
    pub async fn preamble(&mut self, text: &str) -> Result<(), RelayError> {
        self.ensure_open("preamble")?;
        self.bytes += text.len();

        match self.mode {
            DeliveryMode::Buffered => {
                self.buffer.push_str(text);
                Ok(())
            }
            DeliveryMode::Incremental if text.is_empty() => Ok(()),
            DeliveryMode::Incremental => {
                if let Err(error) = self.sink.write(text).await {
                    self.abandon(&error).await;
                    return Err(error);
                }
                Ok(())
            }
        }
    }

    /// Writes out buffered output. A sink error abandons the relay, so the
    /// sink is still told the response failed.
    async fn flush_buffer(&mut self) -> Result<(), RelayError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let output = std::mem::take(&mut self.buffer);
        if let Err(error) = self.sink.write(&output).await {
            self.abandon(&error).await;
            return Err(error);
        }
        Ok(())
    }

    pub async fn end(&mut self) -> Result<(), RelayError> {
        self.ensure_open("end")?;
        self.flush_buffer().await?;
        self.state = RelayState::Ended;
        self.sink.end().await
    }

    /// Terminates with `failure`. Output already produced is not retracted;
    /// in buffered mode it is flushed before the sink is failed.
    pub async fn fail(&mut self, failure: &Failure) -> Result<(), RelayError> {
        self.ensure_open("fail")?;
        self.flush_buffer().await?;
        self.state = RelayState::Failed;
        self.sink.fail(failure).await
    }

    async fn abandon(&mut self, error: &RelayError) {
        self.state = RelayState::Failed;
        if let Err(sink_error) = self.sink.fail(&Failure::from(error)).await {
            debug!(error = %sink_error, "sink rejected failure after write error");
        }
    }

    /// Drains `chunks` into the relay and terminates it.
    pub async fn pump<St>(&mut self, mut chunks: St) -> Result<RelaySummary, ChainError>
    where
        St: Stream<Item = Result<TextChunk, InvocationError>> + Unpin + Send,
    {
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => self.write(&chunk).await?,
                Err(error) => {
                    warn!(kind = %error.kind(), error = %error, "relaying failure");
                    self.fail(&Failure::from(&error)).await?;
                    return Err(error.into());
                }
            }
        }

        self.end().await?;
        Ok(self.summary())
    }
}

/// Relays `messages` as newline-separated segments, pausing between writes
/// in incremental mode.
pub async fn replay<S: ResponseSink>(
    relay: &mut ResponseRelay<S>,
    messages: &[String],
    pause: Duration,
) -> Result<RelaySummary, RelayError> {
    for (position, message) in messages.iter().enumerate() {
        if position > 0 && relay.mode() == DeliveryMode::Incremental && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        relay.write(&TextChunk::segment(message.clone())).await?;
    }

    relay.end().await?;
    Ok(relay.summary())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockCompletionBackend;
    use crate::backend::Invoker;
    use crate::models::{render_chunks, BackendKind, InferenceRequest};
    use crate::FailureKind;
    use futures::stream;
    use std::sync::Arc;

    fn sample_chunks() -> Vec<TextChunk> {
        vec![
            TextChunk::segment("Lambda scales"),
            TextChunk::fragment(" quickly."),
            TextChunk::segment(""),
            TextChunk::segment("Second paragraph."),
        ]
    }

    #[tokio::test]
    async fn double_end_is_a_violation() {
        let mut relay = ResponseRelay::incremental(MemorySink::default());
        relay.end().await.expect("first end");

        let error = relay.end().await.expect_err("second end");
        assert_eq!(error.kind(), FailureKind::RelayTerminationViolation);
        assert_eq!(relay.sink().ends, 1);
    }

    #[tokio::test]
    async fn write_and_fail_after_end_are_rejected() {
        let mut relay = ResponseRelay::incremental(MemorySink::default());
        relay.end().await.expect("end");

        assert!(matches!(
            relay.write(&TextChunk::fragment("late")).await,
            Err(RelayError::TerminationViolation { operation: "write", .. })
        ));
        let failure = Failure::new(FailureKind::InvocationTimeout, "late");
        assert!(relay.fail(&failure).await.is_err());
        assert!(relay.sink().writes.is_empty());
        assert!(relay.sink().failures.is_empty());
    }

    #[tokio::test]
    async fn modes_produce_identical_output() {
        let chunks = sample_chunks();

        let mut incremental = ResponseRelay::incremental(MemorySink::default());
        let mut buffered = ResponseRelay::buffered(MemorySink::default());
        for chunk in &chunks {
            incremental.write(chunk).await.expect("write");
            buffered.write(chunk).await.expect("write");
        }
        incremental.end().await.expect("end");
        buffered.end().await.expect("end");

        let expected = render_chunks(&chunks);
        assert_eq!(incremental.sink().output(), expected);
        assert_eq!(buffered.sink().output(), expected);
        assert_eq!(buffered.sink().writes.len(), 1);
        assert!(incremental.sink().writes.len() > 1);
        assert_eq!(incremental.summary().bytes, expected.len());
    }

    #[tokio::test]
    async fn buffered_failure_flushes_partial_output() {
        let mut relay = ResponseRelay::buffered(MemorySink::default());
        relay.write(&TextChunk::segment("partial")).await.expect("write");
        relay
            .fail(&Failure::new(FailureKind::InvocationInternalError, "boom"))
            .await
            .expect("fail");

        assert_eq!(relay.state(), RelayState::Failed);
        assert_eq!(relay.sink().output(), "partial");
        assert_eq!(relay.sink().failures.len(), 1);
        assert_eq!(relay.sink().ends, 0);
    }

    /// Accepts termination calls but rejects every write.
    #[derive(Default)]
    struct BrokenSink {
        ends: usize,
        failures: Vec<Failure>,
    }

    #[async_trait]
    impl ResponseSink for BrokenSink {
        async fn write(&mut self, _text: &str) -> Result<(), RelayError> {
            Err(RelayError::SinkClosed)
        }

        async fn end(&mut self) -> Result<(), RelayError> {
            self.ends += 1;
            Ok(())
        }

        async fn fail(&mut self, failure: &Failure) -> Result<(), RelayError> {
            self.failures.push(failure.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn buffered_end_with_broken_sink_still_terminates() {
        let mut relay = ResponseRelay::buffered(BrokenSink::default());
        relay.write(&TextChunk::segment("held")).await.expect("buffered write");

        let error = relay.end().await.expect_err("flush fails");
        assert!(matches!(error, RelayError::SinkClosed));
        assert_eq!(relay.state(), RelayState::Failed);
        assert_eq!(relay.sink().ends, 0);
        assert_eq!(relay.sink().failures.len(), 1);
        assert!(relay.end().await.is_err());
        assert_eq!(relay.sink().failures.len(), 1);
    }

    #[tokio::test]
    async fn buffered_fail_with_broken_sink_still_terminates() {
        let mut relay = ResponseRelay::buffered(BrokenSink::default());
        relay.write(&TextChunk::segment("held")).await.expect("buffered write");

        let failure = Failure::new(FailureKind::InvocationTimeout, "slow");
        assert!(relay.fail(&failure).await.is_err());
        assert_eq!(relay.state(), RelayState::Failed);
        assert_eq!(relay.sink().failures.len(), 1);
        assert!(relay.fail(&failure).await.is_err());
        assert_eq!(relay.sink().failures.len(), 1);
    }

    #[tokio::test]
    async fn preamble_does_not_depend_on_delivery_mode() {
        let backend = Arc::new(MockCompletionBackend::answering("Lambda scales.\n\nFast."));
        let invoker = Invoker::single(backend);

        let mut outputs = Vec::new();
        for streaming in [true, false] {
            let request =
                InferenceRequest::new("anthropic.claude-v2", "hi").with_streaming(streaming);
            let mode = DeliveryMode::for_strategy(InvocationStrategy::for_request(&request));
            let mut relay = ResponseRelay::new(MemorySink::default(), mode);
            relay.preamble("hi\n").await.expect("preamble");
            let summary = relay.pump(invoker.invoke(&request)).await.expect("pump");
            assert_eq!(summary.mode, mode);
            outputs.push(relay.into_sink().output());
        }

        assert_eq!(outputs[0], "hi\nLambda scales.\n\nFast.");
        assert_eq!(outputs[1], outputs[0]);
    }

    #[tokio::test]
    async fn pump_ends_once_on_success() {
        let mut relay = ResponseRelay::incremental(MemorySink::default());
        let summary = relay
            .pump(stream::iter(sample_chunks().into_iter().map(Ok)))
            .await
            .expect("pump succeeds");

        assert_eq!(summary.chunks, 4);
        assert_eq!(relay.state(), RelayState::Ended);
        assert_eq!(relay.sink().ends, 1);
        assert!(relay.sink().failures.is_empty());
    }

    #[tokio::test]
    async fn throttled_drain_fails_relay_without_data() {
        let backend = Arc::new(MockCompletionBackend::failing(
            "throttlingException",
            "Too many requests",
        ));
        let invoker = Invoker::single(backend);
        let request = InferenceRequest::new("anthropic.claude-v2", "hi")
            .with_backend(BackendKind::Secondary)
            .with_streaming(true);

        let mut relay = ResponseRelay::incremental(MemorySink::default());
        let error = relay
            .pump(invoker.invoke(&request))
            .await
            .expect_err("throttled");

        assert_eq!(error.kind(), FailureKind::InvocationThrottled);
        let sink = relay.into_sink();
        assert!(sink.writes.is_empty());
        assert_eq!(sink.ends, 0);
        assert_eq!(sink.failures.len(), 1);
        assert_eq!(sink.failures[0].kind, FailureKind::InvocationThrottled);
    }

    #[tokio::test]
    async fn channel_sink_preserves_order() {
        let (sink, mut rx) = channel(1);
        let producer = tokio::spawn(async move {
            let mut relay = ResponseRelay::incremental(sink);
            relay
                .pump(stream::iter(
                    vec![
                        Ok(TextChunk::fragment("a")),
                        Ok(TextChunk::fragment("b")),
                        Ok(TextChunk::segment("c")),
                    ]
                    .into_iter(),
                ))
                .await
                .map(|summary| summary.chunks)
                .map_err(|error| error.to_string())
        });

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![
                SinkEvent::Data("a".to_string()),
                SinkEvent::Data("b".to_string()),
                SinkEvent::Data("\nc".to_string()),
                SinkEvent::End,
            ]
        );
        assert_eq!(producer.await.expect("producer joins"), Ok(3));
    }

    #[tokio::test]
    async fn closed_channel_fails_the_relay() {
        let (sink, rx) = channel(1);
        drop(rx);
        let mut relay = ResponseRelay::incremental(sink);

        let error = relay
            .write(&TextChunk::fragment("nobody listens"))
            .await
            .expect_err("receiver dropped");
        assert!(matches!(error, RelayError::SinkClosed));
        assert_eq!(relay.state(), RelayState::Failed);
        assert!(relay.end().await.is_err());
    }

    #[tokio::test]
    async fn writer_sink_streams_bytes() {
        let mut relay = ResponseRelay::incremental(WriterSink::new(Vec::new()));
        replay(
            &mut relay,
            &["hello".to_string(), "world".to_string()],
            Duration::ZERO,
        )
        .await
        .expect("replay");

        assert_eq!(relay.into_sink().into_inner(), b"hello\nworld".to_vec());
    }

    #[tokio::test]
    async fn replay_modes_match() {
        let messages = vec!["one".to_string(), "two".to_string(), "three".to_string()];

        let mut looped = ResponseRelay::incremental(MemorySink::default());
        replay(&mut looped, &messages, Duration::from_millis(1))
            .await
            .expect("loop");
        let mut piped = ResponseRelay::buffered(MemorySink::default());
        replay(&mut piped, &messages, Duration::from_millis(1))
            .await
            .expect("pipeline");

        assert_eq!(looped.sink().output(), "one\ntwo\nthree");
        assert_eq!(piped.sink().output(), looped.sink().output());
        assert_eq!(looped.sink().writes.len(), 3);
        assert_eq!(piped.sink().writes.len(), 1);
    }
}
