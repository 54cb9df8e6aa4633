use super::{codec, CompletionPayload, EventListener, FrameStream};
use crate::traits::CompletionBackend;
use crate::InvocationError;
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use reqwest::{Client, Response};
use tracing::debug;
use url::Url;

/// Completion service reached over HTTP.
///
/// `POST {endpoint}/model/{model_id}/invoke` returns `{"completion": ...}`;
/// `POST {endpoint}/model/{model_id}/invoke-with-response-stream` returns
/// newline-delimited frames.
#[derive(Clone)]
pub struct HttpCompletionBackend {
    name: String,
    endpoint: Url,
    client: Client,
}

impl HttpCompletionBackend {
    pub fn new(name: impl Into<String>, endpoint: &str) -> Result<Self, InvocationError> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        Ok(Self {
            name: name.into(),
            endpoint,
            client: Client::new(),
        })
    }

    fn model_url(&self, model_id: &str, action: &str) -> Result<Url, InvocationError> {
        Ok(self.endpoint.join(&format!("model/{model_id}/{action}"))?)
    }

    async fn post(&self, payload: &CompletionPayload, action: &str) -> Result<Response, InvocationError> {
        let url = self.model_url(&payload.model_id, action)?;
        debug!(backend = %self.name, %url, "posting completion request");

        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("accept", "*/*")
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvocationError::from_status(status.as_u16(), body));
        }

        Ok(response)
    }

    async fn open_frames(&self, payload: &CompletionPayload) -> Result<FrameStream, InvocationError> {
        let response = self.post(payload, "invoke-with-response-stream").await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(InvocationError::from))
            .boxed();
        Ok(split_lines(bytes).boxed())
    }
}

struct LineState<S> {
    bytes: S,
    buffer: Vec<u8>,
    exhausted: bool,
}

/// Re-frames an arbitrary byte stream into newline-terminated frames.
fn split_lines<S>(bytes: S) -> impl Stream<Item = Result<Vec<u8>, InvocationError>>
where
    S: Stream<Item = Result<Vec<u8>, InvocationError>> + Unpin,
{
    let state = LineState {
        bytes,
        buffer: Vec::new(),
        exhausted: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(position) = state.buffer.iter().position(|byte| *byte == b'\n') {
                let mut line: Vec<u8> = state.buffer.drain(..=position).collect();
                line.pop();
                return Some((Ok(line), state));
            }

            if state.exhausted {
                if state.buffer.is_empty() {
                    return None;
                }
                let rest = std::mem::take(&mut state.buffer);
                return Some((Ok(rest), state));
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => state.buffer.extend_from_slice(&bytes),
                Some(Err(error)) => {
                    state.exhausted = true;
                    state.buffer.clear();
                    return Some((Err(error), state));
                }
                None => state.exhausted = true,
            }
        }
    })
}

#[async_trait]
impl CompletionBackend for HttpCompletionBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, payload: &CompletionPayload) -> Result<Vec<u8>, InvocationError> {
        let response = self.post(payload, "invoke").await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn invoke_stream(
        &self,
        payload: &CompletionPayload,
    ) -> Result<FrameStream, InvocationError> {
        self.open_frames(payload).await
    }

    fn subscribe(&self, payload: CompletionPayload, listener: EventListener) {
        let backend = self.clone();
        tokio::spawn(async move {
            let mut frames = match backend.open_frames(&payload).await {
                Ok(frames) => frames,
                Err(error) => return listener.fail(error).await,
            };

            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(frame) => {
                        if let Some((name, message)) = codec::named_error(&frame) {
                            return listener.error(&name, &message).await;
                        }
                        if !listener.data(frame).await {
                            debug!(backend = %backend.name, "drain consumer went away");
                            return;
                        }
                    }
                    Err(error) => return listener.fail(error).await,
                }
            }

            listener.end().await;
        });
    }
}
