use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure classes reported to callers and to response sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    SourceUnavailable,
    ParseFailure,
    EmbeddingBackendFailure,
    InvocationThrottled,
    InvocationTimeout,
    InvocationValidationError,
    InvocationInternalError,
    RelayTerminationViolation,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SourceUnavailable => "SourceUnavailable",
            Self::ParseFailure => "ParseFailure",
            Self::EmbeddingBackendFailure => "EmbeddingBackendFailure",
            Self::InvocationThrottled => "InvocationThrottled",
            Self::InvocationTimeout => "InvocationTimeout",
            Self::InvocationValidationError => "InvocationValidationError",
            Self::InvocationInternalError => "InvocationInternalError",
            Self::RelayTerminationViolation => "RelayTerminationViolation",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps an error onto its [`FailureKind`].
pub trait Classify {
    fn kind(&self) -> FailureKind;
}

/// Terminal failure handed to a response sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl<E> From<&E> for Failure
where
    E: Classify + fmt::Display,
{
    fn from(error: &E) -> Self {
        Failure::new(error.kind(), error.to_string())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("source unavailable: {bucket}/{key}")]
    SourceUnavailable { bucket: String, key: String },

    #[error("document parse error: {0}")]
    ParseFailure(String),

    #[error("storage backend returned {status} for {bucket}/{key}")]
    Storage {
        bucket: String,
        key: String,
        status: u16,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Classify for IngestError {
    fn kind(&self) -> FailureKind {
        match self {
            Self::ParseFailure(_) | Self::InvalidChunkConfig(_) | Self::InvalidArgument(_) => {
                FailureKind::ParseFailure
            }
            Self::SourceUnavailable { .. }
            | Self::Storage { .. }
            | Self::Io(_)
            | Self::Http(_)
            | Self::Url(_) => FailureKind::SourceUnavailable,
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding backend {backend} failed: {details}")]
    Backend { backend: String, details: String },

    #[error("embedding dimension {found} != {expected}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("embedding count {embeddings} doesn't match chunk count {chunks}")]
    CountMismatch { chunks: usize, embeddings: usize },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Classify for EmbeddingError {
    fn kind(&self) -> FailureKind {
        FailureKind::EmbeddingBackendFailure
    }
}

#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("invocation throttled: {0}")]
    Throttled(String),

    #[error("invocation timed out: {0}")]
    Timeout(String),

    #[error("invocation rejected: {0}")]
    Validation(String),

    #[error("backend internal error: {0}")]
    Internal(String),

    #[error("model stream error: {0}")]
    ModelStream(String),

    #[error("frame decode error: {0}")]
    Decode(String),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl InvocationError {
    /// Translates a named backend error event. Unknown names are internal errors.
    pub fn from_event(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            "throttlingException" => Self::Throttled(message),
            "modelTimeoutException" => Self::Timeout(message),
            "validationException" => Self::Validation(message),
            "internalServerException" => Self::Internal(message),
            "modelStreamErrorException" => Self::ModelStream(message),
            other => Self::Internal(format!("{other}: {message}")),
        }
    }

    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => Self::Throttled(body),
            408 | 504 => Self::Timeout(body),
            400 | 404 | 413 | 422 => Self::Validation(body),
            _ => Self::Internal(format!("status {status}: {body}")),
        }
    }
}

impl Classify for InvocationError {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Throttled(_) => FailureKind::InvocationThrottled,
            Self::Timeout(_) => FailureKind::InvocationTimeout,
            Self::Validation(_) | Self::Url(_) => FailureKind::InvocationValidationError,
            Self::Http(error) if error.is_timeout() => FailureKind::InvocationTimeout,
            Self::Internal(_)
            | Self::ModelStream(_)
            | Self::Decode(_)
            | Self::BackendResponse { .. }
            | Self::Http(_)
            | Self::Serialization(_)
            | Self::Base64(_) => FailureKind::InvocationInternalError,
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay already {state}; {operation} rejected")]
    TerminationViolation {
        operation: &'static str,
        state: &'static str,
    },

    #[error("response sink closed")]
    SinkClosed,

    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for RelayError {
    fn kind(&self) -> FailureKind {
        match self {
            Self::TerminationViolation { .. } => FailureKind::RelayTerminationViolation,
            Self::SinkClosed | Self::Io(_) => FailureKind::InvocationInternalError,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl Classify for ChainError {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Ingest(error) => error.kind(),
            Self::Embedding(error) => error.kind(),
            Self::Invocation(error) => error.kind(),
            Self::Relay(error) => error.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_events_map_to_taxonomy() {
        let cases = [
            ("throttlingException", FailureKind::InvocationThrottled),
            ("modelTimeoutException", FailureKind::InvocationTimeout),
            ("validationException", FailureKind::InvocationValidationError),
            ("internalServerException", FailureKind::InvocationInternalError),
            ("modelStreamErrorException", FailureKind::InvocationInternalError),
            ("somethingElse", FailureKind::InvocationInternalError),
        ];

        for (name, expected) in cases {
            assert_eq!(InvocationError::from_event(name, "boom").kind(), expected, "{name}");
        }
    }

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert_eq!(
            InvocationError::from_status(429, "slow down").kind(),
            FailureKind::InvocationThrottled
        );
        assert_eq!(
            InvocationError::from_status(504, "").kind(),
            FailureKind::InvocationTimeout
        );
        assert_eq!(
            InvocationError::from_status(400, "bad prompt").kind(),
            FailureKind::InvocationValidationError
        );
        assert_eq!(
            InvocationError::from_status(500, "").kind(),
            FailureKind::InvocationInternalError
        );
    }

    #[test]
    fn failure_carries_kind_and_message() {
        let error = InvocationError::Throttled("rate exceeded".to_string());
        let failure = Failure::from(&error);
        assert_eq!(failure.kind, FailureKind::InvocationThrottled);
        assert!(failure.message.contains("rate exceeded"));
    }

    #[test]
    fn chain_error_delegates_kind() {
        let error = ChainError::from(IngestError::SourceUnavailable {
            bucket: "b".to_string(),
            key: "k".to_string(),
        });
        assert_eq!(error.kind(), FailureKind::SourceUnavailable);
    }
}
