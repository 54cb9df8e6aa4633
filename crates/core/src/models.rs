use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Separator placed between two [`ChunkBoundary::Segment`] chunks.
pub const SEGMENT_SEPARATOR: &str = "\n";

pub type EmbeddingVector = Vec<f32>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Primary,
    Secondary,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// One model call. Built once through the `with_*` methods and then only read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceRequest {
    model_id: String,
    prompt: String,
    max_tokens: u32,
    temperature: f32,
    streaming: bool,
    backend: BackendKind,
}

impl InferenceRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            max_tokens: 2_048,
            temperature: 0.2,
            streaming: true,
            backend: BackendKind::Primary,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn streaming(&self) -> bool {
        self.streaming
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }
}

/// How a chunk attaches to the one before it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkBoundary {
    /// Glued directly onto the previous chunk (streamed token fragments).
    Fragment,
    /// Separated from the previous chunk by [`SEGMENT_SEPARATOR`].
    Segment,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TextChunk {
    pub text: String,
    pub boundary: ChunkBoundary,
}

impl TextChunk {
    pub fn fragment(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            boundary: ChunkBoundary::Fragment,
        }
    }

    pub fn segment(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            boundary: ChunkBoundary::Segment,
        }
    }
}

/// Concatenates chunks the same way a relay emits them.
pub fn render_chunks<'a, I>(chunks: I) -> String
where
    I: IntoIterator<Item = &'a TextChunk>,
{
    let mut output = String::new();
    let mut started = false;
    for chunk in chunks {
        if started && chunk.boundary == ChunkBoundary::Segment {
            output.push_str(SEGMENT_SEPARATOR);
        }
        output.push_str(&chunk.text);
        started = true;
    }
    output
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentChunk {
    pub source_id: String,
    pub ordinal: u64,
    pub text: String,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub source_id: String,
    pub checksum: String,
    pub loaded_at: DateTime<Utc>,
    pub text: String,
}

/// Runtime options shared by ingestion, retrieval and invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub source_bucket: String,
    pub source_key: String,
    pub key_prefix: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub backend: BackendKind,
    pub streaming: bool,
    pub completion_model: String,
    pub embedding_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub drain_capacity: usize,
    pub scratch_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            source_bucket: String::new(),
            source_key: String::new(),
            key_prefix: "rag/".to_string(),
            chunk_size: 512,
            chunk_overlap: 0,
            top_k: 4,
            backend: BackendKind::Primary,
            streaming: true,
            completion_model: "anthropic.claude-v2".to_string(),
            embedding_model: "amazon.titan-embed-text-v1".to_string(),
            max_tokens: 2_048,
            temperature: 0.2,
            drain_capacity: 64,
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl RelayConfig {
    /// Request for a direct (non-retrieval) completion of `prompt`.
    pub fn completion_request(&self, prompt: impl Into<String>) -> InferenceRequest {
        InferenceRequest::new(self.completion_model.clone(), prompt)
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature)
            .with_streaming(self.streaming)
            .with_backend(self.backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("Primary".parse::<BackendKind>(), Ok(BackendKind::Primary));
        assert_eq!(" secondary ".parse::<BackendKind>(), Ok(BackendKind::Secondary));
        assert!("tertiary".parse::<BackendKind>().is_err());
    }

    #[test]
    fn render_separates_segments_but_glues_fragments() {
        let chunks = vec![
            TextChunk::segment("first"),
            TextChunk::segment(""),
            TextChunk::segment("second"),
            TextChunk::fragment(" tail"),
        ];
        assert_eq!(render_chunks(&chunks), "first\n\nsecond tail");
    }

    #[test]
    fn leading_segment_has_no_separator() {
        let chunks = vec![TextChunk::segment("only")];
        assert_eq!(render_chunks(&chunks), "only");
    }

    #[test]
    fn config_builds_completion_request() {
        let config = RelayConfig {
            backend: BackendKind::Secondary,
            streaming: false,
            max_tokens: 300,
            ..RelayConfig::default()
        };
        let request = config.completion_request("hi");
        assert_eq!(request.model_id(), "anthropic.claude-v2");
        assert_eq!(request.backend(), BackendKind::Secondary);
        assert!(!request.streaming());
        assert_eq!(request.max_tokens(), 300);
        assert_eq!(request.prompt(), "hi");
    }
}
