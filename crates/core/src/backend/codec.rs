use crate::models::{TextChunk, SEGMENT_SEPARATOR};
use crate::InvocationError;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CompletionBody {
    completion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop_reason: Option<String>,
}

/// Reads the `completion` field of a single-shot response body.
pub fn decode_completion(body: &[u8]) -> Result<String, InvocationError> {
    let parsed: CompletionBody = serde_json::from_slice(body)?;
    Ok(parsed.completion)
}

pub fn encode_completion(completion: &str) -> Vec<u8> {
    json!({ "completion": completion }).to_string().into_bytes()
}

/// Splits a buffered completion into segments. Joining the segments with
/// [`SEGMENT_SEPARATOR`] restores the completion exactly.
pub fn segment_completion(completion: &str) -> Vec<TextChunk> {
    completion
        .split(SEGMENT_SEPARATOR)
        .map(TextChunk::segment)
        .collect()
}

/// Returns `(name, message)` when the frame is a named error event.
pub fn named_error(frame: &[u8]) -> Option<(String, String)> {
    let value: Value = serde_json::from_slice(frame).ok()?;
    let object = value.as_object()?;
    object.iter().find_map(|(name, body)| {
        if !name.ends_with("Exception") {
            return None;
        }
        let message = body
            .pointer("/message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some((name.clone(), message))
    })
}

/// Decodes one stream frame: `{"chunk":{"bytes":"<base64 completion JSON>"}}`.
///
/// Blank lines and empty completions yield `None`; named error frames are
/// returned as the matching [`InvocationError`].
pub fn decode_frame(frame: &[u8]) -> Result<Option<TextChunk>, InvocationError> {
    if frame.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    if let Some((name, message)) = named_error(frame) {
        return Err(InvocationError::from_event(&name, message));
    }

    let value: Value = serde_json::from_slice(frame)?;
    let encoded = value
        .pointer("/chunk/bytes")
        .and_then(Value::as_str)
        .ok_or_else(|| InvocationError::Decode(format!("frame has no chunk bytes: {value}")))?;

    let decoded = STANDARD.decode(encoded)?;
    let completion = decode_completion(&decoded)?;
    if completion.is_empty() {
        return Ok(None);
    }

    Ok(Some(TextChunk::fragment(completion)))
}

pub fn encode_frame(fragment: &str) -> Vec<u8> {
    let bytes = STANDARD.encode(encode_completion(fragment));
    json!({ "chunk": { "bytes": bytes } }).to_string().into_bytes()
}

pub fn encode_error_frame(name: &str, message: &str) -> Vec<u8> {
    let mut event = serde_json::Map::new();
    event.insert(name.to_string(), json!({ "message": message }));
    Value::Object(event).to_string().into_bytes()
}
