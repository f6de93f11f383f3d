use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::ChatMessage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Invalid server address: {0}")]
    InvalidUrl(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Progress line from `/api/pull`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullProgress {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

/// One decoded line of an NDJSON response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    ContentDelta { text: String },
    PullProgress(PullProgress),
    Done,
    Malformed,
    /// `{"error": "..."}` sent by the server after the body opened.
    ServerError(String),
}

/// What a chat transport task sends to its consumer, in arrival order.
/// Exactly one of `Done`, `Aborted` or `Error` ends the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Success status received, the body is open.
    Started,
    Delta(String),
    Done,
    Aborted,
    Error(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullEvent {
    Progress(PullProgress),
    Done,
    Aborted,
    Error(TransportError),
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub modified_at: String,
    #[serde(default)]
    pub details: Option<ModelDetails>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub parameter_size: Option<String>,
    #[serde(default)]
    pub quantization_level: Option<String>,
}
