use serde::{Deserialize, Serialize};

use crate::providers::types::ModelInfo;

// --- Request types ---

#[derive(Debug, Serialize)]
pub struct OllamaChatRequest {
    pub model: String,
    pub messages: Vec<OllamaMessage>,
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OllamaMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct OllamaPullRequest {
    pub name: String,
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct OllamaDeleteRequest {
    pub name: String,
}

// --- Streaming types ---

/// Superset of the chat and pull line shapes; which fields are present
/// decides the record kind.
#[derive(Debug, Deserialize)]
pub struct OllamaStreamLine {
    pub message: Option<OllamaStreamMessage>,
    pub done: Option<bool>,
    pub status: Option<String>,
    pub digest: Option<String>,
    pub total: Option<u64>,
    pub completed: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaStreamMessage {
    #[allow(dead_code)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: String,
}

// --- Model list ---

#[derive(Debug, Deserialize)]
pub struct OllamaModelList {
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

// --- Error types ---

#[derive(Debug, Deserialize)]
pub struct OllamaErrorResponse {
    pub error: String,
}
