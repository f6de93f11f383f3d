use serde::{Deserialize, Serialize};

/// A file carried alongside a message. The payload is never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>, // base64
}

impl Attachment {
    /// One-line description appended to outbound prompts in place of the payload.
    pub fn describe(&self) -> String {
        let kb = (self.size_bytes as f64 / 1024.0).round() as u64;
        format!("[File: {} ({}, {} KB)]", self.name, self.mime_type, kb)
    }
}
