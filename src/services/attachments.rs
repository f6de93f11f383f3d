use std::path::Path;

use base64::Engine;
use thiserror::Error;

use crate::models::Attachment;

pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

const ACCEPTED_TYPES: &[&str] = &[
    "image/*",
    "text/*",
    "application/pdf",
    "application/json",
    "application/xml",
];

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("File size exceeds {}MB limit", MAX_ATTACHMENT_BYTES / (1024 * 1024))]
    TooLarge { size: u64 },

    #[error("File type not supported: {0}")]
    UnsupportedType(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("txt") | Some("log") => "text/plain",
        Some("md") | Some("markdown") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        Some("rs") | Some("py") | Some("js") | Some("ts") | Some("toml") | Some("yaml")
        | Some("yml") => "text/plain",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        _ => "application/octet-stream",
    }
}

fn is_accepted(mime_type: &str) -> bool {
    ACCEPTED_TYPES.iter().any(|accepted| match accepted.strip_suffix('*') {
        Some(prefix) => mime_type.starts_with(prefix),
        None => mime_type == *accepted,
    })
}

/// Read a file into an attachment with a base64 payload.
pub fn attachment_from_path(path: &Path) -> Result<Attachment, AttachmentError> {
    let io_error = |source| AttachmentError::Io {
        path: path.display().to_string(),
        source,
    };

    let size = std::fs::metadata(path).map_err(io_error)?.len();
    if size > MAX_ATTACHMENT_BYTES {
        return Err(AttachmentError::TooLarge { size });
    }

    let mime_type = mime_for(path);
    if !is_accepted(mime_type) {
        return Err(AttachmentError::UnsupportedType(mime_type.to_string()));
    }

    let data = std::fs::read(path).map_err(io_error)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("attachment")
        .to_string();

    tracing::debug!("Attached {} ({}, {} bytes)", name, mime_type, data.len());
    Ok(Attachment {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        mime_type: mime_type.to_string(),
        size_bytes: data.len() as u64,
        content: Some(base64::engine::general_purpose::STANDARD.encode(&data)),
    })
}
