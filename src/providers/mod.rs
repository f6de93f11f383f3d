pub mod ollama;
pub mod traits;
pub mod types;

pub use ollama::OllamaClient;
pub use traits::ChatBackend;
pub use types::{ChatRequest, ModelInfo, PullEvent, PullProgress, StreamEvent, TransportError};
