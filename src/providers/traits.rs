use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{ChatRequest, ModelInfo, PullEvent, StreamEvent, TransportError};

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Stream a chat reply into `tx`.
    ///
    /// Failures before the body opens are returned; once `Started` has been
    /// sent, the sequence always ends with `Done`, `Aborted` or `Error`.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;

    async fn pull_model(
        &self,
        name: &str,
        tx: mpsc::Sender<PullEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError>;

    async fn delete_model(&self, name: &str) -> Result<(), TransportError>;

    async fn check_connection(&self) -> bool;
}
