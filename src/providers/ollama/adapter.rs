use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::models::*;
use super::stream::{pump_records, PumpEnd};
use crate::config::CONNECTION_TIMEOUT;
use crate::models::{ChatMessage, Settings};
use crate::providers::traits::ChatBackend;
use crate::providers::types::{
    ChatRequest, ModelInfo, PullEvent, StreamEvent, StreamRecord, TransportError,
};

pub struct OllamaClient {
    client: Client,
    base_url: Url,
}

impl OllamaClient {
    pub fn new(settings: &Settings) -> Result<Self, TransportError> {
        let base_url = settings
            .base_url()
            .map_err(|e| TransportError::InvalidUrl(format!("{}:{}: {}", settings.host, settings.port, e)))?;
        Ok(Self::with_base_url(base_url))
    }

    pub fn with_base_url(base_url: Url) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::InvalidUrl(e.to_string()))
    }

    /// Attachments travel as a description line, never as payload.
    fn build_messages(messages: &[ChatMessage]) -> Vec<OllamaMessage> {
        messages
            .iter()
            .map(|msg| {
                let content = if msg.attachments.is_empty() {
                    msg.content.clone()
                } else {
                    let files = msg
                        .attachments
                        .iter()
                        .map(|a| a.describe())
                        .collect::<Vec<_>>()
                        .join("\n");
                    format!("{}\n\n{}", msg.content, files)
                };
                OllamaMessage {
                    role: msg.role.as_str().to_string(),
                    content,
                }
            })
            .collect()
    }

    async fn status_error(response: Response) -> TransportError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<OllamaErrorResponse>(&body)
            .map(|parsed| parsed.error)
            .unwrap_or_else(|_| {
                status
                    .canonical_reason()
                    .unwrap_or("Request failed")
                    .to_string()
            });
        TransportError::Status {
            status: status.as_u16(),
            message,
        }
    }

    /// Send the request head, giving up early if `cancel` fires.
    /// `Ok(None)` means cancelled before a response arrived.
    async fn send_cancellable(
        req: RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Option<Response>, TransportError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            result = req.send() => result.map_err(|e| TransportError::Network(e.to_string()))?,
        };

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(Some(response))
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let url = self.endpoint("api/chat")?;
        let body = OllamaChatRequest {
            model: request.model,
            messages: Self::build_messages(&request.messages),
            stream: true,
        };

        let req = self.client.post(url).json(&body);
        let Some(response) = Self::send_cancellable(req, &cancel).await? else {
            let _ = tx.send(StreamEvent::Aborted).await;
            return Ok(());
        };

        if tx.send(StreamEvent::Started).await.is_err() {
            return Ok(());
        }

        let end = pump_records(response.bytes_stream(), &tx, &cancel, |record| match record {
            StreamRecord::ContentDelta { text } => Some(StreamEvent::Delta(text)),
            _ => None,
        })
        .await;

        let terminal = match end {
            PumpEnd::Finished => StreamEvent::Done,
            PumpEnd::Aborted => {
                tracing::info!("Chat stream cancelled");
                StreamEvent::Aborted
            }
            PumpEnd::Failed(e) => StreamEvent::Error(e),
            PumpEnd::Closed => return Ok(()),
        };
        let _ = tx.send(terminal).await;
        Ok(())
    }

    async fn pull_model(
        &self,
        name: &str,
        tx: mpsc::Sender<PullEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let url = self.endpoint("api/pull")?;
        let body = OllamaPullRequest {
            name: name.to_string(),
            stream: true,
        };

        let req = self.client.post(url).json(&body);
        let Some(response) = Self::send_cancellable(req, &cancel).await? else {
            let _ = tx.send(PullEvent::Aborted).await;
            return Ok(());
        };

        let end = pump_records(response.bytes_stream(), &tx, &cancel, |record| match record {
            StreamRecord::PullProgress(progress) => Some(PullEvent::Progress(progress)),
            _ => None,
        })
        .await;

        let terminal = match end {
            PumpEnd::Finished => PullEvent::Done,
            PumpEnd::Aborted => PullEvent::Aborted,
            PumpEnd::Failed(e) => PullEvent::Error(e),
            PumpEnd::Closed => return Ok(()),
        };
        let _ = tx.send(terminal).await;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, TransportError> {
        let url = self.endpoint("api/tags")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let list: OllamaModelList = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(format!("Failed to parse model list: {}", e)))?;
        Ok(list.models)
    }

    async fn delete_model(&self, name: &str) -> Result<(), TransportError> {
        let url = self.endpoint("api/delete")?;
        let response = self
            .client
            .delete(url)
            .json(&OllamaDeleteRequest {
                name: name.to_string(),
            })
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(())
    }

    async fn check_connection(&self) -> bool {
        let Ok(url) = self.endpoint("api/tags") else {
            return false;
        };
        match self.client.get(url).timeout(CONNECTION_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Connection check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Attachment;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ndjson(lines: &[serde_json::Value]) -> String {
        lines.iter().map(|l| format!("{}\n", l)).collect()
    }

    async fn client_for(server: &MockServer) -> OllamaClient {
        OllamaClient::with_base_url(Url::parse(&server.uri()).unwrap())
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_stream_chat_yields_deltas() {
        let server = MockServer::start().await;
        let body = ndjson(&[
            serde_json::json!({"message": {"role": "assistant", "content": "Hel"}, "done": false}),
            serde_json::json!({"message": {"role": "assistant", "content": "lo"}, "done": false}),
            serde_json::json!({"message": {"role": "assistant", "content": ""}, "done": true}),
        ]);
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"model": "llama3.2", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let (tx, rx) = mpsc::channel(64);
        let request = ChatRequest {
            model: "llama3.2".to_string(),
            messages: vec![ChatMessage::user("hi", Vec::new())],
        };
        client
            .stream_chat(request, tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            drain(rx).await,
            vec![
                StreamEvent::Started,
                StreamEvent::Delta("Hel".to_string()),
                StreamEvent::Delta("lo".to_string()),
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_chat_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({"error": "model 'nope' not found"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let (tx, rx) = mpsc::channel(64);
        let request = ChatRequest {
            model: "nope".to_string(),
            messages: Vec::new(),
        };
        let err = client
            .stream_chat(request, tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TransportError::Status {
                status: 404,
                message: "model 'nope' not found".to_string()
            }
        );
        assert!(drain(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_chat_cancelled_before_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(30)))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = ChatRequest {
            model: "llama3.2".to_string(),
            messages: Vec::new(),
        };
        client.stream_chat(request, tx, cancel).await.unwrap();

        assert_eq!(drain(rx).await, vec![StreamEvent::Aborted]);
    }

    #[tokio::test]
    async fn test_stream_chat_cancelled_mid_body() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        // Sends one chunked line, then keeps the connection open without ending the body.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await.unwrap();
            let line = format!(
                "{}\n",
                serde_json::json!({"message": {"role": "assistant", "content": "Hel"}, "done": false})
            );
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                line.len(),
                line
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            drop(socket);
        });

        let client = OllamaClient::with_base_url(Url::parse(&format!("http://{}", addr)).unwrap());
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let request = ChatRequest {
            model: "llama3.2".to_string(),
            messages: vec![ChatMessage::user("Say hello", Vec::new())],
        };
        let transport = {
            let cancel = cancel.clone();
            tokio::spawn(async move { client.stream_chat(request, tx, cancel).await })
        };

        assert_eq!(rx.recv().await, Some(StreamEvent::Started));
        assert_eq!(rx.recv().await, Some(StreamEvent::Delta("Hel".to_string())));
        cancel.cancel();

        assert_eq!(drain(rx).await, vec![StreamEvent::Aborted]);
        transport.await.unwrap().unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_pull_model_progress() {
        let server = MockServer::start().await;
        let body = ndjson(&[
            serde_json::json!({"status": "pulling manifest"}),
            serde_json::json!({"status": "downloading", "digest": "sha256:abc", "total": 200, "completed": 50}),
            serde_json::json!({"status": "success"}),
        ]);
        Mock::given(method("POST"))
            .and(path("/api/pull"))
            .and(body_partial_json(serde_json::json!({"name": "llama3.2", "stream": true})))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let (tx, mut rx) = mpsc::channel(64);
        client
            .pull_model("llama3.2", tx, CancellationToken::new())
            .await
            .unwrap();

        let mut statuses = Vec::new();
        let mut terminal = None;
        while let Some(event) = rx.recv().await {
            match event {
                PullEvent::Progress(p) => statuses.push(p.status),
                other => terminal = Some(other),
            }
        }
        assert_eq!(statuses, vec!["pulling manifest", "downloading", "success"]);
        assert_eq!(terminal, Some(PullEvent::Done));
    }

    #[tokio::test]
    async fn test_list_and_delete_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "models": [{
                    "name": "llama3.2:latest",
                    "size": 2019393189u64,
                    "digest": "a80c4f17acd5",
                    "modified_at": "2024-10-01T10:00:00Z",
                    "details": {"family": "llama", "parameter_size": "3.2B"}
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/delete"))
            .and(body_partial_json(serde_json::json!({"name": "llama3.2:latest"})))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let models = client.list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "llama3.2:latest");
        assert_eq!(
            models[0].details.as_ref().and_then(|d| d.family.as_deref()),
            Some("llama")
        );

        client.delete_model("llama3.2:latest").await.unwrap();
        assert!(client.check_connection().await);
    }

    #[test]
    fn test_build_messages_describes_attachments() {
        let attachment = Attachment {
            id: "a1".to_string(),
            name: "notes.txt".to_string(),
            mime_type: "text/plain".to_string(),
            size_bytes: 2048,
            content: Some("aGVsbG8=".to_string()),
        };
        let messages = OllamaClient::build_messages(&[ChatMessage::user(
            "summarize",
            vec![attachment],
        )]);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, "summarize\n\n[File: notes.txt (text/plain, 2 KB)]");
    }
}
