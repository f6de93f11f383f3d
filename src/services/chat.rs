use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{Attachment, ChatMessage};
use crate::providers::{ChatBackend, ChatRequest, StreamEvent, TransportError};
use crate::services::assembler::{AssemblerStep, StreamAssembler, StreamOutcome};
use crate::services::conversation::{lock_store, ConversationUpdate, SharedStore};
use crate::services::persistence::{HistorySnapshot, Persistence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Requesting,
    Streaming,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("A reply is already streaming in conversation {0}")]
    AlreadyStreaming(String),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),
}

/// Progress of a `send_message` call, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Snapshot {
        conversation_id: String,
        message: ChatMessage,
    },
    Finished {
        conversation_id: String,
        outcome: StreamOutcome,
    },
}

struct ActiveStream {
    phase: StreamPhase,
    cancel: CancellationToken,
}

type StreamTable = Arc<Mutex<HashMap<String, ActiveStream>>>;

fn lock_streams(streams: &StreamTable) -> MutexGuard<'_, HashMap<String, ActiveStream>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A conversation claimed for one chat turn. Dropping it, whichever way the
/// turn ends, returns the conversation to `Idle`.
pub struct StreamTicket {
    streams: StreamTable,
    conversation_id: String,
    cancel: CancellationToken,
}

impl StreamTicket {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for StreamTicket {
    fn drop(&mut self) {
        lock_streams(&self.streams).remove(&self.conversation_id);
    }
}

/// Runs chat turns against a backend, at most one per conversation at a time.
pub struct ChatService {
    backend: RwLock<Arc<dyn ChatBackend>>,
    store: SharedStore,
    persistence: Persistence,
    streams: StreamTable,
}

impl ChatService {
    pub fn new(backend: Arc<dyn ChatBackend>, store: SharedStore) -> Self {
        let persistence = lock_store(&store).persistence().clone();
        Self {
            backend: RwLock::new(backend),
            store,
            persistence,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn backend(&self) -> Arc<dyn ChatBackend> {
        self.backend
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap the backend; streams already running keep the old one.
    pub fn set_backend(&self, backend: Arc<dyn ChatBackend>) {
        *self.backend.write().unwrap_or_else(PoisonError::into_inner) = backend;
    }

    #[cfg(test)]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn phase(&self, conversation_id: &str) -> StreamPhase {
        lock_streams(&self.streams)
            .get(conversation_id)
            .map_or(StreamPhase::Idle, |s| s.phase)
    }

    /// Request cancellation of the conversation's stream, if one is running.
    pub fn stop_streaming(&self, conversation_id: &str) -> bool {
        match lock_streams(&self.streams).get(conversation_id) {
            Some(stream) => {
                stream.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for stream in lock_streams(&self.streams).values() {
            stream.cancel.cancel();
        }
    }

    #[cfg(test)]
    pub fn active_streams(&self) -> usize {
        lock_streams(&self.streams).len()
    }

    fn set_phase(&self, conversation_id: &str, phase: StreamPhase) {
        if let Some(stream) = lock_streams(&self.streams).get_mut(conversation_id) {
            stream.phase = phase;
        }
    }

    /// Claim `conversation_id` for a turn, moving it to `Requesting`.
    ///
    /// Rejected without side effects while the conversation already has a
    /// reply in flight.
    pub fn reserve(&self, conversation_id: &str) -> Result<StreamTicket, SessionError> {
        if lock_store(&self.store).get(conversation_id).is_none() {
            return Err(SessionError::UnknownConversation(conversation_id.to_string()));
        }

        let mut streams = lock_streams(&self.streams);
        if streams.contains_key(conversation_id) {
            return Err(SessionError::AlreadyStreaming(conversation_id.to_string()));
        }
        let cancel = CancellationToken::new();
        streams.insert(
            conversation_id.to_string(),
            ActiveStream {
                phase: StreamPhase::Requesting,
                cancel: cancel.clone(),
            },
        );
        Ok(StreamTicket {
            streams: self.streams.clone(),
            conversation_id: conversation_id.to_string(),
            cancel,
        })
    }

    /// Append a user message and stream the assistant's reply into the
    /// conversation.
    ///
    /// Transport failures are not returned as errors: they end up as an
    /// error notice in the conversation and as `StreamOutcome::Failed`.
    pub async fn send_message<F>(
        &self,
        conversation_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
        on_event: F,
    ) -> Result<StreamOutcome, SessionError>
    where
        F: FnMut(SessionEvent) + Send,
    {
        let ticket = self.reserve(conversation_id)?;
        self.run_turn(ticket, content, attachments, on_event).await
    }

    /// [`send_message`](Self::send_message) for a conversation already
    /// claimed with [`reserve`](Self::reserve).
    pub async fn run_turn<F>(
        &self,
        ticket: StreamTicket,
        content: &str,
        attachments: Vec<Attachment>,
        mut on_event: F,
    ) -> Result<StreamOutcome, SessionError>
    where
        F: FnMut(SessionEvent) + Send,
    {
        let conversation_id = ticket.conversation_id.as_str();

        let (model, prompt, staged) = {
            let mut store = lock_store(&self.store);
            let staged = store.append_message(conversation_id, ChatMessage::user(content, attachments));
            match (store.get(conversation_id), staged) {
                (Some(conversation), Some(staged)) => {
                    (conversation.model.clone(), conversation.messages.clone(), staged)
                }
                _ => return Err(SessionError::UnknownConversation(conversation_id.to_string())),
            }
        };
        self.save(staged).await;

        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
        let backend = self.backend();
        let request = ChatRequest {
            model,
            messages: prompt.clone(),
        };
        let transport_cancel = ticket.cancel.clone();

        let _stream_handle = tokio::spawn(async move {
            if let Err(e) = backend.stream_chat(request, tx.clone(), transport_cancel).await {
                let _ = tx.send(StreamEvent::Error(e)).await;
            }
        });

        let mut assembler = StreamAssembler::new();
        let outcome = loop {
            let Some(event) = rx.recv().await else {
                break StreamOutcome::Failed(TransportError::Stream(
                    "Stream ended unexpectedly".to_string(),
                ));
            };

            match assembler.apply(event) {
                AssemblerStep::Started => self.set_phase(conversation_id, StreamPhase::Streaming),
                AssemblerStep::Snapshot(message) => {
                    let mut messages = prompt.clone();
                    messages.push(message.clone());
                    let due = lock_store(&self.store).apply_snapshot(conversation_id, messages);
                    if let Some(snapshot) = due {
                        self.save(snapshot).await;
                    }
                    on_event(SessionEvent::Snapshot {
                        conversation_id: conversation_id.to_string(),
                        message,
                    });
                }
                AssemblerStep::Finished(outcome) => break outcome,
            }
        };

        let mut messages = prompt;
        messages.extend(assembler.final_messages(&outcome));
        let last = lock_store(&self.store).stage(
            conversation_id,
            ConversationUpdate {
                messages: Some(messages),
                ..Default::default()
            },
        );
        if let Some(snapshot) = last {
            self.save(snapshot).await;
        }

        match &outcome {
            StreamOutcome::Completed => {
                tracing::info!(
                    "Reply completed in {} ({} chars)",
                    conversation_id,
                    assembler.content().len()
                );
            }
            StreamOutcome::Aborted => tracing::info!("Reply stopped in {}", conversation_id),
            StreamOutcome::Failed(e) => tracing::error!("Reply failed in {}: {}", conversation_id, e),
        }

        on_event(SessionEvent::Finished {
            conversation_id: conversation_id.to_string(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    /// Write a history snapshot on the blocking pool.
    async fn save(&self, snapshot: HistorySnapshot) {
        let saved = self.persistence.save_snapshot_blocking(snapshot).await;
        lock_store(&self.store).mark_saved(saved);
    }
}
