use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::config::STREAM_PERSIST_INTERVAL;
use crate::models::{ChatMessage, Conversation, Role};

use super::persistence::{HistorySnapshot, Persistence};

const TITLE_MAX_CHARS: usize = 30;

pub type SharedStore = Arc<Mutex<ConversationStore>>;

/// Lock a shared store. A panic while holding the lock leaves the data in a
/// consistent state between operations, so poisoning is ignored.
pub fn lock_store(store: &SharedStore) -> MutexGuard<'_, ConversationStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fields to merge into a conversation. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub model: Option<String>,
    pub messages: Option<Vec<ChatMessage>>,
}

/// Authoritative in-memory history plus the active selection.
///
/// Every mutation refreshes `updated_at`. Most are saved on the spot; the
/// ones used while a reply streams hand back a [`HistorySnapshot`] for the
/// caller to write off the async runtime. A failed save is logged and the
/// in-memory change stands.
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    active_id: Option<String>,
    persistence: Persistence,
    last_persist: Option<Instant>,
    dirty: bool,
}

impl ConversationStore {
    pub fn load(persistence: Persistence) -> Self {
        let conversations = persistence.load_conversations();
        tracing::info!("Loaded {} conversations", conversations.len());
        Self {
            conversations,
            active_id: None,
            persistence,
            last_persist: None,
            dirty: false,
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    /// Newest first.
    pub fn list(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active_id.as_deref()
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active_id.as_deref().and_then(|id| self.get(id))
    }

    pub fn create(&mut self, model: &str) -> Conversation {
        let conversation = Conversation::new(model);
        self.conversations.insert(0, conversation.clone());
        self.active_id = Some(conversation.id.clone());
        self.persist();
        conversation
    }

    /// Change the active conversation. Unknown ids leave the selection alone.
    pub fn select(&mut self, id: Option<&str>) -> bool {
        match id {
            None => {
                self.active_id = None;
                true
            }
            Some(id) if self.get(id).is_some() => {
                self.active_id = Some(id.to_string());
                true
            }
            Some(id) => {
                tracing::debug!("Ignoring selection of unknown conversation {}", id);
                false
            }
        }
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|c| c.id != id);
        if self.conversations.len() == before {
            return false;
        }

        if self.active_id.as_deref() == Some(id) {
            self.active_id = self
                .conversations
                .iter()
                .max_by_key(|c| c.updated_at)
                .map(|c| c.id.clone());
        }
        self.persist();
        true
    }

    /// Merge `update` into the conversation. Unknown ids are a no-op.
    pub fn update(&mut self, id: &str, update: ConversationUpdate) -> bool {
        if !self.merge(id, update) {
            return false;
        }
        self.persist();
        true
    }

    pub fn rename(&mut self, id: &str, title: &str) -> bool {
        self.update(
            id,
            ConversationUpdate {
                title: Some(title.to_string()),
                ..Default::default()
            },
        )
    }

    /// Append a message, deriving the title from the first user message.
    /// Returns the snapshot to save, or `None` for an unknown id.
    pub fn append_message(&mut self, id: &str, message: ChatMessage) -> Option<HistorySnapshot> {
        let conversation = self.get(id)?;

        let title = if conversation.messages.is_empty() && message.role == Role::User {
            derive_title(&message.content)
        } else {
            None
        };
        let mut messages = conversation.messages.clone();
        messages.push(message);

        self.stage(
            id,
            ConversationUpdate {
                title,
                messages: Some(messages),
                ..Default::default()
            },
        )
    }

    /// Merge `update` and return the snapshot to save, or `None` for an
    /// unknown id.
    pub fn stage(&mut self, id: &str, update: ConversationUpdate) -> Option<HistorySnapshot> {
        if !self.merge(id, update) {
            return None;
        }
        Some(self.snapshot())
    }

    /// Replace the message list with a streaming snapshot. Saves are
    /// coalesced to one per `STREAM_PERSIST_INTERVAL`: a snapshot to save is
    /// returned only when one is due. The final state must be written with
    /// [`stage`](Self::stage) or [`flush`](Self::flush).
    pub fn apply_snapshot(&mut self, id: &str, messages: Vec<ChatMessage>) -> Option<HistorySnapshot> {
        let applied = self.merge(
            id,
            ConversationUpdate {
                messages: Some(messages),
                ..Default::default()
            },
        );
        if !applied {
            return None;
        }

        let due = self
            .last_persist
            .map_or(true, |at| at.elapsed() >= STREAM_PERSIST_INTERVAL);
        due.then(|| self.snapshot())
    }

    /// Record the result of writing a snapshot taken from this store.
    pub fn mark_saved(&mut self, saved: bool) {
        if !saved {
            tracing::warn!("Conversation history could not be saved; changes are kept in memory");
            self.dirty = true;
        }
    }

    /// Drop every conversation.
    pub fn clear(&mut self) -> bool {
        self.conversations.clear();
        self.active_id = None;
        self.persist()
    }

    /// Write the current state if anything is pending.
    pub fn flush(&mut self) -> bool {
        if !self.dirty {
            return true;
        }
        self.persist()
    }

    fn merge(&mut self, id: &str, update: ConversationUpdate) -> bool {
        let Some(conversation) = self.conversations.iter_mut().find(|c| c.id == id) else {
            tracing::debug!("Ignoring update of unknown conversation {}", id);
            return false;
        };

        if let Some(title) = update.title {
            conversation.title = title;
        }
        if let Some(model) = update.model {
            conversation.model = model;
        }
        if let Some(messages) = update.messages {
            conversation.messages = messages;
        }
        conversation.touch();
        self.dirty = true;
        true
    }

    fn snapshot(&mut self) -> HistorySnapshot {
        self.dirty = false;
        self.last_persist = Some(Instant::now());
        HistorySnapshot {
            revision: self.persistence.next_revision(),
            conversations: self.conversations.clone(),
        }
    }

    fn persist(&mut self) -> bool {
        let snapshot = self.snapshot();
        let saved = self.persistence.save_snapshot(&snapshot);
        self.mark_saved(saved);
        saved
    }
}

/// Title for a conversation started with `content`: the first 30 characters
/// of the trimmed content, with `...` when cut. `None` for blank content.
pub fn derive_title(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.char_indices().nth(TITLE_MAX_CHARS) {
        Some((boundary, _)) => Some(format!("{}...", &trimmed[..boundary])),
        None => Some(trimmed.to_string()),
    }
}
