use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task;

use crate::config::{EVICTION_PERCENT, MAX_CONVERSATIONS, MAX_MESSAGES_PER_CONVERSATION};
use crate::models::{Conversation, Settings};

use super::storage::{KeyValueStore, StorageError};

pub const CONVERSATIONS_KEY: &str = "conversations";
pub const SETTINGS_KEY: &str = "settings";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_conversations: usize,
    pub max_messages: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_conversations: MAX_CONVERSATIONS,
            max_messages: MAX_MESSAGES_PER_CONVERSATION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub used: usize,
    pub total: usize,
    pub percentage: u32,
}

/// The conversation list as of one store change, ready to be written.
/// Higher revisions reflect later states.
#[derive(Debug, Clone)]
pub struct HistorySnapshot {
    pub revision: u64,
    pub conversations: Vec<Conversation>,
}

/// Saves and loads conversations and settings, keeping history within the
/// configured caps and recovering from quota failures by evicting old
/// conversations.
///
/// Nothing here returns an error: saves report `false`, loads fall back to
/// empty or default values.
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn KeyValueStore>,
    limits: Limits,
    revisions: Arc<AtomicU64>,
    written_revision: Arc<Mutex<u64>>,
}

impl Persistence {
    pub fn new(store: Arc<dyn KeyValueStore>, limits: Limits) -> Self {
        Self {
            store,
            limits,
            revisions: Arc::new(AtomicU64::new(0)),
            written_revision: Arc::new(Mutex::new(0)),
        }
    }

    /// Revision for a new snapshot, shared by every clone of this adapter.
    pub fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Keep the first `max_conversations` (the list is newest first) and the
    /// last `max_messages` of each.
    pub fn truncate(&self, conversations: &[Conversation]) -> Vec<Conversation> {
        conversations
            .iter()
            .take(self.limits.max_conversations)
            .map(|conversation| {
                let mut conversation = conversation.clone();
                let len = conversation.messages.len();
                if len > self.limits.max_messages {
                    let excess = len - self.limits.max_messages;
                    conversation.messages.drain(..excess);
                    tracing::debug!(
                        "Trimmed {} old messages from conversation {}",
                        excess,
                        conversation.id
                    );
                }
                conversation
            })
            .collect()
    }

    pub fn save_conversations(&self, conversations: &[Conversation]) -> bool {
        let truncated = self.truncate(conversations);
        match serde_json::to_string(&truncated) {
            Ok(json) => self.safe_save(CONVERSATIONS_KEY, &json),
            Err(e) => {
                tracing::warn!("Failed to serialize conversations: {}", e);
                false
            }
        }
    }

    /// Write a snapshot unless a later one is already stored. A superseded
    /// snapshot counts as saved.
    pub fn save_snapshot(&self, snapshot: &HistorySnapshot) -> bool {
        let mut written = self
            .written_revision
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if snapshot.revision < *written {
            tracing::debug!(
                "Skipping history revision {}; revision {} is already stored",
                snapshot.revision,
                *written
            );
            return true;
        }
        let saved = self.save_conversations(&snapshot.conversations);
        if saved {
            *written = snapshot.revision;
        }
        saved
    }

    /// [`save_snapshot`](Self::save_snapshot) on the blocking pool.
    pub async fn save_snapshot_blocking(&self, snapshot: HistorySnapshot) -> bool {
        let persistence = self.clone();
        task::spawn_blocking(move || persistence.save_snapshot(&snapshot))
            .await
            .unwrap_or_else(|e| {
                tracing::error!("History save task failed: {}", e);
                false
            })
    }

    pub fn load_conversations(&self) -> Vec<Conversation> {
        let raw = match self.store.get(CONVERSATIONS_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read conversations: {}", e);
                return Vec::new();
            }
        };

        let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!("Stored conversations are unreadable, starting empty: {}", e);
                return Vec::new();
            }
        };

        let mut dropped = 0usize;
        let decoded: Vec<Conversation> = values
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(conversation) => Some(conversation),
                Err(e) => {
                    tracing::warn!("Dropping unreadable stored conversation: {}", e);
                    dropped += 1;
                    None
                }
            })
            .collect();

        let truncated = self.truncate(&decoded);
        let changed = dropped > 0
            || truncated.len() != decoded.len()
            || truncated
                .iter()
                .zip(&decoded)
                .any(|(kept, stored)| kept.messages.len() != stored.messages.len());

        if changed {
            tracing::info!("Stored history exceeded limits; saving the corrected version");
            self.save_conversations(&truncated);
        }

        truncated
    }

    pub fn load_settings(&self) -> Settings {
        match self.store.get(SETTINGS_KEY) {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Stored settings are unreadable, using defaults: {}", e);
                Settings::default()
            }),
            Ok(None) => Settings::default(),
            Err(e) => {
                tracing::warn!("Failed to read settings: {}", e);
                Settings::default()
            }
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> bool {
        match serde_json::to_string(settings) {
            Ok(json) => self.safe_save(SETTINGS_KEY, &json),
            Err(e) => {
                tracing::warn!("Failed to serialize settings: {}", e);
                false
            }
        }
    }

    pub fn storage_info(&self) -> StorageInfo {
        let used = self.store.used_bytes().unwrap_or(0);
        let total = self.store.quota();
        let percentage = if total == 0 {
            0
        } else {
            ((used as f64 / total as f64) * 100.0).round() as u32
        };
        StorageInfo {
            used,
            total,
            percentage,
        }
    }

    /// Write `json` under `key`; on a quota failure evict the oldest stored
    /// conversations and retry once.
    fn safe_save(&self, key: &str, json: &str) -> bool {
        match self.store.set(key, json) {
            Ok(()) => true,
            Err(StorageError::CapacityExceeded { needed, available }) => {
                tracing::warn!(
                    "Storage quota exceeded ({} bytes needed, {} available); evicting old conversations",
                    needed,
                    available
                );
                if !self.evict_oldest() {
                    tracing::warn!("Nothing could be evicted; {} was not saved", key);
                    return false;
                }
                match self.store.set(key, json) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("Failed to save {} after eviction: {}", key, e);
                        false
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to save {}: {}", key, e);
                false
            }
        }
    }

    /// Drop the oldest share of the currently stored conversation list.
    fn evict_oldest(&self) -> bool {
        let stored: Vec<serde_json::Value> = match self.store.get(CONVERSATIONS_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Failed to read conversations for eviction: {}", e);
                return false;
            }
        };
        if stored.is_empty() {
            return false;
        }

        let to_remove = (stored.len() * EVICTION_PERCENT).div_ceil(100);
        let keep = stored.len().saturating_sub(to_remove);
        let reduced = &stored[..keep];

        let json = match serde_json::to_string(reduced) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Failed to serialize reduced history: {}", e);
                return false;
            }
        };
        match self.store.set(CONVERSATIONS_KEY, &json) {
            Ok(()) => {
                tracing::info!("Evicted {} oldest conversations", to_remove);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to write reduced history: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::models::{Attachment, ChatMessage};
    use crate::services::storage::MemoryStore;

    /// Fails the first `failures` writes with a quota error, then defers to
    /// an in-memory store. Every successful write is recorded.
    pub(crate) struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
        pub writes: Mutex<Vec<(String, String)>>,
    }

    impl FlakyStore {
        pub(crate) fn new(failures: usize) -> Self {
            Self {
                inner: MemoryStore::new(usize::MAX),
                failures: AtomicUsize::new(failures),
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StorageError::CapacityExceeded {
                    needed: value.len(),
                    available: 0,
                });
            }
            self.inner.set(key, value)?;
            self.writes
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string()));
            Ok(())
        }

        fn used_bytes(&self) -> Result<usize, StorageError> {
            self.inner.used_bytes()
        }

        fn quota(&self) -> usize {
            self.inner.quota()
        }
    }

    fn persistence_over(store: Arc<dyn KeyValueStore>) -> Persistence {
        Persistence::new(store, Limits::default())
    }

    fn conversation_with(n_messages: usize) -> Conversation {
        let mut conversation = Conversation::new("llama3.2");
        conversation.messages = (0..n_messages)
            .map(|i| ChatMessage::user(format!("message {}", i), Vec::new()))
            .collect();
        conversation
    }

    #[test]
    fn test_message_cap_keeps_latest() {
        let persistence = persistence_over(Arc::new(MemoryStore::new(usize::MAX)));
        let conversation = conversation_with(150);

        assert!(persistence.save_conversations(&[conversation]));
        let loaded = persistence.load_conversations();

        assert_eq!(loaded.len(), 1);
        let contents: Vec<&str> = loaded[0].messages.iter().map(|m| m.content.as_str()).collect();
        let expected: Vec<String> = (50..150).map(|i| format!("message {}", i)).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn test_conversation_cap_keeps_first() {
        let persistence = persistence_over(Arc::new(MemoryStore::new(usize::MAX)));
        let conversations: Vec<Conversation> = (0..55).map(|_| conversation_with(0)).collect();

        assert!(persistence.save_conversations(&conversations));
        let loaded = persistence.load_conversations();

        let loaded_ids: Vec<&str> = loaded.iter().map(|c| c.id.as_str()).collect();
        let expected: Vec<&str> = conversations[..50].iter().map(|c| c.id.as_str()).collect();
        assert_eq!(loaded_ids, expected);
    }

    #[test]
    fn test_capacity_retry_succeeds() {
        let store = Arc::new(FlakyStore::new(1));
        let persistence = persistence_over(store.clone());

        // Something already stored, so there is history to evict.
        let stored: Vec<Conversation> = (0..10).map(|_| conversation_with(1)).collect();
        store
            .inner
            .set(CONVERSATIONS_KEY, &serde_json::to_string(&stored).unwrap())
            .unwrap();

        let intended: Vec<Conversation> = (0..12).map(|_| conversation_with(2)).collect();
        assert!(persistence.save_conversations(&intended));

        let writes = store.writes.lock().unwrap().clone();
        assert_eq!(writes.len(), 2);

        // First the stored list minus its two oldest entries, then the payload.
        let reduced: Vec<Conversation> = serde_json::from_str(&writes[0].1).unwrap();
        let reduced_ids: Vec<&str> = reduced.iter().map(|c| c.id.as_str()).collect();
        let expected_ids: Vec<&str> = stored[..8].iter().map(|c| c.id.as_str()).collect();
        assert_eq!(reduced_ids, expected_ids);

        assert_eq!(persistence.load_conversations(), intended);
    }

    #[test]
    fn test_capacity_retry_fails() {
        let store = Arc::new(FlakyStore::new(3));
        let persistence = persistence_over(store.clone());
        store
            .inner
            .set(
                CONVERSATIONS_KEY,
                &serde_json::to_string(&vec![conversation_with(1)]).unwrap(),
            )
            .unwrap();

        assert!(!persistence.save_conversations(&[conversation_with(3)]));
    }

    #[test]
    fn test_capacity_with_nothing_to_evict() {
        let store = Arc::new(FlakyStore::new(1));
        let persistence = persistence_over(store.clone());
        assert!(!persistence.save_conversations(&[conversation_with(1)]));
        assert!(store.writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_real_quota_evicts_oldest() {
        let big = "x".repeat(400);
        let mut stored: Vec<Conversation> = (0..5).map(|_| conversation_with(0)).collect();
        for conversation in &mut stored {
            conversation.messages.push(ChatMessage::user(big.clone(), Vec::new()));
        }
        let stored_json = serde_json::to_string(&stored).unwrap();

        // Room for the stored history plus a little more.
        let store = Arc::new(MemoryStore::new(stored_json.len() + 100));
        store.set(CONVERSATIONS_KEY, &stored_json).unwrap();
        let persistence = persistence_over(store);

        // Settings no longer fit until the oldest conversation goes.
        let settings = Settings {
            host: "h".repeat(150),
            port: 1,
        };
        assert!(persistence.save_settings(&settings));
        assert_eq!(persistence.load_settings(), settings);

        let remaining = persistence.load_conversations();
        let remaining_ids: Vec<&str> = remaining.iter().map(|c| c.id.as_str()).collect();
        let expected: Vec<&str> = stored[..4].iter().map(|c| c.id.as_str()).collect();
        assert_eq!(remaining_ids, expected);
    }

    #[test]
    fn test_attachment_round_trip() {
        let persistence = persistence_over(Arc::new(MemoryStore::new(usize::MAX)));
        let payload: String = "QUJD".repeat(125);
        assert_eq!(payload.len(), 500);
        let attachment = Attachment {
            id: "att-1".to_string(),
            name: "diagram.png".to_string(),
            mime_type: "image/png".to_string(),
            size_bytes: 375,
            content: Some(payload.clone()),
        };
        let mut conversation = conversation_with(0);
        conversation
            .messages
            .push(ChatMessage::user("see attached", vec![attachment.clone()]));

        assert!(persistence.save_conversations(&[conversation]));
        let loaded = persistence.load_conversations();

        assert_eq!(loaded[0].messages[0].attachments, vec![attachment]);
        assert_eq!(
            loaded[0].messages[0].attachments[0].content.as_deref(),
            Some(payload.as_str())
        );
    }

    #[test]
    fn test_load_resaves_corrected_history() {
        let store = Arc::new(MemoryStore::new(usize::MAX));
        let oversized = vec![conversation_with(120)];
        store
            .set(CONVERSATIONS_KEY, &serde_json::to_string(&oversized).unwrap())
            .unwrap();
        let persistence = persistence_over(store.clone());

        let loaded = persistence.load_conversations();
        assert_eq!(loaded[0].messages.len(), 100);

        let raw = store.get(CONVERSATIONS_KEY).unwrap().unwrap();
        let stored: Vec<Conversation> = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored[0].messages.len(), 100);
    }

    #[test]
    fn test_load_caps_conversations_and_resaves() {
        let store = Arc::new(MemoryStore::new(usize::MAX));
        let oversized: Vec<Conversation> = (0..57).map(|_| conversation_with(1)).collect();
        store
            .set(CONVERSATIONS_KEY, &serde_json::to_string(&oversized).unwrap())
            .unwrap();
        let persistence = persistence_over(store.clone());

        let loaded = persistence.load_conversations();
        let loaded_ids: Vec<&str> = loaded.iter().map(|c| c.id.as_str()).collect();
        let expected: Vec<&str> = oversized[..50].iter().map(|c| c.id.as_str()).collect();
        assert_eq!(loaded_ids, expected);

        let raw = store.get(CONVERSATIONS_KEY).unwrap().unwrap();
        let stored: Vec<Conversation> = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, loaded);
    }

    #[test]
    fn test_stale_snapshot_does_not_overwrite() {
        let persistence = persistence_over(Arc::new(MemoryStore::new(usize::MAX)));
        let older = HistorySnapshot {
            revision: persistence.next_revision(),
            conversations: vec![conversation_with(1)],
        };
        let newer = HistorySnapshot {
            revision: persistence.next_revision(),
            conversations: vec![conversation_with(2)],
        };

        assert!(persistence.save_snapshot(&newer));
        assert!(persistence.save_snapshot(&older));
        assert_eq!(persistence.load_conversations(), newer.conversations);
    }

    #[tokio::test]
    async fn test_snapshot_saved_on_blocking_pool() {
        let store = Arc::new(FlakyStore::new(1));
        let persistence = persistence_over(store.clone());
        let snapshot = HistorySnapshot {
            revision: 1,
            conversations: vec![conversation_with(1)],
        };

        // Nothing stored yet, so the quota failure cannot be recovered.
        assert!(!persistence.save_snapshot_blocking(snapshot.clone()).await);
        assert!(persistence.save_snapshot_blocking(snapshot.clone()).await);
        assert_eq!(persistence.load_conversations(), snapshot.conversations);
    }

    #[test]
    fn test_load_drops_unreadable_entries() {
        let store = Arc::new(MemoryStore::new(usize::MAX));
        let good = conversation_with(1);
        let raw = format!(
            "[{}, {{\"id\": 7}}]",
            serde_json::to_string(&good).unwrap()
        );
        store.set(CONVERSATIONS_KEY, &raw).unwrap();
        let persistence = persistence_over(store.clone());

        assert_eq!(persistence.load_conversations(), vec![good.clone()]);
        let resaved: Vec<Conversation> =
            serde_json::from_str(&store.get(CONVERSATIONS_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(resaved, vec![good]);
    }

    #[test]
    fn test_load_never_fails() {
        let store = Arc::new(MemoryStore::new(usize::MAX));
        let persistence = persistence_over(store.clone());
        assert!(persistence.load_conversations().is_empty());

        store.set(CONVERSATIONS_KEY, "{not json").unwrap();
        assert!(persistence.load_conversations().is_empty());

        store.set(CONVERSATIONS_KEY, "{\"an\": \"object\"}").unwrap();
        assert!(persistence.load_conversations().is_empty());

        store.set(SETTINGS_KEY, "nope").unwrap();
        assert_eq!(persistence.load_settings(), Settings::default());
    }

    #[test]
    fn test_storage_info() {
        let store = Arc::new(MemoryStore::new(1000));
        store.set(SETTINGS_KEY, &"s".repeat(125)).unwrap();
        store.set(CONVERSATIONS_KEY, &"c".repeat(125)).unwrap();
        let persistence = persistence_over(store);
        assert_eq!(
            persistence.storage_info(),
            StorageInfo {
                used: 250,
                total: 1000,
                percentage: 25
            }
        );
    }
}
