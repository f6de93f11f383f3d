use std::sync::Arc;

use crate::models::Settings;
use crate::providers::{OllamaClient, TransportError};

use super::chat::ChatService;
use super::persistence::Persistence;

pub struct SettingsService;

impl SettingsService {
    pub fn load(persistence: &Persistence) -> Settings {
        persistence.load_settings()
    }

    /// Save new connection settings and point the chat service at the new
    /// server. Streams already running finish against the old one.
    pub fn apply(
        persistence: &Persistence,
        chat: &ChatService,
        settings: &Settings,
    ) -> Result<Arc<OllamaClient>, TransportError> {
        let client = Arc::new(OllamaClient::new(settings)?);
        if !persistence.save_settings(settings) {
            tracing::warn!("Settings could not be saved; using them for this session only");
        }
        chat.set_backend(client.clone());
        tracing::info!("Server set to {}", client.base_url());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::conversation::ConversationStore;
    use crate::services::persistence::Limits;
    use crate::services::storage::MemoryStore;

    #[tokio::test]
    async fn test_apply_saves_and_swaps_backend() {
        let persistence = Persistence::new(Arc::new(MemoryStore::new(usize::MAX)), Limits::default());
        assert_eq!(SettingsService::load(&persistence), Settings::default());

        let initial = Arc::new(OllamaClient::new(&Settings::default()).unwrap());
        let store = ConversationStore::load(persistence.clone()).into_shared();
        let chat = ChatService::new(initial, store);

        let settings = Settings {
            host: "gpu-box".to_string(),
            port: 8080,
        };
        let client = SettingsService::apply(&persistence, &chat, &settings).unwrap();

        assert_eq!(client.base_url().as_str(), "http://gpu-box:8080/");
        assert_eq!(SettingsService::load(&persistence), settings);
    }

    #[tokio::test]
    async fn test_apply_rejects_bad_host() {
        let persistence = Persistence::new(Arc::new(MemoryStore::new(usize::MAX)), Limits::default());
        let initial = Arc::new(OllamaClient::new(&Settings::default()).unwrap());
        let chat = ChatService::new(initial, ConversationStore::load(persistence.clone()).into_shared());

        let settings = Settings {
            host: "bad host name".to_string(),
            port: 11434,
        };
        assert!(SettingsService::apply(&persistence, &chat, &settings).is_err());
        assert_eq!(SettingsService::load(&persistence), Settings::default());
    }
}
