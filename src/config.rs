use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

pub const APP_NAME: &str = "ochat";

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 11434;
pub const DEFAULT_MODEL: &str = "llama3.2";

/// Conversations kept in persisted history, most recent first.
pub const MAX_CONVERSATIONS: usize = 50;
/// Messages kept per persisted conversation, oldest trimmed first.
pub const MAX_MESSAGES_PER_CONVERSATION: usize = 100;
/// Percentage of persisted conversations dropped when a write exceeds the quota.
pub const EVICTION_PERCENT: usize = 20;

pub const DEFAULT_STORAGE_QUOTA: usize = 5 * 1024 * 1024;

pub const STREAM_PERSIST_INTERVAL: Duration = Duration::from_millis(500);
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration resolved from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub storage_quota: usize,
    pub default_model: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|_| {
                std::env::var("HOME").map(|home| PathBuf::from(home).join(".local/share"))
            })
            .context("Neither XDG_DATA_HOME nor HOME is set")?
            .join(APP_NAME);

        let storage_quota = match std::env::var("OCHAT_STORAGE_QUOTA") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid OCHAT_STORAGE_QUOTA: {}", raw))?,
            Err(_) => DEFAULT_STORAGE_QUOTA,
        };

        let default_model = std::env::var("OCHAT_DEFAULT_MODEL")
            .ok()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        Ok(Self {
            data_dir,
            storage_quota,
            default_model,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ochat.db")
    }
}
