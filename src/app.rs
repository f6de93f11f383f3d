use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{self, AppConfig};
use crate::models::{Attachment, Settings};
use crate::providers::OllamaClient;
use crate::services::assembler::StreamOutcome;
use crate::services::attachments::attachment_from_path;
use crate::services::chat::{ChatService, SessionError, SessionEvent, StreamPhase, StreamTicket};
use crate::services::conversation::{lock_store, ConversationStore, SharedStore};
use crate::services::models::{self, format_progress, PullOutcome};
use crate::services::persistence::{Limits, Persistence};
use crate::services::storage::{KeyValueStore, MemoryStore};
use crate::services::{Database, SettingsService};

const HELP: &str = "\
Commands:
  /new [model]          start a conversation
  /list                 list conversations
  /select <id>          switch conversation
  /delete <id>          delete a conversation
  /rename <id> <title>  rename a conversation
  /models               list installed models
  /pull <name>          download a model
  /rmmodel <name>       delete a model
  /host <host> <port>   change the server
  /attach <path>        attach a file to the next message
  /storage              show storage usage
  /clear                delete all conversations
  /help                 show this help
  /quit                 exit
Anything else is sent to the active conversation. Ctrl-C stops a reply.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMsg {
    NewChat(Option<String>),
    ListConversations,
    ConversationSelected(String),
    DeleteConversation(String),
    RenameConversation(String, String), // id, new_title
    ListModels,
    PullModel(String),
    DeleteModel(String),
    SetHost(String, u16),
    Attach(PathBuf),
    ShowStorage,
    ClearHistory,
    ShowHelp,
    Quit,
    SendMessage(String),
}

impl AppMsg {
    /// `Ok(None)` for blank input, `Err` with a usage hint for a bad command.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(command) = line.strip_prefix('/') else {
            return Ok(Some(AppMsg::SendMessage(line.to_string())));
        };

        let (name, rest) = match command.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (command, ""),
        };
        let required = |usage: &str| {
            if rest.is_empty() {
                Err(format!("Usage: {}", usage))
            } else {
                Ok(rest.to_string())
            }
        };

        let msg = match name {
            "new" => AppMsg::NewChat((!rest.is_empty()).then(|| rest.to_string())),
            "list" => AppMsg::ListConversations,
            "select" => AppMsg::ConversationSelected(required("/select <id>")?),
            "delete" => AppMsg::DeleteConversation(required("/delete <id>")?),
            "rename" => match rest.split_once(char::is_whitespace) {
                Some((id, title)) if !title.trim().is_empty() => {
                    AppMsg::RenameConversation(id.to_string(), title.trim().to_string())
                }
                _ => return Err("Usage: /rename <id> <title>".to_string()),
            },
            "models" => AppMsg::ListModels,
            "pull" => AppMsg::PullModel(required("/pull <name>")?),
            "rmmodel" => AppMsg::DeleteModel(required("/rmmodel <name>")?),
            "host" => {
                let mut parts = rest.split_whitespace();
                match (parts.next(), parts.next().map(str::parse::<u16>), parts.next()) {
                    (Some(host), Some(Ok(port)), None) => AppMsg::SetHost(host.to_string(), port),
                    _ => return Err("Usage: /host <host> <port>".to_string()),
                }
            }
            "attach" => AppMsg::Attach(PathBuf::from(required("/attach <path>")?)),
            "storage" => AppMsg::ShowStorage,
            "clear" => AppMsg::ClearHistory,
            "help" => AppMsg::ShowHelp,
            "quit" | "exit" => AppMsg::Quit,
            other => return Err(format!("Unknown command /{}; try /help", other)),
        };
        Ok(Some(msg))
    }
}

/// Text not yet printed for a snapshot that grows by appending.
pub fn unprinted_suffix<'a>(printed: &mut usize, content: &'a str) -> Option<&'a str> {
    let suffix = content.get(*printed..).filter(|s| !s.is_empty())?;
    *printed = content.len();
    Some(suffix)
}

/// Everything the command loop works on, independent of the terminal.
pub struct AppState {
    persistence: Persistence,
    store: SharedStore,
    chat: Arc<ChatService>,
    settings: Settings,
    default_model: String,
    pending_attachments: Vec<Attachment>,
}

impl AppState {
    /// Falls back to an in-memory store when the database cannot be opened;
    /// history then lasts for this session only.
    pub fn open(config: &AppConfig) -> Result<Self> {
        let path = config.db_path();
        let store: Arc<dyn KeyValueStore> = match Database::open(&path, config.storage_quota) {
            Ok(db) => {
                tracing::info!("Using database {}", path.display());
                Arc::new(db)
            }
            Err(e) => {
                tracing::error!("Failed to open {}: {:#}; history will not be kept", path.display(), e);
                Arc::new(MemoryStore::new(config.storage_quota))
            }
        };
        Self::with_persistence(Persistence::new(store, Limits::default()), &config.default_model)
    }

    pub fn with_persistence(persistence: Persistence, default_model: &str) -> Result<Self> {
        let mut settings = SettingsService::load(&persistence);
        let client = match OllamaClient::new(&settings) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("Stored server settings are invalid, using defaults: {}", e);
                settings = Settings::default();
                OllamaClient::new(&settings).context("Default server address is invalid")?
            }
        };

        let mut store = ConversationStore::load(persistence.clone());
        let newest = store.list().first().map(|c| c.id.clone());
        store.select(newest.as_deref());
        let store = store.into_shared();

        let chat = Arc::new(ChatService::new(Arc::new(client), store.clone()));
        Ok(Self {
            persistence,
            store,
            chat,
            settings,
            default_model: default_model.to_string(),
            pending_attachments: Vec::new(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn new_chat(&mut self, model: Option<String>) -> String {
        let model = model.unwrap_or_else(|| self.default_model.clone());
        let conversation = lock_store(&self.store).create(&model);
        format!("Started {} with {}", conversation.id, conversation.model)
    }

    pub fn list_conversations(&self) -> String {
        let store = lock_store(&self.store);
        if store.list().is_empty() {
            return "No conversations".to_string();
        }
        store
            .list()
            .iter()
            .map(|c| {
                let marker = if store.active_id() == Some(c.id.as_str()) { "*" } else { " " };
                let replying = match self.chat.phase(&c.id) {
                    StreamPhase::Idle => "",
                    StreamPhase::Requesting | StreamPhase::Streaming => " (replying)",
                };
                format!(
                    "{} {}  {}  [{}, {} messages, {}]{}",
                    marker,
                    c.id,
                    c.title,
                    c.model,
                    c.messages.len(),
                    c.updated_at.format("%Y-%m-%d %H:%M"),
                    replying
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn select(&mut self, id: &str) -> String {
        let mut store = lock_store(&self.store);
        if !store.select(Some(id)) {
            return format!("No conversation {}", id);
        }
        let Some(conversation) = store.active() else {
            return format!("No conversation {}", id);
        };
        let mut out = format!("Switched to {}", conversation.title);
        for message in &conversation.messages {
            out.push_str(&format!("\n{}: {}", message.role.as_str(), message.content));
        }
        out
    }

    pub fn delete(&mut self, id: &str) -> String {
        if self.chat.stop_streaming(id) {
            tracing::debug!("Stopped reply in {} before deleting it", id);
        }
        if lock_store(&self.store).delete(id) {
            format!("Deleted {}", id)
        } else {
            format!("No conversation {}", id)
        }
    }

    pub fn rename(&mut self, id: &str, title: &str) -> String {
        if lock_store(&self.store).rename(id, title) {
            format!("Renamed {} to {}", id, title)
        } else {
            format!("No conversation {}", id)
        }
    }

    pub fn set_host(&mut self, host: String, port: u16) -> String {
        let settings = Settings { host, port };
        match SettingsService::apply(&self.persistence, &self.chat, &settings) {
            Ok(client) => {
                self.settings = settings;
                format!("Server set to {}", client.base_url())
            }
            Err(e) => format!("Server unchanged: {}", e),
        }
    }

    pub fn attach(&mut self, path: &Path) -> String {
        match attachment_from_path(path) {
            Ok(attachment) => {
                let line = format!("Attached {}", attachment.describe());
                self.pending_attachments.push(attachment);
                line
            }
            Err(e) => format!("Cannot attach {}: {}", path.display(), e),
        }
    }

    pub fn storage(&self) -> String {
        let info = self.persistence.storage_info();
        format!(
            "Storage: {} of {} bytes used ({}%)",
            info.used, info.total, info.percentage
        )
    }

    pub fn clear(&mut self) -> String {
        self.chat.stop_all();
        if lock_store(&self.store).clear() {
            "All conversations deleted".to_string()
        } else {
            "Conversations cleared for this session; storage could not be updated".to_string()
        }
    }

    /// The conversation the next message goes to, created on demand.
    fn target_conversation(&mut self) -> String {
        let mut store = lock_store(&self.store);
        match store.active_id() {
            Some(id) => id.to_string(),
            None => store.create(&self.default_model).id,
        }
    }

    fn take_attachments(&mut self) -> Vec<Attachment> {
        std::mem::take(&mut self.pending_attachments)
    }

    /// Claim the target conversation for a new message. Queued attachments
    /// are handed over only once the claim succeeds.
    fn begin_send(&mut self) -> Result<(StreamTicket, Vec<Attachment>), SessionError> {
        let conversation_id = self.target_conversation();
        let ticket = self.chat.reserve(&conversation_id)?;
        Ok((ticket, self.take_attachments()))
    }

    /// Stop running replies and write anything still pending.
    pub fn shutdown(&self) {
        self.chat.stop_all();
        if !lock_store(&self.store).flush() {
            tracing::warn!("Some changes could not be saved on exit");
        }
    }
}

pub struct App {
    state: AppState,
    tasks: JoinSet<()>,
    pulls: CancellationToken,
}

impl App {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            tasks: JoinSet::new(),
            pulls: CancellationToken::new(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let settings = self.state.settings();
        println!(
            "{} ready ({}:{}). Type /help for commands.",
            config::APP_NAME,
            settings.host,
            settings.port
        );
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read input")? else {
                        break;
                    };
                    match AppMsg::parse(&line) {
                        Ok(Some(AppMsg::Quit)) => break,
                        Ok(Some(msg)) => self.update(msg).await,
                        Ok(None) => {}
                        Err(usage) => println!("{}", usage),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    if self.tasks.is_empty() {
                        break;
                    }
                    self.stop_background();
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!("Background task failed: {}", e);
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn stop_background(&mut self) {
        self.state.chat.stop_all();
        self.pulls.cancel();
        self.pulls = CancellationToken::new();
    }

    async fn shutdown(&mut self) {
        self.stop_background();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Background task failed: {}", e);
            }
        }
        self.state.shutdown();
    }

    async fn update(&mut self, msg: AppMsg) {
        match msg {
            AppMsg::NewChat(model) => println!("{}", self.state.new_chat(model)),
            AppMsg::ListConversations => println!("{}", self.state.list_conversations()),
            AppMsg::ConversationSelected(id) => println!("{}", self.state.select(&id)),
            AppMsg::DeleteConversation(id) => println!("{}", self.state.delete(&id)),
            AppMsg::RenameConversation(id, title) => println!("{}", self.state.rename(&id, &title)),
            AppMsg::ListModels => {
                let backend = self.state.chat.backend();
                match models::list_models(backend.as_ref()).await {
                    Ok(list) if list.is_empty() => println!("No models installed"),
                    Ok(list) => {
                        for model in list {
                            let size = model
                                .details
                                .as_ref()
                                .and_then(|d| d.parameter_size.clone())
                                .unwrap_or_else(|| format!("{} MB", model.size / (1024 * 1024)));
                            println!("{}  ({})", model.name, size);
                        }
                    }
                    Err(e) => {
                        let reachable = models::check_connection(backend.as_ref()).await;
                        println!(
                            "Failed to list models: {}{}",
                            e,
                            if reachable { "" } else { " (server not reachable)" }
                        );
                    }
                }
            }
            AppMsg::PullModel(name) => {
                let backend = self.state.chat.backend();
                let cancel = self.pulls.child_token();
                self.tasks.spawn(async move {
                    let outcome = models::pull_model(backend, &name, cancel, |progress| {
                        println!("{}", format_progress(progress));
                    })
                    .await;
                    match outcome {
                        PullOutcome::Completed => println!("Pulled {}", name),
                        PullOutcome::Aborted => println!("Pull of {} stopped", name),
                        PullOutcome::Failed(e) => println!("Pull of {} failed: {}", name, e),
                    }
                });
            }
            AppMsg::DeleteModel(name) => {
                let backend = self.state.chat.backend();
                match models::delete_model(backend.as_ref(), &name).await {
                    Ok(()) => println!("Deleted model {}", name),
                    Err(e) => println!("Failed to delete {}: {}", name, e),
                }
            }
            AppMsg::SetHost(host, port) => println!("{}", self.state.set_host(host, port)),
            AppMsg::Attach(path) => println!("{}", self.state.attach(&path)),
            AppMsg::ShowStorage => println!("{}", self.state.storage()),
            AppMsg::ClearHistory => println!("{}", self.state.clear()),
            AppMsg::ShowHelp => println!("{}", HELP),
            AppMsg::Quit => {}
            AppMsg::SendMessage(text) => self.send(text),
        }
    }

    fn send(&mut self, text: String) {
        let (ticket, attachments) = match self.state.begin_send() {
            Ok(claimed) => claimed,
            Err(e) => {
                println!("{}", e);
                return;
            }
        };
        let chat = self.state.chat.clone();

        self.tasks.spawn(async move {
            let mut printed = 0usize;
            let result = chat
                .run_turn(ticket, &text, attachments, |event| match event {
                    SessionEvent::Snapshot { message, .. } => {
                        if let Some(suffix) = unprinted_suffix(&mut printed, &message.content) {
                            let mut stdout = std::io::stdout().lock();
                            let _ = stdout.write_all(suffix.as_bytes());
                            let _ = stdout.flush();
                        }
                    }
                    SessionEvent::Finished { outcome, .. } => match outcome {
                        StreamOutcome::Completed => println!(),
                        StreamOutcome::Aborted => println!("\n[stopped]"),
                        StreamOutcome::Failed(e) => println!("\nError: {}", e),
                    },
                })
                .await;
            if let Err(e) = result {
                println!("{}", e);
            }
        });
    }
}
