pub mod assembler;
pub mod attachments;
pub mod chat;
pub mod conversation;
pub mod database;
pub mod models;
pub mod persistence;
pub mod settings;
pub mod storage;

pub use database::Database;
pub use settings::SettingsService;
