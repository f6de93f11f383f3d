pub mod attachment;
pub mod conversation;
pub mod message;
pub mod settings;

pub use attachment::Attachment;
pub use conversation::Conversation;
pub use message::{ChatMessage, Role};
pub use settings::Settings;
