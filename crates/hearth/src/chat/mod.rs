//! Conversations and their messages.

mod models;
mod repository;

pub use models::{
    Chat, ChatView, Message, MessageView, NewMessage, Role, derive_title, text_content, text_parts,
};
pub(crate) use repository::count_assistant_messages_since;
pub use repository::{ChatRepository, TailDeletion};
