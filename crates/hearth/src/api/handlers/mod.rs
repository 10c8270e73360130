//! Request handlers, grouped by resource.

mod auth;
mod chat;
mod models;
mod system;

pub use auth::{LoginRequest, LoginResponse, login, logout, me};
pub use chat::{
    ChatDetail, DeleteChatQuery, StopResponse, TrailingDeleteResponse, delete_chat,
    delete_trailing_messages, get_chat, history, post_chat, stop_chat,
};
pub use models::{ModelSummary, ModelsResponse, list_models, usage};
pub use system::{HealthResponse, health};
