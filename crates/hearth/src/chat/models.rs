//! Chat data models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use crate::db::millis_to_rfc3339;

/// Title used when the first user message carries no text.
const DEFAULT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 100;

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Chat entity from database.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub model_id: String,
    pub created_at: i64,
}

/// Message as stored: parts are kept as the JSON text they were written with.
#[derive(Debug, Clone, FromRow)]
pub(super) struct MessageRow {
    pub id: String,
    pub chat_id: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub parts: String,
    pub created_at: i64,
}

/// Message with decoded parts.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub parts: Vec<Value>,
    pub created_at: i64,
}

impl Message {
    /// Concatenated text of all `text` parts.
    pub fn text(&self) -> String {
        text_content(&self.parts)
    }
}

impl TryFrom<MessageRow> for Message {
    type Error = serde_json::Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            parts: serde_json::from_str(&row.parts)?,
            id: row.id,
            chat_id: row.chat_id,
            role: row.role,
            created_at: row.created_at,
        })
    }
}

/// A message to insert.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub chat_id: String,
    pub role: Role,
    pub parts: Vec<Value>,
    pub created_at: i64,
}

/// Concatenate the text of every `{"type":"text"}` part. Other parts are ignored.
pub fn text_content(parts: &[Value]) -> String {
    parts
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect()
}

/// A single text part holding `text`.
pub fn text_parts(text: &str) -> Vec<Value> {
    vec![serde_json::json!({ "type": "text", "text": text })]
}

/// Chat title from the first user message: its first 100 characters, as typed.
pub fn derive_title(text: &str) -> String {
    let title: String = text.chars().take(TITLE_MAX_CHARS).collect();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}

/// Chat as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatView {
    pub id: String,
    pub title: String,
    pub model_id: String,
    pub created_at: String,
}

impl From<Chat> for ChatView {
    fn from(chat: Chat) -> Self {
        Self {
            id: chat.id,
            title: chat.title,
            model_id: chat.model_id,
            created_at: millis_to_rfc3339(chat.created_at),
        }
    }
}

/// Message as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Value>,
    pub created_at: String,
}

impl From<Message> for MessageView {
    fn from(message: Message) -> Self {
        Self {
            id: message.id,
            role: message.role,
            parts: message.parts,
            created_at: millis_to_rfc3339(message.created_at),
        }
    }
}
