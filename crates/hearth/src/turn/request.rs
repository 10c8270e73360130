//! Chat turn payload and its validation.

use serde::Deserialize;
use serde_json::Value;

use super::TurnError;
use crate::chat::{Role, text_content, text_parts};
use crate::llm::ModelRegistry;

/// What caused the client to send this turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    #[default]
    SubmitMessage,
    RegenerateMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Value>,
}

/// Body of `POST /api/chat`: the client's full view of the conversation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurnRequest {
    pub id: String,
    pub messages: Vec<IncomingMessage>,
    pub selected_chat_model: String,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// A request that passed shape validation.
#[derive(Debug, Clone)]
pub struct ValidatedTurn {
    pub chat_id: String,
    pub model_id: String,
    pub trigger: Trigger,
    /// Id of the last user message in the snapshot.
    pub user_message_id: String,
    /// Concatenated text of that message's text parts.
    pub user_text: String,
}

impl ValidatedTurn {
    /// Parts stored for the user message: a single text part.
    pub fn user_parts(&self) -> Vec<Value> {
        text_parts(&self.user_text)
    }
}

impl ChatTurnRequest {
    /// Parse a raw body. Any deserialization failure is a bad request.
    pub fn from_slice(body: &[u8]) -> Result<Self, TurnError> {
        serde_json::from_slice(body)
            .map_err(|e| TurnError::BadRequest(format!("invalid request body: {e}")))
    }

    /// Check shape and model, then extract the triggering user message.
    pub fn validate(self, registry: &ModelRegistry) -> Result<ValidatedTurn, TurnError> {
        uuid::Uuid::parse_str(&self.id)
            .map_err(|_| TurnError::BadRequest("chat id must be a UUID".into()))?;

        if self.selected_chat_model.trim().is_empty() {
            return Err(TurnError::BadRequest("selectedChatModel is required".into()));
        }
        if self.messages.is_empty() {
            return Err(TurnError::BadRequest("messages must not be empty".into()));
        }

        for message in &self.messages {
            if message.id.trim().is_empty() {
                return Err(TurnError::BadRequest("message id must not be empty".into()));
            }
            let typed = message
                .parts
                .iter()
                .all(|part| part.get("type").and_then(Value::as_str).is_some());
            if !typed {
                return Err(TurnError::BadRequest(format!(
                    "message {} has a part without a type",
                    message.id
                )));
            }
        }

        if !registry.contains(&self.selected_chat_model) {
            return Err(TurnError::UnknownModel(self.selected_chat_model));
        }

        let last_user = self
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .ok_or_else(|| TurnError::InvalidUserMessage("no user message to answer".into()))?;

        if self.trigger == Trigger::SubmitMessage
            && let Some(message_id) = &self.message_id
            && message_id != &last_user.id
        {
            return Err(TurnError::BadRequest(
                "messageId does not match the last user message".into(),
            ));
        }

        let user_text = text_content(&last_user.parts);
        if user_text.trim().is_empty() {
            return Err(TurnError::InvalidUserMessage(
                "message must contain text".into(),
            ));
        }

        Ok(ValidatedTurn {
            chat_id: self.id,
            model_id: self.selected_chat_model,
            trigger: self.trigger,
            user_message_id: last_user.id.clone(),
            user_text,
        })
    }
}
