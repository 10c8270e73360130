//! Reconciles a client's conversation snapshot with stored state.
//!
//! A turn yields exactly one durable user message no matter how often the
//! client resubmits it, and reaches the model only after a quota reservation
//! has been granted.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::{ChatTurnRequest, Trigger, TurnError, ValidatedTurn};
use crate::chat::{Chat, ChatRepository, Message, NewMessage, Role, derive_title};
use crate::db::now_millis;
use crate::llm::ModelRegistry;
use crate::quota::{QuotaGuard, Reservation};
use crate::settings::ModelConfig;

/// A turn ready for generation. The reservation must be released exactly once.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub user_id: String,
    pub chat_id: String,
    /// Model requested for this turn.
    pub model: ModelConfig,
    pub reservation_id: String,
    /// Stored conversation, oldest first, ending with the user message.
    pub history: Vec<Message>,
}

#[derive(Debug, Clone)]
pub struct TurnReconciler {
    chats: ChatRepository,
    quota: QuotaGuard,
    registry: Arc<ModelRegistry>,
}

impl TurnReconciler {
    pub fn new(chats: ChatRepository, quota: QuotaGuard, registry: Arc<ModelRegistry>) -> Self {
        Self {
            chats,
            quota,
            registry,
        }
    }

    #[instrument(skip(self, request), fields(chat_id = %request.id, trigger = ?request.trigger))]
    pub async fn reconcile(
        &self,
        user_id: &str,
        request: ChatTurnRequest,
    ) -> Result<PreparedTurn, TurnError> {
        let turn = request.validate(&self.registry)?;
        let model = self
            .registry
            .get(&turn.model_id)
            .cloned()
            .ok_or_else(|| TurnError::UnknownModel(turn.model_id.clone()))?;

        let chat = self.resolve_chat(user_id, &turn).await?;
        self.sync_chat_model(&chat, &model).await?;
        self.record_user_message(&turn).await?;

        let reservation_id = match self.quota.reserve(user_id).await? {
            Reservation::Granted { id } => id,
            Reservation::Denied { used, limit } => {
                info!(user_id, used, limit, "daily generation limit reached");
                return Err(TurnError::TooManyRequests { limit });
            }
        };

        let history = match self.chats.list_messages(&chat.id).await {
            Ok(history) => history,
            Err(e) => {
                self.quota.release_quietly(&reservation_id).await;
                return Err(TurnError::Storage(e));
            }
        };

        debug!(
            messages = history.len(),
            model = %model.id,
            "turn reconciled"
        );

        Ok(PreparedTurn {
            user_id: user_id.to_string(),
            chat_id: chat.id,
            model,
            reservation_id,
            history,
        })
    }

    /// Load the chat, creating it on first use. Chats of other users are not found.
    async fn resolve_chat(&self, user_id: &str, turn: &ValidatedTurn) -> Result<Chat, TurnError> {
        let chat = match self.chats.get_chat(&turn.chat_id).await? {
            Some(chat) => chat,
            None => {
                let chat = self
                    .chats
                    .create_chat(
                        &turn.chat_id,
                        user_id,
                        &derive_title(&turn.user_text),
                        &turn.model_id,
                    )
                    .await?;
                if chat.user_id == user_id {
                    info!(chat_id = %chat.id, "created chat");
                }
                chat
            }
        };

        if chat.user_id != user_id {
            return Err(TurnError::NotFound);
        }
        Ok(chat)
    }

    async fn sync_chat_model(&self, chat: &Chat, requested: &ModelConfig) -> Result<(), TurnError> {
        let stored = self.registry.resolve(&chat.model_id);
        if stored.id != requested.id {
            debug!(from = %chat.model_id, to = %requested.id, "switching chat model");
            self.chats.update_chat_model(&chat.id, &requested.id).await?;
        }
        Ok(())
    }

    /// Ensure the triggering user message is stored exactly once.
    async fn record_user_message(&self, turn: &ValidatedTurn) -> Result<(), TurnError> {
        let existing = self
            .chats
            .get_message(&turn.user_message_id, &turn.chat_id)
            .await?;

        let conflict = match turn.trigger {
            Trigger::SubmitMessage => TurnError::DuplicateMessage,
            Trigger::RegenerateMessage => TurnError::ChatStateConflict,
        };

        if let Some(existing) = existing {
            return match turn.trigger {
                Trigger::SubmitMessage => Err(conflict),
                Trigger::RegenerateMessage => {
                    if existing.role == Role::User && existing.text() == turn.user_text {
                        Ok(())
                    } else {
                        Err(conflict)
                    }
                }
            };
        }

        let inserted = self
            .chats
            .save_message_if_absent(&NewMessage {
                id: turn.user_message_id.clone(),
                chat_id: turn.chat_id.clone(),
                role: Role::User,
                parts: turn.user_parts(),
                created_at: now_millis(),
            })
            .await?;

        if inserted { Ok(()) } else { Err(conflict) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::settings::{AppConfig, QuotaConfig};
    use crate::user::UserRepository;
    use serde_json::json;

    const CHAT_ID: &str = "0b6f3c9e-8f1d-4c56-a3a4-5e2d7b0c1f22";
    const PRO: &str = "google/gemini-3-pro-preview";
    const FLASH: &str = "google/gemini-2.5-flash";

    struct Fixture {
        reconciler: TurnReconciler,
        chats: ChatRepository,
        quota: QuotaGuard,
        user_id: String,
        other_user_id: String,
    }

    async fn fixture(daily_limit: i64) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let users = UserRepository::new(db.pool().clone());
        let user_id = users.create("mum@example.com", "h").await.unwrap().id;
        let other_user_id = users.create("dad@example.com", "h").await.unwrap().id;

        let config = AppConfig::default();
        let registry = Arc::new(ModelRegistry::new(config.models, &config.default_model).unwrap());
        let chats = ChatRepository::new(db.pool().clone());
        let quota = QuotaGuard::new(
            db.pool().clone(),
            QuotaConfig {
                daily_limit,
                ..QuotaConfig::default()
            },
        );

        Fixture {
            reconciler: TurnReconciler::new(chats.clone(), quota.clone(), registry),
            chats,
            quota,
            user_id,
            other_user_id,
        }
    }

    fn request(trigger: &str, model: &str, message_id: &str, text: &str) -> ChatTurnRequest {
        serde_json::from_value(json!({
            "id": CHAT_ID,
            "selectedChatModel": model,
            "trigger": trigger,
            "messages": [
                {"id": message_id, "role": "user", "parts": [{"type": "text", "text": text}]},
            ],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_submit_creates_chat_and_message() {
        let f = fixture(10).await;
        let turn = f
            .reconciler
            .reconcile(&f.user_id, request("submit-message", FLASH, "u1", "What is a fern?"))
            .await
            .unwrap();

        assert_eq!(turn.chat_id, CHAT_ID);
        assert_eq!(turn.model.id, FLASH);
        assert_eq!(turn.history.len(), 1);
        assert_eq!(turn.history[0].text(), "What is a fern?");

        let chat = f.chats.get_chat(CHAT_ID).await.unwrap().unwrap();
        assert_eq!(chat.title, "What is a fern?");
        assert_eq!(chat.model_id, FLASH);

        assert_eq!(f.quota.usage(&f.user_id).await.unwrap().in_flight, 1);
    }

    #[tokio::test]
    async fn test_duplicate_submit_conflicts() {
        let f = fixture(10).await;
        let first = f
            .reconciler
            .reconcile(&f.user_id, request("submit-message", FLASH, "u1", "hello"))
            .await
            .unwrap();
        f.quota.release(&first.reservation_id).await.unwrap();

        let again = f
            .reconciler
            .reconcile(&f.user_id, request("submit-message", FLASH, "u1", "hello"))
            .await;
        assert!(matches!(again, Err(TurnError::DuplicateMessage)));
        assert_eq!(f.chats.list_messages(CHAT_ID).await.unwrap().len(), 1);
        assert_eq!(f.quota.usage(&f.user_id).await.unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_regenerate_requires_identical_text() {
        let f = fixture(10).await;
        f.reconciler
            .reconcile(&f.user_id, request("submit-message", FLASH, "u1", "hello"))
            .await
            .unwrap();

        let same = f
            .reconciler
            .reconcile(&f.user_id, request("regenerate-message", FLASH, "u1", "hello"))
            .await
            .unwrap();
        assert_eq!(same.history.len(), 1);

        let edited = f
            .reconciler
            .reconcile(&f.user_id, request("regenerate-message", FLASH, "u1", "hello!"))
            .await;
        assert!(matches!(edited, Err(TurnError::ChatStateConflict)));
    }

    #[tokio::test]
    async fn test_regenerate_of_missing_message_inserts_it() {
        let f = fixture(10).await;
        let turn = f
            .reconciler
            .reconcile(&f.user_id, request("regenerate-message", FLASH, "u9", "hello"))
            .await
            .unwrap();
        assert_eq!(turn.history[0].id, "u9");
    }

    #[tokio::test]
    async fn test_regenerate_against_assistant_message_conflicts() {
        let f = fixture(10).await;
        f.reconciler
            .reconcile(&f.user_id, request("submit-message", FLASH, "u1", "hello"))
            .await
            .unwrap();
        f.chats
            .save_message_if_absent(&NewMessage {
                id: "a1".into(),
                chat_id: CHAT_ID.into(),
                role: Role::Assistant,
                parts: crate::chat::text_parts("hello"),
                created_at: now_millis(),
            })
            .await
            .unwrap();

        let result = f
            .reconciler
            .reconcile(&f.user_id, request("regenerate-message", FLASH, "a1", "hello"))
            .await;
        assert!(matches!(result, Err(TurnError::ChatStateConflict)));
    }

    #[tokio::test]
    async fn test_foreign_chat_is_not_found() {
        let f = fixture(10).await;
        f.reconciler
            .reconcile(&f.user_id, request("submit-message", FLASH, "u1", "mine"))
            .await
            .unwrap();

        let result = f
            .reconciler
            .reconcile(&f.other_user_id, request("submit-message", FLASH, "u2", "theirs"))
            .await;
        assert!(matches!(result, Err(TurnError::NotFound)));
        assert!(f.chats.get_message("u2", CHAT_ID).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_model_switch_updates_chat() {
        let f = fixture(10).await;
        f.reconciler
            .reconcile(&f.user_id, request("submit-message", FLASH, "u1", "one"))
            .await
            .unwrap();

        let turn = f
            .reconciler
            .reconcile(&f.user_id, request("submit-message", PRO, "u2", "two"))
            .await
            .unwrap();
        assert_eq!(turn.model.id, PRO);
        assert_eq!(f.chats.get_chat(CHAT_ID).await.unwrap().unwrap().model_id, PRO);
    }

    #[tokio::test]
    async fn test_quota_denial_keeps_user_message() {
        let f = fixture(1).await;
        f.reconciler
            .reconcile(&f.user_id, request("submit-message", FLASH, "u1", "one"))
            .await
            .unwrap();

        let denied = f
            .reconciler
            .reconcile(&f.user_id, request("submit-message", FLASH, "u2", "two"))
            .await;
        assert!(matches!(denied, Err(TurnError::TooManyRequests { limit: 1 })));
        assert!(f.chats.get_message("u2", CHAT_ID).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_model_touches_nothing() {
        let f = fixture(10).await;
        let result = f
            .reconciler
            .reconcile(&f.user_id, request("submit-message", "acme/nope", "u1", "hi"))
            .await;
        assert!(matches!(result, Err(TurnError::UnknownModel(_))));
        assert!(f.chats.get_chat(CHAT_ID).await.unwrap().is_none());
    }
}
