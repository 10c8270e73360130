//! Chat and message repository.

use anyhow::{Context, Result};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use super::models::{Chat, Message, MessageRow, NewMessage, Role};
use crate::db::{now_millis, with_write_lock};

const CHAT_COLUMNS: &str = "id, user_id, title, model_id, created_at";
const MESSAGE_COLUMNS: &str = "id, chat_id, role, parts, created_at";

/// Result of deleting a message and everything after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailDeletion {
    Deleted { count: u64 },
    NotFound,
}

/// Repository for chat and message database operations.
#[derive(Debug, Clone)]
pub struct ChatRepository {
    pool: SqlitePool,
}

impl ChatRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a chat unless one with the same id already exists.
    ///
    /// Returns the stored chat, which may belong to another user when ids collide.
    #[instrument(skip(self, title))]
    pub async fn create_chat(
        &self,
        id: &str,
        user_id: &str,
        title: &str,
        model_id: &str,
    ) -> Result<Chat> {
        sqlx::query(
            r#"
            INSERT INTO chats (id, user_id, title, model_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(title)
        .bind(model_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert chat")?;

        self.get_chat(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Chat not found after creation"))
    }

    #[instrument(skip(self))]
    pub async fn get_chat(&self, id: &str) -> Result<Option<Chat>> {
        let sql = format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?");
        let chat = sqlx::query_as::<_, Chat>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch chat")?;

        Ok(chat)
    }

    /// Chats owned by `user_id`, most recent first.
    #[instrument(skip(self))]
    pub async fn list_chats_for_user(&self, user_id: &str) -> Result<Vec<Chat>> {
        let sql = format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE user_id = ? ORDER BY created_at DESC, id DESC"
        );
        let chats = sqlx::query_as::<_, Chat>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list chats")?;

        Ok(chats)
    }

    /// Delete a chat owned by `user_id`. Messages cascade.
    #[instrument(skip(self))]
    pub async fn delete_chat(&self, id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chats WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete chat")?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    pub async fn update_chat_model(&self, id: &str, model_id: &str) -> Result<()> {
        sqlx::query("UPDATE chats SET model_id = ? WHERE id = ?")
            .bind(model_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update chat model")?;

        Ok(())
    }

    /// Insert a message unless its id already exists. Returns whether a row was written.
    #[instrument(skip(self, message), fields(id = %message.id, chat_id = %message.chat_id))]
    pub async fn save_message_if_absent(&self, message: &NewMessage) -> Result<bool> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        insert_if_absent(&mut conn, message).await
    }

    /// Insert messages in one transaction, skipping ids that already exist.
    /// Returns the number of rows written.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub async fn save_messages(&self, messages: &[NewMessage]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let mut inserted = 0;
        for message in messages {
            if insert_if_absent(&mut tx, message).await? {
                inserted += 1;
            }
        }

        tx.commit().await.context("Failed to commit messages")?;
        Ok(inserted)
    }

    /// Get a message by id within a chat.
    #[instrument(skip(self))]
    pub async fn get_message(&self, id: &str, chat_id: &str) -> Result<Option<Message>> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ? AND chat_id = ?");
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(id)
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch message")?;

        row.map(Message::try_from)
            .transpose()
            .context("Stored message parts are not valid JSON")
    }

    /// Messages of a chat in conversation order.
    #[instrument(skip(self))]
    pub async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ? ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list messages")?;

        rows.into_iter()
            .map(|row| Message::try_from(row).context("Stored message parts are not valid JSON"))
            .collect()
    }

    /// Delete `message_id` and every message ordered after it in the same chat.
    ///
    /// Runs under the database write lock, so the tail is exactly what was
    /// stored when the lock was taken; messages written afterwards survive.
    #[instrument(skip(self))]
    pub async fn delete_message_tail_for_user(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<TailDeletion> {
        let user_id = user_id.to_string();
        let message_id = message_id.to_string();

        with_write_lock(&self.pool, move |conn| {
            Box::pin(async move { delete_tail_locked(conn, &user_id, &message_id).await })
        })
        .await
    }

    /// Assistant messages in chats owned by `user_id` created at or after `since`.
    #[instrument(skip(self))]
    pub async fn count_assistant_messages_since(&self, user_id: &str, since: i64) -> Result<i64> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;
        count_assistant_messages_since(&mut conn, user_id, since).await
    }
}

async fn delete_tail_locked(
    conn: &mut SqliteConnection,
    user_id: &str,
    message_id: &str,
) -> Result<TailDeletion> {
    let target: Option<(String, i64)> = sqlx::query_as(
        r#"
        SELECT m.chat_id, m.created_at
        FROM messages m
        JOIN chats c ON c.id = m.chat_id
        WHERE m.id = ? AND c.user_id = ?
        "#,
    )
    .bind(message_id)
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await
    .context("Failed to look up message owner")?;

    let Some((chat_id, created_at)) = target else {
        return Ok(TailDeletion::NotFound);
    };

    // Position in (created_at, id) order, the same order list_messages uses.
    let result = sqlx::query(
        r#"
        DELETE FROM messages
        WHERE chat_id = ?1 AND (created_at > ?2 OR (created_at = ?2 AND id >= ?3))
        "#,
    )
    .bind(&chat_id)
    .bind(created_at)
    .bind(message_id)
    .execute(&mut *conn)
    .await
    .context("Failed to delete message tail")?;

    debug!(
        "Deleted {} messages from chat {}",
        result.rows_affected(),
        chat_id
    );
    Ok(TailDeletion::Deleted {
        count: result.rows_affected(),
    })
}

/// Insert-or-ignore on the message id.
///
/// The stored `created_at` is bumped past the chat's latest message so that
/// `(created_at, id)` ordering follows insertion order.
async fn insert_if_absent(conn: &mut SqliteConnection, message: &NewMessage) -> Result<bool> {
    let parts = serde_json::to_string(&message.parts).context("Failed to encode message parts")?;

    let result = sqlx::query(
        r#"
        INSERT INTO messages (id, chat_id, role, parts, created_at)
        SELECT ?1, ?2, ?3, ?4,
               MAX(?5, COALESCE((SELECT MAX(created_at) + 1 FROM messages WHERE chat_id = ?2), 0))
        WHERE true
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&message.id)
    .bind(&message.chat_id)
    .bind(message.role.as_str())
    .bind(parts)
    .bind(message.created_at)
    .execute(&mut *conn)
    .await
    .context("Failed to insert message")?;

    Ok(result.rows_affected() == 1)
}

pub(crate) async fn count_assistant_messages_since(
    conn: &mut SqliteConnection,
    user_id: &str,
    since: i64,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM messages m
        JOIN chats c ON c.id = m.chat_id
        WHERE c.user_id = ? AND m.role = ? AND m.created_at >= ?
        "#,
    )
    .bind(user_id)
    .bind(Role::Assistant.as_str())
    .bind(since)
    .fetch_one(&mut *conn)
    .await
    .context("Failed to count assistant messages")?;

    Ok(count)
}
