//! Rolling-window generation quota.
//!
//! Every assistant generation is admitted through [`QuotaGuard::reserve`]. The
//! count of assistant messages in the window plus live reservations may never
//! exceed the limit at the moment a reservation is granted. Admission runs under
//! the SQLite write lock (`BEGIN IMMEDIATE`), so it holds across every process
//! sharing the database file.

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, instrument, warn};

use crate::chat::count_assistant_messages_since;
use crate::db::{now_millis, with_write_lock};
use crate::settings::QuotaConfig;

const MS_PER_MINUTE: i64 = 60 * 1000;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Granted { id: String },
    Denied { used: i64, limit: i64 },
}

/// Quota consumption for one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub used: i64,
    pub in_flight: i64,
    pub limit: i64,
    pub remaining: i64,
    pub window_hours: i64,
}

#[derive(Debug, Clone)]
pub struct QuotaGuard {
    pool: SqlitePool,
    config: QuotaConfig,
}

impl QuotaGuard {
    pub fn new(pool: SqlitePool, config: QuotaConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> QuotaConfig {
        self.config
    }

    /// Try to reserve one generation for `user_id`.
    #[instrument(skip(self))]
    pub async fn reserve(&self, user_id: &str) -> Result<Reservation> {
        let config = self.config;
        let user_id = user_id.to_string();

        with_write_lock(&self.pool, move |conn| {
            Box::pin(async move { reserve_locked(conn, &user_id, config).await })
        })
        .await
    }

    /// Delete a reservation. Unknown ids are ignored.
    #[instrument(skip(self))]
    pub async fn release(&self, reservation_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM assistant_generation_reservations WHERE id = ?")
            .bind(reservation_id)
            .execute(&self.pool)
            .await
            .context("Failed to release reservation")?;

        Ok(())
    }

    /// Release a reservation, logging rather than returning failures.
    pub async fn release_quietly(&self, reservation_id: &str) {
        if let Err(e) = self.release(reservation_id).await {
            warn!(reservation_id, error = %e, "failed to release quota reservation");
        }
    }

    /// Current usage for `user_id`. Expired reservations are not counted.
    #[instrument(skip(self))]
    pub async fn usage(&self, user_id: &str) -> Result<Usage> {
        let now = now_millis();
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("Failed to acquire connection")?;

        let used = count_assistant_messages_since(
            &mut conn,
            user_id,
            now - self.config.window_hours * MS_PER_HOUR,
        )
        .await?;
        let in_flight = count_live_reservations(&mut conn, user_id, now).await?;

        Ok(Usage {
            used,
            in_flight,
            limit: self.config.daily_limit,
            remaining: (self.config.daily_limit - used - in_flight).max(0),
            window_hours: self.config.window_hours,
        })
    }
}

async fn reserve_locked(
    conn: &mut SqliteConnection,
    user_id: &str,
    config: QuotaConfig,
) -> Result<Reservation> {
    let now = now_millis();

    let swept = sqlx::query("DELETE FROM assistant_generation_reservations WHERE expires_at <= ?")
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("Failed to sweep expired reservations")?
        .rows_affected();
    if swept > 0 {
        debug!("Swept {} expired reservations", swept);
    }

    let messages =
        count_assistant_messages_since(conn, user_id, now - config.window_hours * MS_PER_HOUR)
            .await?;
    let live = count_live_reservations(conn, user_id, now).await?;
    let used = messages + live;

    if used >= config.daily_limit {
        debug!(used, limit = config.daily_limit, "quota exhausted");
        return Ok(Reservation::Denied {
            used,
            limit: config.daily_limit,
        });
    }

    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO assistant_generation_reservations (id, user_id, expires_at, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(user_id)
    .bind(now + config.reservation_ttl_minutes * MS_PER_MINUTE)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("Failed to insert reservation")?;

    Ok(Reservation::Granted { id })
}

async fn count_live_reservations(
    conn: &mut SqliteConnection,
    user_id: &str,
    now: i64,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM assistant_generation_reservations WHERE user_id = ? AND expires_at > ?",
    )
    .bind(user_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .context("Failed to count reservations")?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatRepository, NewMessage, Role, text_parts};
    use crate::db::Database;
    use crate::user::UserRepository;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(daily_limit: i64) -> QuotaConfig {
        QuotaConfig {
            daily_limit,
            ..QuotaConfig::default()
        }
    }

    async fn user(db: &Database) -> String {
        UserRepository::new(db.pool().clone())
            .create("quota@example.com", "h")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_reserve_until_limit() {
        let db = Database::in_memory().await.unwrap();
        let user_id = user(&db).await;
        let guard = QuotaGuard::new(db.pool().clone(), config(2));

        assert!(matches!(guard.reserve(&user_id).await.unwrap(), Reservation::Granted { .. }));
        assert!(matches!(guard.reserve(&user_id).await.unwrap(), Reservation::Granted { .. }));
        assert_eq!(
            guard.reserve(&user_id).await.unwrap(),
            Reservation::Denied { used: 2, limit: 2 }
        );
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_frees_slot() {
        let db = Database::in_memory().await.unwrap();
        let user_id = user(&db).await;
        let guard = QuotaGuard::new(db.pool().clone(), config(1));

        let Reservation::Granted { id } = guard.reserve(&user_id).await.unwrap() else {
            panic!("expected grant");
        };
        assert!(matches!(guard.reserve(&user_id).await.unwrap(), Reservation::Denied { .. }));

        guard.release(&id).await.unwrap();
        guard.release(&id).await.unwrap();
        guard.release("never-existed").await.unwrap();

        assert!(matches!(guard.reserve(&user_id).await.unwrap(), Reservation::Granted { .. }));
    }

    #[tokio::test]
    async fn test_assistant_messages_count_against_limit() {
        let db = Database::in_memory().await.unwrap();
        let user_id = user(&db).await;
        let chats = ChatRepository::new(db.pool().clone());
        chats.create_chat("c1", &user_id, "t", "m").await.unwrap();
        chats
            .save_messages(&[
                NewMessage {
                    id: "a1".into(),
                    chat_id: "c1".into(),
                    role: Role::Assistant,
                    parts: text_parts("x"),
                    created_at: now_millis(),
                },
                NewMessage {
                    id: "u1".into(),
                    chat_id: "c1".into(),
                    role: Role::User,
                    parts: text_parts("x"),
                    created_at: now_millis(),
                },
            ])
            .await
            .unwrap();

        let guard = QuotaGuard::new(db.pool().clone(), config(2));
        assert!(matches!(guard.reserve(&user_id).await.unwrap(), Reservation::Granted { .. }));

        let usage = guard.usage(&user_id).await.unwrap();
        assert_eq!(usage.used, 1);
        assert_eq!(usage.in_flight, 1);
        assert_eq!(usage.remaining, 0);

        assert!(matches!(guard.reserve(&user_id).await.unwrap(), Reservation::Denied { .. }));
    }

    #[tokio::test]
    async fn test_expired_reservations_are_swept() {
        let db = Database::in_memory().await.unwrap();
        let user_id = user(&db).await;
        let guard = QuotaGuard::new(db.pool().clone(), config(1));

        sqlx::query(
            "INSERT INTO assistant_generation_reservations (id, user_id, expires_at, created_at) VALUES ('old', ?, ?, 0)",
        )
        .bind(&user_id)
        .bind(now_millis() - 1)
        .execute(db.pool())
        .await
        .unwrap();

        assert!(matches!(guard.reserve(&user_id).await.unwrap(), Reservation::Granted { .. }));

        let remaining: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM assistant_generation_reservations WHERE id = 'old'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_other_users_do_not_share_quota() {
        let db = Database::in_memory().await.unwrap();
        let users = UserRepository::new(db.pool().clone());
        let a = users.create("a@example.com", "h").await.unwrap().id;
        let b = users.create("b@example.com", "h").await.unwrap().id;
        let guard = QuotaGuard::new(db.pool().clone(), config(1));

        assert!(matches!(guard.reserve(&a).await.unwrap(), Reservation::Granted { .. }));
        assert!(matches!(guard.reserve(&b).await.unwrap(), Reservation::Granted { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_exceed_limit() {
        let temp = TempDir::new().unwrap();
        let db = Database::open_path(&temp.path().join("quota.db"), 8, Duration::from_secs(30))
            .await
            .unwrap();
        let user_id = user(&db).await;
        let limit = 5;
        let guard = QuotaGuard::new(db.pool().clone(), config(limit));

        let handles: Vec<_> = (0..limit + 7)
            .map(|_| {
                let guard = guard.clone();
                let user_id = user_id.clone();
                tokio::spawn(async move { guard.reserve(&user_id).await.unwrap() })
            })
            .collect();

        let mut granted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Reservation::Granted { .. }) {
                granted += 1;
            }
        }
        assert_eq!(granted, limit);

        db.close().await;
    }
}
