//! User repository for database operations.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{User, normalize_email};
use crate::db::now_millis;

const USER_COLUMNS: &str = "id, email, password_hash, failed_login_attempts, locked_until, last_failed_login_at, created_at";

/// Outcome of recording a failed login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedLogin {
    pub attempts: i64,
    pub locked_until: Option<i64>,
}

/// Repository for user database operations.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Create a new user repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new user. The email is normalised before storage.
    #[instrument(skip(self, password_hash))]
    pub async fn create(&self, email: &str, password_hash: &str) -> Result<User> {
        let id = uuid::Uuid::new_v4().to_string();
        let email = normalize_email(email);

        debug!("Creating user: {} ({})", email, id);

        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&email)
        .bind(password_hash)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert user")?;

        self.get(&id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User not found after creation"))
    }

    /// Get a user by ID.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;

        Ok(user)
    }

    /// Get a user by email.
    #[instrument(skip(self))]
    pub async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?");
        let user = sqlx::query_as::<_, User>(&sql)
            .bind(normalize_email(email))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by email")?;

        Ok(user)
    }

    /// Record a failed login.
    ///
    /// Failures older than `window_ms` restart the count at one. Reaching
    /// `threshold` locks the account for `window_ms`.
    #[instrument(skip(self))]
    pub async fn record_failed_login(
        &self,
        id: &str,
        threshold: i64,
        window_ms: i64,
    ) -> Result<FailedLogin> {
        let now = now_millis();
        let row: Option<(i64, Option<i64>)> = sqlx::query_as(
            r#"
            UPDATE users
            SET failed_login_attempts = CASE
                    WHEN last_failed_login_at IS NOT NULL AND last_failed_login_at > ?1 - ?2
                    THEN failed_login_attempts + 1
                    ELSE 1
                END,
                last_failed_login_at = ?1
            WHERE id = ?3
            RETURNING failed_login_attempts, locked_until
            "#,
        )
        .bind(now)
        .bind(window_ms)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to record failed login")?;

        let Some((attempts, locked_until)) = row else {
            anyhow::bail!("User not found: {id}");
        };

        if attempts < threshold {
            return Ok(FailedLogin {
                attempts,
                locked_until,
            });
        }

        let until = now + window_ms;
        sqlx::query("UPDATE users SET locked_until = ? WHERE id = ?")
            .bind(until)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to lock user")?;

        Ok(FailedLogin {
            attempts,
            locked_until: Some(until),
        })
    }

    /// Clear the failed login counter and any lock.
    #[instrument(skip(self))]
    pub async fn reset_failed_logins(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE users
            SET failed_login_attempts = 0, locked_until = NULL, last_failed_login_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to reset failed logins")?;

        Ok(())
    }
}
