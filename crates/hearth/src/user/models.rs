//! User data models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::millis_to_rfc3339;

/// User entity from database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub failed_login_attempts: i64,
    pub locked_until: Option<i64>,
    pub last_failed_login_at: Option<i64>,
    pub created_at: i64,
}

impl User {
    /// Whether the account is locked at `now` (unix millis).
    pub fn is_locked_at(&self, now: i64) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

/// Public user info (safe to return to clients).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    pub created_at: String,
}

impl From<User> for UserInfo {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            created_at: millis_to_rfc3339(user.created_at),
        }
    }
}

/// Emails are stored trimmed and lowercased; lookups normalise the same way.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
