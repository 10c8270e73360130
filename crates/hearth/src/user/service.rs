//! Account provisioning and credential checks.

use anyhow::{Result, bail};
use log::{info, warn};

use super::models::{User, normalize_email};
use super::repository::UserRepository;
use crate::auth::{AuthError, hash_password, verify_password};
use crate::db::now_millis;

/// Minimum accepted password length.
const MIN_PASSWORD_LEN: usize = 8;

/// Failed-login lockout parameters.
#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub threshold: i64,
    pub window_minutes: i64,
}

impl LockoutPolicy {
    fn window_ms(&self) -> i64 {
        self.window_minutes * 60 * 1000
    }
}

#[derive(Debug, Clone)]
pub struct UserService {
    repo: UserRepository,
    lockout: LockoutPolicy,
}

impl UserService {
    pub fn new(repo: UserRepository, lockout: LockoutPolicy) -> Self {
        Self { repo, lockout }
    }

    pub fn repository(&self) -> &UserRepository {
        &self.repo
    }

    /// Create an account with a bcrypt-hashed password.
    pub async fn register(&self, email: &str, password: &str) -> Result<User> {
        let email = normalize_email(email);
        if email.is_empty() || !email.contains('@') {
            bail!("invalid email address: {email:?}");
        }
        if password.len() < MIN_PASSWORD_LEN {
            bail!("password must be at least {MIN_PASSWORD_LEN} characters");
        }
        if self.repo.get_by_email(&email).await?.is_some() {
            bail!("a user with email {email} already exists");
        }

        let hash = hash_password(password)?;
        let user = self.repo.create(&email, &hash).await?;
        info!("Created user {} ({})", user.email, user.id);
        Ok(user)
    }

    /// Check an email and password, applying the lockout policy.
    ///
    /// Unknown emails and wrong passwords return the same error.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let user = self
            .repo
            .get_by_email(email)
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .ok_or(AuthError::InvalidCredentials)?;

        if user.is_locked_at(now_millis()) {
            warn!("Login attempt for locked account {}", user.id);
            return Err(AuthError::AccountLocked);
        }

        if !verify_password(password, &user.password_hash) {
            let outcome = self
                .repo
                .record_failed_login(&user.id, self.lockout.threshold, self.lockout.window_ms())
                .await
                .map_err(|e| AuthError::Internal(e.to_string()))?;
            if outcome.locked_until.is_some() {
                warn!(
                    "Locking account {} after {} failed logins",
                    user.id, outcome.attempts
                );
                return Err(AuthError::AccountLocked);
            }
            return Err(AuthError::InvalidCredentials);
        }

        if user.failed_login_attempts > 0 || user.locked_until.is_some() {
            self.repo
                .reset_failed_logins(&user.id)
                .await
                .map_err(|e| AuthError::Internal(e.to_string()))?;
        }

        Ok(user)
    }
}
