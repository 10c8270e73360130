//! Authentication configuration.

use serde::{Deserialize, Serialize};

use crate::settings::resolve_secret;

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// JWT secret for HS256, or `env:VAR_NAME`.
    pub jwt_secret: Option<String>,

    /// Lifetime of issued tokens.
    pub token_ttl_hours: i64,

    /// Mark the auth cookie `Secure` (requires HTTPS).
    pub cookie_secure: bool,

    /// Allowed CORS origins. If empty, cross-origin requests are denied.
    pub allowed_origins: Vec<String>,

    /// Failed logins within `lockout_minutes` that lock the account.
    pub lockout_threshold: i64,

    /// Length of both the failure counting window and the lock.
    pub lockout_minutes: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            // No default JWT secret - must be explicitly configured
            jwt_secret: None,
            token_ttl_hours: 24 * 30,
            cookie_secure: false,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            lockout_threshold: 5,
            lockout_minutes: 15,
        }
    }
}

impl AuthConfig {
    /// Resolve the JWT secret, expanding `env:VAR_NAME` syntax.
    pub fn resolve_jwt_secret(&self) -> Result<Option<String>, ConfigValidationError> {
        resolve_secret(self.jwt_secret.as_deref())
            .map_err(|e| ConfigValidationError::UnresolvedSecret(e.to_string()))
    }

    /// Validate the configuration before serving.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let secret = self
            .resolve_jwt_secret()?
            .ok_or(ConfigValidationError::MissingJwtSecret)?;

        if secret.len() < 32 {
            return Err(ConfigValidationError::JwtSecretTooShort);
        }
        if self.token_ttl_hours <= 0 {
            return Err(ConfigValidationError::InvalidTokenTtl);
        }

        Ok(())
    }

    /// Generate a random JWT secret using the OS-backed thread RNG.
    pub fn generate_jwt_secret() -> String {
        use rand::Rng;

        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        const SECRET_LENGTH: usize = 64;

        let mut rng = rand::rng();
        (0..SECRET_LENGTH)
            .map(|_| {
                let idx = rng.random_range(0..CHARSET.len());
                CHARSET[idx] as char
            })
            .collect()
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// JWT secret is required.
    MissingJwtSecret,
    /// JWT secret is shorter than 32 characters.
    JwtSecretTooShort,
    /// `env:` reference could not be resolved.
    UnresolvedSecret(String),
    /// Token lifetime must be positive.
    InvalidTokenTtl,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingJwtSecret => write!(
                f,
                "auth.jwt_secret is required. Run `hearth init` or set HEARTH__AUTH__JWT_SECRET."
            ),
            Self::JwtSecretTooShort => write!(f, "auth.jwt_secret must be at least 32 characters"),
            Self::UnresolvedSecret(msg) => write!(f, "auth.jwt_secret: {msg}"),
            Self::InvalidTokenTtl => write!(f, "auth.token_ttl_hours must be positive"),
        }
    }
}

impl std::error::Error for ConfigValidationError {}
