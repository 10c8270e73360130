//! Authentication middleware.

use axum::{
    extract::{FromRequestParts, State},
    http::{
        header::{AUTHORIZATION, COOKIE},
        request::Parts,
    },
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};
use std::sync::Arc;

use super::{AuthConfig, AuthError, Claims};
use crate::user::UserRepository;

/// Cookie carrying the session token for browser clients.
pub const AUTH_COOKIE_NAME: &str = "auth_token";

const TOKEN_ISSUER: &str = "hearth";

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() {
        return Err(AuthError::InvalidAuthHeader);
    }

    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    keys: Option<(EncodingKey, DecodingKey)>,
    users: UserRepository,
}

impl AuthState {
    /// Create new auth state from config.
    /// Resolves `env:VAR_NAME` syntax in jwt_secret at construction time.
    pub fn new(mut config: AuthConfig, users: UserRepository) -> Self {
        if let Ok(Some(resolved)) = config.resolve_jwt_secret() {
            config.jwt_secret = Some(resolved);
        }

        let keys = config.jwt_secret.as_ref().map(|s| {
            (
                EncodingKey::from_secret(s.as_bytes()),
                DecodingKey::from_secret(s.as_bytes()),
            )
        });

        Self {
            config: Arc::new(config),
            keys,
            users,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Get allowed CORS origins from config.
    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    /// Validate a JWT token.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let (_, decoding_key) = self
            .keys
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    /// Generate a JWT token for a user.
    pub fn generate_token(&self, user_id: &str, email: &str) -> Result<String, AuthError> {
        let (encoding_key, _) = self
            .keys
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + 3600 * self.config.token_ttl_hours,
            iat: Some(now),
            iss: Some(TOKEN_ISSUER.to_string()),
            email: Some(email.to_string()),
        };

        encode(&Header::default(), &claims, encoding_key)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    /// Token lifetime in seconds, used for the cookie `Max-Age`.
    pub fn token_ttl_secs(&self) -> i64 {
        self.config.token_ttl_hours * 3600
    }

    /// Build the `Set-Cookie` value for a freshly issued token.
    pub fn session_cookie(&self, token: &str) -> String {
        let secure = if self.config.cookie_secure { "; Secure" } else { "" };
        format!(
            "{AUTH_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}{secure}",
            self.token_ttl_secs()
        )
    }

    /// Build the `Set-Cookie` value that clears the session.
    pub fn clear_cookie(&self) -> String {
        let secure = if self.config.cookie_secure { "; Secure" } else { "" };
        format!("{AUTH_COOKIE_NAME}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0{secure}")
    }
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    /// User claims.
    pub claims: Claims,
}

impl CurrentUser {
    /// Get the user ID.
    pub fn id(&self) -> &str {
        &self.claims.sub
    }

    /// Get display name.
    pub fn display_name(&self) -> &str {
        self.claims.display_name()
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Authentication middleware.
///
/// Validates JWT tokens and injects `CurrentUser` into request extensions.
/// Supports, in priority order:
/// 1. Authorization: Bearer <token> header
/// 2. auth_token cookie
///
/// A valid token whose subject no longer exists is rejected.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let cookie_token = req
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie_header| token_from_cookie_header(cookie_header, AUTH_COOKIE_NAME));

    let claims = if let Some(header) = auth_header {
        let token = bearer_token_from_header(header)?;
        auth.validate_token(token)?
    } else if let Some(token) = cookie_token {
        auth.validate_token(token)?
    } else {
        return Err(AuthError::MissingAuthHeader);
    };

    let exists = auth
        .users
        .get(&claims.sub)
        .await
        .map_err(|e| AuthError::Internal(e.to_string()))?
        .is_some();
    if !exists {
        debug!("Token subject {} no longer exists", claims.sub);
        return Err(AuthError::UserNotFound);
    }

    req.extensions_mut().insert(CurrentUser { claims });

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const TEST_SECRET: &str = "test-secret-for-unit-tests-minimum-32-chars-long";

    async fn state_with(config: AuthConfig) -> AuthState {
        let db = Database::in_memory().await.unwrap();
        AuthState::new(config, UserRepository::new(db.pool().clone()))
    }

    #[test]
    fn test_bearer_token_from_header_valid() {
        assert_eq!(
            bearer_token_from_header("Bearer abc.def.ghi").unwrap(),
            "abc.def.ghi"
        );
        assert_eq!(
            bearer_token_from_header("bearer   token123").unwrap(),
            "token123"
        );
    }

    #[test]
    fn test_bearer_token_from_header_invalid() {
        let cases = ["", "Bearer", "Bearer ", "Token something", "Bearer token extra"];

        for case in cases {
            assert!(
                bearer_token_from_header(case).is_err(),
                "{case} should fail"
            );
        }
    }

    #[test]
    fn test_token_from_cookie_header() {
        assert_eq!(
            token_from_cookie_header("theme=dark; auth_token=abc; other=1", AUTH_COOKIE_NAME),
            Some("abc")
        );
        assert_eq!(token_from_cookie_header("theme=dark", AUTH_COOKIE_NAME), None);
    }

    #[tokio::test]
    async fn test_generate_and_validate_token() {
        let state = state_with(AuthConfig {
            jwt_secret: Some(TEST_SECRET.to_string()),
            ..AuthConfig::default()
        })
        .await;

        let token = state.generate_token("usr-1", "mum@example.com").unwrap();
        let claims = state.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "usr-1");
        assert_eq!(claims.email.as_deref(), Some("mum@example.com"));
        assert_eq!(claims.iss.as_deref(), Some("hearth"));
    }

    #[tokio::test]
    async fn test_token_signed_with_other_secret_rejected() {
        let issuer = state_with(AuthConfig {
            jwt_secret: Some("another-secret-that-is-also-32-chars-or-more".to_string()),
            ..AuthConfig::default()
        })
        .await;
        let verifier = state_with(AuthConfig {
            jwt_secret: Some(TEST_SECRET.to_string()),
            ..AuthConfig::default()
        })
        .await;

        let token = issuer.generate_token("usr-1", "a@b.c").unwrap();
        assert!(matches!(
            verifier.validate_token(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let state = state_with(AuthConfig {
            jwt_secret: Some(TEST_SECRET.to_string()),
            token_ttl_hours: -1,
            ..AuthConfig::default()
        })
        .await;

        let token = state.generate_token("usr-1", "a@b.c").unwrap();
        assert!(matches!(
            state.validate_token(&token),
            Err(AuthError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_no_secret_is_internal_error() {
        let state = state_with(AuthConfig::default()).await;
        assert!(matches!(
            state.validate_token("abc"),
            Err(AuthError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_cookies() {
        let state = state_with(AuthConfig {
            jwt_secret: Some(TEST_SECRET.to_string()),
            cookie_secure: true,
            token_ttl_hours: 1,
            ..AuthConfig::default()
        })
        .await;

        let cookie = state.session_cookie("tok");
        assert!(cookie.starts_with("auth_token=tok;"));
        assert!(cookie.contains("Max-Age=3600"));
        assert!(cookie.ends_with("; Secure"));
        assert!(state.clear_cookie().contains("Max-Age=0"));
    }

    #[test]
    fn test_current_user() {
        let user = CurrentUser {
            claims: Claims {
                sub: "user1".to_string(),
                exp: Utc::now().timestamp() + 3600,
                iat: None,
                iss: None,
                email: Some("user@example.com".to_string()),
            },
        };
        assert_eq!(user.id(), "user1");
        assert_eq!(user.display_name(), "user@example.com");
    }
}
