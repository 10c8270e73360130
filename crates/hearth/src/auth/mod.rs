//! Authentication module.
//!
//! Provides HS256 JWT validation middleware. Tokens are accepted from the
//! `Authorization: Bearer` header or the `auth_token` cookie.

mod claims;
mod config;
mod error;
mod middleware;
mod password;

pub use claims::Claims;
pub use config::{AuthConfig, ConfigValidationError};
pub use error::AuthError;
pub use middleware::{AUTH_COOKIE_NAME, AuthState, CurrentUser, auth_middleware};
pub use password::{hash_password, verify_password};
