use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{debug, error};

use crate::api::ErrorResponse;

/// Why a chat turn was rejected before streaming began.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("{0}")]
    InvalidUserMessage(String),

    #[error("chat not found")]
    NotFound,

    #[error("this message was already sent")]
    DuplicateMessage,

    #[error("the chat changed in another window, reload and try again")]
    ChatStateConflict,

    #[error("daily limit of {limit} messages reached, try again later")]
    TooManyRequests { limit: i64 },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl TurnError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::UnknownModel(_) | Self::InvalidUserMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DuplicateMessage | Self::ChatStateConflict => StatusCode::CONFLICT,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::UnknownModel(_) => "unknown_model",
            Self::InvalidUserMessage(_) => "invalid_user_message",
            Self::NotFound => "not_found",
            Self::DuplicateMessage => "duplicate_message",
            Self::ChatStateConflict => "chat_state_conflict",
            Self::TooManyRequests { .. } => "daily_limit_exceeded",
            Self::Storage(_) => "internal_error",
        }
    }
}

impl IntoResponse for TurnError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        let message = match &self {
            Self::Storage(e) => {
                error!(error_code = code, error = %format!("{e:#}"), "chat turn failed");
                "internal server error".to_string()
            }
            other => {
                debug!(error_code = code, message = %other, "chat turn rejected");
                other.to_string()
            }
        };

        let body = ErrorResponse {
            error: message,
            code,
            details: None,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TurnError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(TurnError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(TurnError::DuplicateMessage.status_code(), StatusCode::CONFLICT);
        assert_eq!(TurnError::ChatStateConflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            TurnError::TooManyRequests { limit: 1 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            TurnError::Storage(anyhow::anyhow!("disk")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_codes_are_distinct_for_conflicts() {
        assert_eq!(TurnError::DuplicateMessage.error_code(), "duplicate_message");
        assert_eq!(TurnError::ChatStateConflict.error_code(), "chat_state_conflict");
        assert_eq!(
            TurnError::TooManyRequests { limit: 200 }.error_code(),
            "daily_limit_exceeded"
        );
    }
}
