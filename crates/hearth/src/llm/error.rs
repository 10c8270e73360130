use thiserror::Error;

/// Failures talking to an upstream model.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no provider configured with key {0:?}")]
    UnknownProvider(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stream interrupted: {0}")]
    Stream(String),

    #[error("malformed stream chunk: {0}")]
    Decode(String),

    #[error("upstream error: {0}")]
    Upstream(String),
}
