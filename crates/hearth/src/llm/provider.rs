use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

use super::ProviderError;
use crate::chat::Role;

/// A live sequence of text deltas.
pub type DeltaStream = BoxStream<'static, Result<String, ProviderError>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One streaming completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model name as the upstream knows it.
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

/// A streaming text-completion backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Start a completion.
    ///
    /// An `Err` here, or as the first stream item, means the model produced no output.
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<DeltaStream, ProviderError>;
}
