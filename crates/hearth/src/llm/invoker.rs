//! Routes a model to its provider and shapes the conversation it sees.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument};

use super::{
    ChatMessage, CompletionRequest, DeltaStream, ModelProvider, OpenAiCompatibleProvider,
    ProviderError,
};
use crate::chat::{Message, Role};
use crate::settings::{AppConfig, ModelConfig};

/// Placeholder in the system prompt replaced by the model's display name.
const MODEL_NAME_PLACEHOLDER: &str = "{model_name}";

#[derive(Clone)]
pub struct ModelInvoker {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    system_prompt: String,
}

impl ModelInvoker {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            system_prompt: system_prompt.into(),
        }
    }

    /// One OpenAI-compatible client per configured provider.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let mut invoker = Self::new(config.generation.system_prompt.clone());
        for (name, provider) in &config.providers {
            invoker = invoker.with_provider(
                name.clone(),
                Arc::new(OpenAiCompatibleProvider::new(name, provider)?),
            );
        }
        Ok(invoker)
    }

    pub fn with_provider(mut self, key: impl Into<String>, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.insert(key.into(), provider);
        self
    }

    pub fn has_provider(&self, key: &str) -> bool {
        self.providers.contains_key(key)
    }

    /// Start streaming `model`'s answer to `history`.
    #[instrument(skip(self, model, history), fields(model = %model.id, messages = history.len()))]
    pub async fn stream(
        &self,
        model: &ModelConfig,
        history: &[Message],
    ) -> Result<DeltaStream, ProviderError> {
        let provider = self
            .providers
            .get(&model.provider)
            .ok_or_else(|| ProviderError::UnknownProvider(model.provider.clone()))?;

        let request = CompletionRequest {
            model: model.upstream_model.clone(),
            messages: self.build_messages(model, history),
        };
        debug!(upstream = %request.model, "starting completion");

        provider.stream_completion(request).await
    }

    fn build_messages(&self, model: &ModelConfig, history: &[Message]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 1);

        let system = self.system_prompt.replace(MODEL_NAME_PLACEHOLDER, &model.name);
        if !system.trim().is_empty() {
            messages.push(ChatMessage::new(Role::System, system));
        }

        messages.extend(
            history
                .iter()
                .map(|message| ChatMessage::new(message.role, message.text()))
                .filter(|message| !message.content.is_empty()),
        );

        messages
    }
}
