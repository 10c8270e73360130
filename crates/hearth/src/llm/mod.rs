//! Model access: the registry of selectable models, the provider seam and the
//! invoker that routes a model to its provider.

mod error;
mod invoker;
mod openai;
mod provider;
mod registry;

pub use error::ProviderError;
pub use invoker::ModelInvoker;
pub use openai::OpenAiCompatibleProvider;
pub use provider::{ChatMessage, CompletionRequest, DeltaStream, ModelProvider};
pub use registry::ModelRegistry;
