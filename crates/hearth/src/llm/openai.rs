//! OpenAI-compatible `chat/completions` streaming client.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource, RequestBuilderExt, retry};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{CompletionRequest, DeltaStream, ModelProvider, ProviderError};
use crate::settings::{ProviderConfig, resolve_secret};

/// Sentinel data line that ends an OpenAI-style stream.
const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: &str, config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let api_key = match resolve_secret(config.api_key.as_deref()) {
            Ok(key) => key,
            Err(e) => {
                warn!(provider = name, error = %e, "provider API key unavailable, requests will be unauthenticated");
                None
            }
        };

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<DeltaStream, ProviderError> {
        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
        });

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let mut source = builder
            .eventsource()
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        source.set_retry_policy(Box::new(retry::Never));

        // Surface connection and HTTP status failures before handing out the stream.
        match source.next().await {
            Some(Ok(Event::Open)) => {}
            Some(Ok(Event::Message(message))) => {
                source.close();
                return Err(ProviderError::Decode(format!(
                    "data before stream opened: {}",
                    message.data
                )));
            }
            Some(Err(e)) => {
                source.close();
                return Err(map_eventsource_error(e).await);
            }
            None => return Err(ProviderError::Stream("stream closed before opening".into())),
        }

        debug!(model = %request.model, "upstream stream opened");
        Ok(deltas(source))
    }
}

/// Turn the event source into a stream of non-empty text deltas.
fn deltas(source: EventSource) -> DeltaStream {
    futures::stream::unfold(Some(source), |state| async move {
        let mut source = state?;
        loop {
            match source.next().await {
                Some(Ok(Event::Open)) => continue,
                Some(Ok(Event::Message(message))) => match parse_chunk(&message.data) {
                    Ok(ChunkOutcome::Delta(text)) => return Some((Ok(text), Some(source))),
                    Ok(ChunkOutcome::Skip) => continue,
                    Ok(ChunkOutcome::Done) => {
                        source.close();
                        return None;
                    }
                    Err(e) => {
                        source.close();
                        return Some((Err(e), None));
                    }
                },
                Some(Err(EventSourceError::StreamEnded)) | None => return None,
                Some(Err(e)) => {
                    source.close();
                    return Some((Err(map_eventsource_error(e).await), None));
                }
            }
        }
    })
    .boxed()
}

async fn map_eventsource_error(error: EventSourceError) -> ProviderError {
    match error {
        EventSourceError::InvalidStatusCode(status, response) => ProviderError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        },
        EventSourceError::InvalidContentType(content_type, response) => ProviderError::Status {
            status: response.status().as_u16(),
            body: format!(
                "unexpected content type {:?}: {}",
                content_type,
                response.text().await.unwrap_or_default()
            ),
        },
        EventSourceError::Transport(e) => ProviderError::Request(e.to_string()),
        other => ProviderError::Stream(other.to_string()),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ChunkOutcome {
    Delta(String),
    Skip,
    Done,
}

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    message: String,
}

fn parse_chunk(data: &str) -> Result<ChunkOutcome, ProviderError> {
    let data = data.trim();
    if data == DONE_MARKER {
        return Ok(ChunkOutcome::Done);
    }
    if data.is_empty() {
        return Ok(ChunkOutcome::Skip);
    }

    let chunk: Chunk =
        serde_json::from_str(data).map_err(|e| ProviderError::Decode(e.to_string()))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::Upstream(error.message));
    }

    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect();

    if text.is_empty() {
        Ok(ChunkOutcome::Skip)
    } else {
        Ok(ChunkOutcome::Delta(text))
    }
}
