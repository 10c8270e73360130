//! Test utilities and common setup.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, Response, header},
};
use futures::StreamExt;
use hearth::api::{self, AppState};
use hearth::db::Database;
use hearth::llm::{CompletionRequest, DeltaStream, ModelInvoker, ModelProvider, ProviderError};
use hearth::settings::AppConfig;
use serde_json::{Value, json};
use tower::ServiceExt;

pub const PRO: &str = "google/gemini-3-pro-preview";
pub const FLASH_3: &str = "google/gemini-3-flash-preview";
pub const FLASH: &str = "google/gemini-2.5-flash";

pub const PASSWORD: &str = "correct-horse-battery";

/// Upstream stand-in keyed by upstream model name. Unscripted models fail
/// with a 503 before producing output.
#[derive(Default)]
pub struct MockProvider {
    replies: HashMap<String, Vec<String>>,
    hanging: HashMap<String, Vec<String>>,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn reply(mut self, upstream_model: &str, deltas: &[&str]) -> Self {
        self.replies.insert(
            upstream_model.to_string(),
            deltas.iter().map(|d| d.to_string()).collect(),
        );
        self
    }

    /// Emit `deltas`, then stall without finishing.
    pub fn hang(mut self, upstream_model: &str, deltas: &[&str]) -> Self {
        self.hanging.insert(
            upstream_model.to_string(),
            deltas.iter().map(|d| d.to_string()).collect(),
        );
        self
    }

    pub fn calls(&self) -> Vec<CompletionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
    ) -> Result<DeltaStream, ProviderError> {
        let reply = self.replies.get(&request.model).cloned();
        let stall = self.hanging.get(&request.model).cloned();
        self.calls.lock().unwrap().push(request);
        if let Some(deltas) = stall {
            return Ok(futures::stream::iter(deltas.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed());
        }
        match reply {
            Some(deltas) => Ok(futures::stream::iter(deltas.into_iter().map(Ok)).boxed()),
            None => Err(ProviderError::Status {
                status: 503,
                body: "model overloaded".into(),
            }),
        }
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub provider: Arc<MockProvider>,
}

/// Config used by every test: fixed JWT secret, default models.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.jwt_secret = Some("test-secret-for-integration-tests-minimum-32-chars".to_string());
    config
}

pub async fn test_app(provider: MockProvider) -> TestApp {
    test_app_with_config(test_config(), provider).await
}

pub async fn test_app_with_config(config: AppConfig, provider: MockProvider) -> TestApp {
    let provider = Arc::new(provider);
    let invoker = ModelInvoker::new(config.generation.system_prompt.clone())
        .with_provider("google", provider.clone());
    let db = Database::in_memory().await.expect("in-memory database");
    let state = AppState::new(&config, db, invoker).expect("app state");
    let router = api::create_router(state.clone(), config.server.max_body_mb);

    TestApp {
        router,
        state,
        provider,
    }
}

impl TestApp {
    /// Create a user and return `(user_id, bearer token)`.
    pub async fn user(&self, email: &str) -> (String, String) {
        let user = self
            .state
            .users
            .register(email, PASSWORD)
            .await
            .expect("register user");
        let token = self
            .state
            .auth
            .generate_token(&user.id, &user.email)
            .expect("mint token");
        (user.id, token)
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Response<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => Body::empty(),
        };

        self.router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    /// POST a chat turn and return the status with the parsed SSE payloads.
    pub async fn send_turn(&self, token: &str, body: Value) -> (u16, Vec<Value>) {
        let response = self
            .request(Method::POST, "/api/chat", Some(token), Some(body))
            .await;
        let status = response.status().as_u16();
        let text = body_text(response).await;
        (status, sse_payloads(&text))
    }
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 4 * 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_text(response).await).unwrap()
}

/// Parse `data:` lines. The terminal `[DONE]` marker is returned as a JSON string.
pub fn sse_payloads(text: &str) -> Vec<Value> {
    text.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .map(|data| serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string())))
        .collect()
}

pub fn event_types(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            Value::String(marker) => marker.clone(),
            other => other["type"].as_str().unwrap_or_default().to_string(),
        })
        .collect()
}

pub fn streamed_text(events: &[Value]) -> String {
    events
        .iter()
        .filter(|event| event["type"] == "text-delta")
        .filter_map(|event| event["delta"].as_str())
        .collect()
}

pub fn user_message(id: &str, text: &str) -> Value {
    json!({ "id": id, "role": "user", "parts": [{ "type": "text", "text": text }] })
}

pub fn assistant_message(id: &str, text: &str) -> Value {
    json!({ "id": id, "role": "assistant", "parts": [{ "type": "text", "text": text }] })
}

pub fn turn(chat_id: &str, model: &str, messages: Vec<Value>) -> Value {
    json!({
        "id": chat_id,
        "selectedChatModel": model,
        "messages": messages,
    })
}

pub fn new_chat_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
