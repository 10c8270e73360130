//! Drives one generation and relays it to the client as stream events.
//!
//! The generation runs on its own task and feeds a bounded channel that the
//! HTTP response drains. It ends on completion, upstream failure, client
//! disconnect, an explicit stop or the duration limit; every ending runs the
//! same cleanup: persist what should be kept, then release the reservation.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{ActiveGenerations, PreparedTurn};
use crate::chat::{ChatRepository, Message, NewMessage, Role, text_parts};
use crate::db::now_millis;
use crate::llm::{DeltaStream, ModelInvoker, ModelRegistry, ProviderError};
use crate::quota::QuotaGuard;
use crate::settings::ModelConfig;

const CHANNEL_CAPACITY: usize = 64;

const INTERRUPTED_TEXT: &str = "The response was interrupted. Please try again.";

/// One event of the outbound wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    Start {
        #[serde(rename = "messageId")]
        message_id: String,
    },
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    Finish,
    Abort,
    Error {
        #[serde(rename = "errorText")]
        error_text: String,
    },
}

fn unavailable_text(model: &ModelConfig) -> String {
    format!(
        "Model {} is currently unavailable. Try choosing another model.",
        model.name
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Completed,
    Cancelled,
    TimedOut,
    Disconnected,
    /// No model produced output.
    Unavailable,
    /// The upstream failed after output started.
    Interrupted,
}

impl Ending {
    /// Whether the streamed text is stored as the assistant message.
    fn keeps_text(self, text: &str) -> bool {
        match self {
            Ending::Completed => true,
            Ending::Cancelled | Ending::TimedOut | Ending::Disconnected => !text.is_empty(),
            Ending::Unavailable | Ending::Interrupted => false,
        }
    }
}

#[derive(Clone)]
pub struct StreamRelay {
    chats: ChatRepository,
    quota: QuotaGuard,
    invoker: Arc<ModelInvoker>,
    registry: Arc<ModelRegistry>,
    active: ActiveGenerations,
    max_duration: Duration,
}

impl StreamRelay {
    pub fn new(
        chats: ChatRepository,
        quota: QuotaGuard,
        invoker: Arc<ModelInvoker>,
        registry: Arc<ModelRegistry>,
        active: ActiveGenerations,
        max_duration: Duration,
    ) -> Self {
        Self {
            chats,
            quota,
            invoker,
            registry,
            active,
            max_duration,
        }
    }

    /// Spawn the generation for `turn` and return its event stream.
    ///
    /// The stream ends after the assistant message is persisted and the
    /// reservation released.
    pub fn start(&self, turn: PreparedTurn) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let relay = self.clone();
        let span = info_span!("generation", chat_id = %turn.chat_id, model = %turn.model.id);

        tokio::spawn(async move { relay.run(turn, tx).await }.instrument(span));

        ReceiverStream::new(rx)
    }

    async fn run(self, turn: PreparedTurn, tx: mpsc::Sender<StreamEvent>) {
        let message_id = uuid::Uuid::new_v4().to_string();
        let token = self
            .active
            .register(&turn.chat_id, &turn.user_id, &message_id);

        let mut text = String::new();
        let ending = self
            .generate(&turn, &message_id, &tx, &token, &mut text)
            .await;
        info!(?ending, chars = text.len(), "generation ended");

        if ending.keeps_text(&text) {
            self.persist(&turn, &message_id, &text).await;
        }
        self.quota.release_quietly(&turn.reservation_id).await;
        self.active.finish(&turn.chat_id, &message_id);

        drop(tx);
    }

    async fn generate(
        &self,
        turn: &PreparedTurn,
        message_id: &str,
        tx: &mpsc::Sender<StreamEvent>,
        token: &CancellationToken,
        text: &mut String,
    ) -> Ending {
        let deadline = tokio::time::sleep(self.max_duration);
        tokio::pin!(deadline);

        let start = StreamEvent::Start {
            message_id: message_id.to_string(),
        };
        if tx.send(start).await.is_err() {
            return Ending::Disconnected;
        }

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => return finish(tx, Ending::Cancelled, None).await,
            _ = tx.closed() => return Ending::Disconnected,
            _ = &mut deadline => return finish(tx, Ending::TimedOut, None).await,
            opened = self.open_with_fallback(turn) => opened,
        };

        let Some((first, mut stream)) = opened else {
            let event = StreamEvent::Error {
                error_text: unavailable_text(&turn.model),
            };
            let _ = tx.send(event).await;
            return Ending::Unavailable;
        };

        let text_id = uuid::Uuid::new_v4().to_string();
        let mut text_open = false;

        if let Some(delta) = first
            && !push_delta(tx, &text_id, &mut text_open, text, delta).await
        {
            return Ending::Disconnected;
        }

        let ending = loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => break Ending::Cancelled,
                _ = tx.closed() => break Ending::Disconnected,
                _ = &mut deadline => break Ending::TimedOut,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(delta)) => {
                    if !push_delta(tx, &text_id, &mut text_open, text, delta).await {
                        break Ending::Disconnected;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "upstream stream failed mid-response");
                    break Ending::Interrupted;
                }
                None => break Ending::Completed,
            }
        };

        let open_id = text_open.then_some(text_id.as_str());
        finish(tx, ending, open_id).await
    }

    /// Open the requested model, or its fallback once if the request fails
    /// before any output. `None` when neither produced a stream.
    async fn open_with_fallback(
        &self,
        turn: &PreparedTurn,
    ) -> Option<(Option<String>, DeltaStream)> {
        let primary_error = match self.open(&turn.model, &turn.history).await {
            Ok(opened) => return Some(opened),
            Err(e) => e,
        };

        let Some(fallback) = self.registry.fallback_for(&turn.model.id) else {
            error!(model = %turn.model.id, error = %primary_error, "model unavailable");
            return None;
        };

        match self.open(fallback, &turn.history).await {
            Ok(opened) => {
                warn!(
                    model = %turn.model.id,
                    fallback = %fallback.id,
                    error = %primary_error,
                    "primary model unavailable, falling back"
                );
                Some(opened)
            }
            Err(fallback_error) => {
                error!(
                    model = %turn.model.id,
                    fallback = %fallback.id,
                    error = %primary_error,
                    %fallback_error,
                    "fallback model unavailable after primary failure"
                );
                None
            }
        }
    }

    /// Start a stream and wait for its first item, so that a failure before
    /// any output is reported as an error rather than an empty answer.
    async fn open(
        &self,
        model: &ModelConfig,
        history: &[Message],
    ) -> Result<(Option<String>, DeltaStream), ProviderError> {
        let mut stream = self.invoker.stream(model, history).await?;
        match stream.next().await {
            Some(Ok(delta)) => Ok((Some(delta), stream)),
            Some(Err(e)) => Err(e),
            None => Ok((None, stream)),
        }
    }

    async fn persist(&self, turn: &PreparedTurn, message_id: &str, text: &str) {
        let message = NewMessage {
            id: message_id.to_string(),
            chat_id: turn.chat_id.clone(),
            role: Role::Assistant,
            parts: text_parts(text),
            created_at: now_millis(),
        };

        match self.chats.save_messages(&[message]).await {
            Ok(_) => debug!(message_id, "stored assistant message"),
            Err(e) => error!(message_id, error = %format!("{e:#}"), "failed to store assistant message"),
        }
    }
}

/// Forward one delta, opening the text block on first use.
/// Returns false when the client has gone away.
async fn push_delta(
    tx: &mpsc::Sender<StreamEvent>,
    text_id: &str,
    text_open: &mut bool,
    text: &mut String,
    delta: String,
) -> bool {
    if delta.is_empty() {
        return true;
    }

    if !*text_open {
        let open = StreamEvent::TextStart {
            id: text_id.to_string(),
        };
        if tx.send(open).await.is_err() {
            return false;
        }
        *text_open = true;
    }

    text.push_str(&delta);
    let event = StreamEvent::TextDelta {
        id: text_id.to_string(),
        delta,
    };
    tx.send(event).await.is_ok()
}

/// Emit the closing events for `ending`. Send failures are ignored: the
/// ending is already decided.
async fn finish(tx: &mpsc::Sender<StreamEvent>, ending: Ending, open_text: Option<&str>) -> Ending {
    if ending == Ending::Disconnected {
        return ending;
    }

    if let Some(id) = open_text
        && ending != Ending::Interrupted
    {
        let _ = tx.send(StreamEvent::TextEnd { id: id.to_string() }).await;
    }

    let last = match ending {
        Ending::Completed => StreamEvent::Finish,
        Ending::Cancelled | Ending::TimedOut => StreamEvent::Abort,
        Ending::Interrupted => StreamEvent::Error {
            error_text: INTERRUPTED_TEXT.to_string(),
        },
        Ending::Unavailable | Ending::Disconnected => return ending,
    };
    let _ = tx.send(last).await;

    ending
}
