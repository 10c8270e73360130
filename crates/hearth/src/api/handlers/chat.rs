//! Chat turn, history and message maintenance handlers.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderName, HeaderValue},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::chat::{ChatView, MessageView, TailDeletion};
use crate::turn::{ChatTurnRequest, TurnError};

/// Marks the body as a UI message stream for clients that negotiate on it.
const UI_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";

/// Terminal line of every chat stream.
const DONE_DATA: &str = "[DONE]";

/// Run one chat turn and stream the answer as server-sent events.
#[instrument(skip(state, user, body), fields(user_id = %user.id()))]
pub async fn post_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    body: Bytes,
) -> Result<Response, TurnError> {
    let request = ChatTurnRequest::from_slice(&body)?;
    let turn = state.reconciler.reconcile(user.id(), request).await?;

    let events = state
        .relay
        .start(turn)
        .map(|event| Event::default().json_data(event))
        .chain(futures::stream::once(async {
            Ok::<_, axum::Error>(Event::default().data(DONE_DATA))
        }));

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
        .into_response();
    response.headers_mut().insert(
        HeaderName::from_static(UI_STREAM_HEADER),
        HeaderValue::from_static("v1"),
    );
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct DeleteChatQuery {
    pub id: Option<String>,
}

/// Delete one of the caller's chats, stopping its generation if one is running.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn delete_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Query(query): Query<DeleteChatQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let chat_id = query
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing chat id"))?;

    state.active.cancel(&chat_id, user.id());
    if !state.chats.delete_chat(&chat_id, user.id()).await? {
        return Err(ApiError::not_found(format!("chat {chat_id}")));
    }

    info!(chat_id = %chat_id, "Deleted chat");
    Ok(Json(serde_json::json!({ "success": true })))
}

#[derive(Debug, Serialize)]
pub struct ChatDetail {
    pub chat: ChatView,
    pub messages: Vec<MessageView>,
}

/// A chat with its messages in conversation order.
pub async fn get_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<ChatDetail>> {
    let chat = state
        .chats
        .get_chat(&chat_id)
        .await?
        .filter(|chat| chat.user_id == user.id())
        .ok_or_else(|| ApiError::not_found(format!("chat {chat_id}")))?;

    let messages = state.chats.list_messages(&chat.id).await?;

    Ok(Json(ChatDetail {
        chat: chat.into(),
        messages: messages.into_iter().map(MessageView::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped: bool,
}

/// Stop the running generation of a chat. The partial answer is kept.
pub async fn stop_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(chat_id): Path<String>,
) -> Json<StopResponse> {
    let stopped = state.active.cancel(&chat_id, user.id());
    if stopped {
        info!(chat_id = %chat_id, "Stop requested");
    }
    Json(StopResponse { stopped })
}

/// The caller's chats, most recent first.
pub async fn history(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<ChatView>>> {
    let chats = state.chats.list_chats_for_user(user.id()).await?;
    Ok(Json(chats.into_iter().map(ChatView::from).collect()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrailingDeleteResponse {
    pub ok: bool,
    pub deleted_count: u64,
}

/// Delete a message and every later message in its chat.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn delete_trailing_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(message_id): Path<String>,
) -> ApiResult<Json<TrailingDeleteResponse>> {
    match state
        .chats
        .delete_message_tail_for_user(user.id(), &message_id)
        .await?
    {
        TailDeletion::Deleted { count } => Ok(Json(TrailingDeleteResponse {
            ok: true,
            deleted_count: count,
        })),
        TailDeletion::NotFound => Err(ApiError::not_found(format!("message {message_id}"))),
    }
}
