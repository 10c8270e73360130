use axum::{
    Json,
    extract::State,
    http::{StatusCode, header::SET_COOKIE},
    response::{AppendHeaders, IntoResponse},
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::api::{ApiError, ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::user::UserInfo;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserInfo,
}

/// Exchange email and password for a token, also set as the `auth_token` cookie.
#[instrument(skip(state, request), fields(email = %request.email))]
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = state
        .users
        .authenticate(&request.email, &request.password)
        .await?;

    let token = state.auth.generate_token(&user.id, &user.email)?;
    let cookie = state.auth.session_cookie(&token);

    info!(user_id = %user.id, "User logged in successfully");

    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(LoginResponse {
            token,
            user: user.into(),
        }),
    ))
}

/// Logout endpoint (clears auth cookie).
pub async fn logout(State(state): State<AppState>) -> impl IntoResponse {
    (
        AppendHeaders([(SET_COOKIE, state.auth.clear_cookie())]),
        StatusCode::NO_CONTENT,
    )
}

pub async fn me(State(state): State<AppState>, user: CurrentUser) -> ApiResult<Json<UserInfo>> {
    let stored = state
        .users
        .repository()
        .get(user.id())
        .await?
        .ok_or_else(|| ApiError::unauthorized("User not found"))?;

    Ok(Json(stored.into()))
}
