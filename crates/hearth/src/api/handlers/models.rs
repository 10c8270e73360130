use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::{ApiResult, AppState};
use crate::auth::CurrentUser;
use crate::quota::Usage;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsResponse {
    pub default_model: String,
    pub models: Vec<ModelSummary>,
}

/// Selectable chat models.
pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let models = state
        .registry
        .models()
        .iter()
        .map(|model| ModelSummary {
            id: model.id.clone(),
            name: model.name.clone(),
            description: model.description.clone(),
        })
        .collect();

    Json(ModelsResponse {
        default_model: state.registry.default_model().id.clone(),
        models,
    })
}

/// Generation quota consumed by the caller in the current window.
pub async fn usage(State(state): State<AppState>, user: CurrentUser) -> ApiResult<Json<Usage>> {
    Ok(Json(state.quota.usage(user.id()).await?))
}
