use axum::extract::State;
use axum::response::Json;
use serde::Serialize;

use crate::gateway_util::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub cost: u32,
    pub requires_login: bool,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
}

/// Public pricing table. Provider paths stay server-side.
pub async fn list_models_handler(State(app_state): AppState) -> Json<ModelsResponse> {
    let models = app_state
        .config
        .models
        .iter()
        .map(|(id, model)| ModelInfo {
            id: id.clone(),
            display_name: model.display_name.clone().unwrap_or_else(|| id.clone()),
            cost: model.cost,
            requires_login: model.requires_login,
        })
        .collect();
    Json(ModelsResponse { models })
}
