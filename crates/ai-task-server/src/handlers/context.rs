use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::services::context::ContextConfig;
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Serialize)]
pub struct ConfigureResponse {
    pub key: String,
    /// false when the key already had a configuration (it is kept as is)
    pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct ContextStatus {
    pub key: String,
    pub configured: bool,
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub response: String,
}

pub async fn configure_context(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(config): Json<ContextConfig>,
) -> Result<(StatusCode, Json<ConfigureResponse>), ApiError> {
    let created = state.completions.configure(&key, config)?;
    if created {
        info!(key = %key, "Context configured");
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ConfigureResponse { key, created })))
}

pub async fn context_status(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<ContextStatus> {
    let configured = state.completions.is_configured(&key);
    Json(ContextStatus { key, configured })
}

pub async fn complete(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(request): Json<CompletionRequest>,
) -> Result<Json<CompletionResponse>, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".to_string()));
    }

    let response = state
        .completions
        .render_and_complete(&key, &request.prompt, request.metadata)
        .await?;

    Ok(Json(CompletionResponse { response }))
}
