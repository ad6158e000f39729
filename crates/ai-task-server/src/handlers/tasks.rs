use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::mq::ReviewTask;
use crate::state::AppState;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReviewAccepted {
    pub task_id: String,
}

pub async fn enqueue_review(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReviewRequest>,
) -> Result<(StatusCode, Json<ReviewAccepted>), ApiError> {
    if request.bucket.trim().is_empty() || request.key.trim().is_empty() {
        return Err(ApiError::BadRequest("bucket and key are required".to_string()));
    }

    let task = ReviewTask {
        task_id: request
            .task_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        bucket: request.bucket,
        key: request.key,
        prompt: request.prompt,
        mime_type: request.mime_type,
    };

    state
        .publisher
        .publish(&state.producers.review_requests, &task)
        .await?;
    info!(task_id = %task.task_id, "Review task enqueued");

    Ok((
        StatusCode::ACCEPTED,
        Json(ReviewAccepted {
            task_id: task.task_id,
        }),
    ))
}
