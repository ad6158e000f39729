use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::mq::BrokerError;
use crate::services::context::ContextError;
use crate::services::gemini::ProviderError;

/// Raised while assembling the process; always fatal.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Missing configuration value: {0}")]
    Missing(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Context not registered: {0}")]
    NotRegistered(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Broker error: {0}")]
    BrokerError(String),

    #[error("LLM error: {0}")]
    LlmError(String),
}

impl From<ContextError> for ApiError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::NotRegistered(key) => ApiError::NotRegistered(key),
            ContextError::InvalidConfig(msg) => ApiError::BadRequest(msg),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        ApiError::LlmError(err.to_string())
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Encode(e) => {
                ApiError::BadRequest(format!("Payload is not encodable: {}", e))
            }
            other => ApiError::BrokerError(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::NotRegistered(key) => {
                tracing::warn!("Context key not registered: {}", key);
                (
                    StatusCode::NOT_FOUND,
                    "NotRegistered",
                    format!("Context key {} not found", key),
                )
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, "BadRequest", msg)
            }
            ApiError::BrokerError(msg) => {
                tracing::error!("Broker error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "BrokerError", msg)
            }
            ApiError::LlmError(msg) => {
                tracing::error!("LLM error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "LlmError", msg)
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
