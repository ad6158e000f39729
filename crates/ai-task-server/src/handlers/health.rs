use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::mq::BrokerHealth;
use crate::state::AppState;
use crate::utils::metrics::MetricsSnapshot;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    status: String,
    broker: BrokerHealth,
    contexts: usize,
    metrics: MetricsSnapshot,
}

pub async fn root() -> Json<Value> {
    Json(json!({ "Hello": "World" }))
}

pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// Ready only while the broker connection is up
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let broker = state.broker_health.borrow().clone();
    let (status, label) = if broker.is_connected() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };

    (
        status,
        Json(ReadinessResponse {
            status: label.to_string(),
            broker,
            contexts: state.completions.configured_keys(),
            metrics: state.metrics.snapshot(),
        }),
    )
}
