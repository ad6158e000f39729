use ai_task_server::build_router;
use ai_task_server::config::Settings;
use ai_task_server::mq::{
    BindingRegistry, Broker, BrokerConnector, BrokerHealth, ExchangeKind, MemoryBroker,
    MessagePublisher, Producers,
};
use ai_task_server::services::gemini::{GenerateRequest, ModelClient, ProviderError};
use ai_task_server::services::{CompletionService, ContextStore};
use ai_task_server::state::AppState;
use ai_task_server::utils::metrics::Metrics;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceExt;

/// Echoes the prompt it was given, or fails when told to
#[derive(Default)]
struct EchoModel {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl ModelClient for EchoModel {
    async fn generate(&self, request: GenerateRequest) -> Result<String, ProviderError> {
        if request.prompt.ends_with("fail") {
            return Err(ProviderError::RateLimited);
        }
        self.prompts.lock().push(request.prompt);
        Ok("echo".to_string())
    }

    async fn generate_from_document(
        &self,
        _document: &[u8],
        _mime_type: &str,
        _prompt: &str,
    ) -> Result<String, ProviderError> {
        Ok("review".to_string())
    }
}

struct Harness {
    app: Router,
    memory: MemoryBroker,
    model: Arc<EchoModel>,
}

async fn harness() -> Harness {
    let settings = Settings::default();
    let metrics = Metrics::new();
    let model = Arc::new(EchoModel::default());

    let completions = Arc::new(CompletionService::new(
        ContextStore::new(),
        model.clone(),
        &settings.gemini,
        metrics.clone(),
    ));

    let mut registry = BindingRegistry::new(ExchangeKind::Topic, ".dead-letter");
    let producers = Producers::register(&mut registry, &settings.tasks);

    let memory = MemoryBroker::new();
    let broker = memory.connect().await.unwrap();
    registry.declare_topology(broker.as_ref()).await.unwrap();
    // Stand-in for the review consumer's queue
    broker
        .declare_queue(&ai_task_server::mq::broker::QueueSpec {
            name: "sink".to_string(),
            durable: true,
            dead_letter: None,
        })
        .await
        .unwrap();
    broker.bind_queue("sink", "ai", "to-review").await.unwrap();

    let publisher = MessagePublisher::new(metrics.clone());
    let (_health_tx, broker_health) = watch::channel(BrokerHealth::Connected);

    // Filled by the connection manager in production
    publisher.set_broker(Some(broker));

    let state = Arc::new(AppState {
        settings,
        completions,
        publisher,
        producers,
        broker_health,
        metrics,
    });

    Harness {
        app: build_router(state),
        memory,
        model,
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn root_says_hello() {
    let h = harness().await;
    let (status, body) = call(&h.app, "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"Hello": "World"}));
}

#[tokio::test]
async fn readiness_reports_broker_state() {
    let h = harness().await;
    let (status, body) = call(&h.app, "GET", "/health/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["broker"]["state"], "connected");
    assert_eq!(body["metrics"]["messages_published"], 0);
}

#[tokio::test]
async fn configure_is_first_write_wins() {
    let h = harness().await;
    let config = json!({
        "max_context_length": 1000,
        "invalidation_after_seconds": 60,
        "system_instruction": "be terse"
    });

    let (status, body) = call(&h.app, "PUT", "/api/context/u1", Some(config.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["created"], true);

    let (status, body) = call(&h.app, "PUT", "/api/context/u1", Some(config)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["created"], false);

    let (_, body) = call(&h.app, "GET", "/api/context/u1", None).await;
    assert_eq!(body["configured"], true);
    let (_, body) = call(&h.app, "GET", "/api/context/nobody", None).await;
    assert_eq!(body["configured"], false);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let h = harness().await;
    let (status, body) = call(
        &h.app,
        "PUT",
        "/api/context/u1",
        Some(json!({
            "max_context_length": 0,
            "invalidation_after_seconds": 60,
            "system_instruction": ""
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "BadRequest");
}

#[tokio::test]
async fn completions_carry_history_forward() {
    let h = harness().await;
    call(
        &h.app,
        "PUT",
        "/api/context/u1",
        Some(json!({
            "max_context_length": 1000,
            "invalidation_after_seconds": 3600,
            "system_instruction": ""
        })),
    )
    .await;

    let (status, body) = call(
        &h.app,
        "POST",
        "/api/context/u1/completions",
        Some(json!({"prompt": "first"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "echo");

    call(
        &h.app,
        "POST",
        "/api/context/u1/completions",
        Some(json!({"prompt": "second", "metadata": {"source": "test"}})),
    )
    .await;

    let prompts = h.model.prompts.lock().clone();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[1], "<CONTEXT>\nUser: first\nModel: echo\n</CONTEXT>\nsecond");
}

#[tokio::test]
async fn completion_errors_map_to_status_codes() {
    let h = harness().await;

    let (status, body) = call(
        &h.app,
        "POST",
        "/api/context/ghost/completions",
        Some(json!({"prompt": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NotRegistered");

    call(
        &h.app,
        "PUT",
        "/api/context/u1",
        Some(json!({
            "max_context_length": 1000,
            "invalidation_after_seconds": 3600,
            "system_instruction": ""
        })),
    )
    .await;

    let (status, body) = call(
        &h.app,
        "POST",
        "/api/context/u1/completions",
        Some(json!({"prompt": "please fail"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "LlmError");

    let (status, _) = call(
        &h.app,
        "POST",
        "/api/context/u1/completions",
        Some(json!({"prompt": "   "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn review_requests_are_published() {
    let h = harness().await;

    let (status, body) = call(
        &h.app,
        "POST",
        "/api/tasks/review",
        Some(json!({"bucket": "docs", "key": "a.pdf"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let published = h.memory.drain("sink");
    assert_eq!(published.len(), 1);
    let task: Value = serde_json::from_slice(&published[0]).unwrap();
    assert_eq!(task["task_id"], task_id);
    assert_eq!(task["bucket"], "docs");
    assert_eq!(task["key"], "a.pdf");

    let (status, _) = call(
        &h.app,
        "POST",
        "/api/tasks/review",
        Some(json!({"bucket": "", "key": "a.pdf"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
