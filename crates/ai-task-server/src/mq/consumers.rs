use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::binding::{decode_json, MessageHandler, MessagePublisher, Producer};
use super::broker::MessageProperties;
use super::producers::ReviewResult;
use crate::config::TasksConfig;
use crate::services::gemini::ModelClient;
use crate::services::object_store::ObjectStore;

/// Wire body of a review request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewTask {
    pub task_id: String,
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Fetches the referenced document, asks the model to review it and publishes
/// the review.
pub struct ReviewConsumer {
    store: Arc<dyn ObjectStore>,
    model: Arc<dyn ModelClient>,
    publisher: MessagePublisher,
    results: Producer,
    default_prompt: String,
    default_mime_type: String,
}

impl ReviewConsumer {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        model: Arc<dyn ModelClient>,
        publisher: MessagePublisher,
        results: Producer,
        tasks: &TasksConfig,
    ) -> Self {
        Self {
            store,
            model,
            publisher,
            results,
            default_prompt: tasks.review_prompt.clone(),
            default_mime_type: tasks.document_mime_type.clone(),
        }
    }
}

#[async_trait]
impl MessageHandler for ReviewConsumer {
    async fn handle(&self, body: &[u8], properties: &MessageProperties) -> anyhow::Result<()> {
        let task: ReviewTask = decode_json(body)?;
        info!(
            task_id = %task.task_id,
            bucket = %task.bucket,
            key = %task.key,
            message_id = ?properties.message_id,
            "📄 Review task received"
        );

        let document = self
            .store
            .fetch(&task.bucket, &task.key)
            .await
            .with_context(|| format!("fetching s3://{}/{}", task.bucket, task.key))?;

        let prompt = task.prompt.as_deref().unwrap_or(&self.default_prompt);
        let mime_type = task.mime_type.as_deref().unwrap_or(&self.default_mime_type);

        let review = self
            .model
            .generate_from_document(&document, mime_type, prompt)
            .await
            .context("document review generation")?;

        let result = ReviewResult::new(&task, review);
        self.publisher
            .publish(&self.results, &result)
            .await
            .context("publishing review result")?;

        info!(task_id = %task.task_id, "✅ Review published");
        Ok(())
    }
}
