use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::GeminiConfig;
use crate::services::context::{ContextConfig, ContextError, ContextStore, Message};
use crate::services::gemini::{GenerateRequest, ModelClient};
use crate::utils::error::ApiError;
use crate::utils::metrics::Metrics;

/// Glue between the context store and the model client.
pub struct CompletionService {
    store: ContextStore,
    model: Arc<dyn ModelClient>,
    max_output_tokens: u32,
    temperature: f32,
    metrics: Metrics,
}

impl CompletionService {
    pub fn new(
        store: ContextStore,
        model: Arc<dyn ModelClient>,
        gemini: &GeminiConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            model,
            max_output_tokens: gemini.max_output_tokens,
            temperature: gemini.temperature,
            metrics,
        }
    }

    pub fn configure(&self, key: &str, config: ContextConfig) -> Result<bool, ContextError> {
        self.store.configure(key, config)
    }

    pub fn is_configured(&self, key: &str) -> bool {
        self.store.is_configured(key)
    }

    pub fn configured_keys(&self) -> usize {
        self.store.len()
    }

    /// Render the key's context around `prompt`, ask the model, and only then
    /// record the exchange. A failed or dropped call leaves the buffer untouched.
    pub async fn render_and_complete(
        &self,
        key: &str,
        prompt: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<String, ApiError> {
        let config = self.store.config(key)?;
        let contextualized = self.store.render(key, prompt)?;
        debug!(key, prompt_len = contextualized.len(), "Prompt contextualized");

        let request = GenerateRequest {
            prompt: contextualized,
            system_instruction: Some(config.system_instruction.clone())
                .filter(|instruction| !instruction.is_empty()),
            max_output_tokens: self.max_output_tokens,
            temperature: self.temperature,
        };

        let response = match self.model.generate(request).await {
            Ok(text) => text,
            Err(e) => {
                error!(key, "Error in prompt_model: {}", e);
                self.metrics.increment_completions_failed();
                return Err(e.into());
            }
        };

        let message = Message::new(prompt)
            .with_response(response.clone())
            .with_metadata(metadata);
        self.store.add(key, message)?;
        self.metrics.increment_completions_served();

        Ok(response)
    }
}
