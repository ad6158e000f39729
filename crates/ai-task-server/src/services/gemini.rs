use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::config::GeminiConfig;
use crate::utils::error::ConfigurationError;

/// Transient failure of the model provider. Not retried here.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Model request timed out")]
    Timeout,

    #[error("Model provider rate limited the request")]
    RateLimited,

    #[error("Model API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Model network error: {0}")]
    Network(String),

    #[error("Model returned no text")]
    EmptyResponse,
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_instruction: Option<String>,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<String, ProviderError>;

    async fn generate_from_document(
        &self,
        document: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, ProviderError>;
}

// ===== Wire types (generateContent) =====

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize, Deserialize, Default)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    fn inline(mime_type: &str, data: &[u8]) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data: STANDARD.encode(data),
            }),
        }
    }
}

impl GenerateContentResponse {
    fn into_text(self) -> Option<String> {
        let candidate = self.candidates.into_iter().next()?;
        let text: String = candidate
            .content
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect();

        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Gemini REST client
#[derive(Clone)]
pub struct GeminiService {
    client: Client,
    config: GeminiConfig,
    api_key: String,
}

impl GeminiService {
    /// Fails at construction when the API key is absent
    pub fn new(config: GeminiConfig) -> Result<Self, ConfigurationError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigurationError::Missing("GEMINI_API_KEY".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| {
                ConfigurationError::Invalid(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    async fn generate_content(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/models/{}:generateContent", self.config.base_url, model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Gemini API Error ({}): {}", status, body);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| {
                ProviderError::Network(format!("Failed to parse Gemini response: {}", e))
            })?;

        body.into_text().ok_or(ProviderError::EmptyResponse)
    }
}

#[async_trait]
impl ModelClient for GeminiService {
    async fn generate(&self, request: GenerateRequest) -> Result<String, ProviderError> {
        debug!(
            model = %self.config.text_model,
            prompt_len = request.prompt.len(),
            "Generating text"
        );

        let body = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(request.prompt)],
            }],
            system_instruction: request.system_instruction.map(|instruction| Content {
                role: None,
                parts: vec![Part::text(instruction)],
            }),
            generation_config: Some(GenerationConfig {
                max_output_tokens: request.max_output_tokens,
                temperature: request.temperature,
            }),
        };

        self.generate_content(&self.config.text_model, &body).await
    }

    async fn generate_from_document(
        &self,
        document: &[u8],
        mime_type: &str,
        prompt: &str,
    ) -> Result<String, ProviderError> {
        debug!(
            model = %self.config.document_model,
            document_bytes = document.len(),
            mime_type,
            "Generating text from document"
        );

        let body = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::inline(mime_type, document), Part::text(prompt)],
            }],
            system_instruction: None,
            generation_config: None,
        };

        self.generate_content(&self.config.document_model, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_api_key_is_configuration_error() {
        let config = GeminiConfig::default();
        assert!(matches!(
            GeminiService::new(config),
            Err(ConfigurationError::Missing(_))
        ));

        let config = GeminiConfig {
            api_key: Some("   ".to_string()),
            ..GeminiConfig::default()
        };
        assert!(GeminiService::new(config).is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let body = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::inline("application/pdf", b"%PDF"), Part::text("review")],
            }],
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::text("be terse")],
            }),
            generation_config: Some(GenerationConfig {
                max_output_tokens: 500,
                temperature: 0.5,
            }),
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["inlineData"]["mimeType"], "application/pdf");
        assert_eq!(json["contents"][0]["parts"][0]["inlineData"]["data"], "JVBERg==");
        assert_eq!(json["contents"][0]["parts"][1]["text"], "review");
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be terse");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 500);
    }

    #[test]
    fn test_response_text_is_concatenated() {
        let raw = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello, "},{"text":"world"}]}}]}"#;
        let parsed: GenerateContentResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.into_text().as_deref(), Some("Hello, world"));
    }

    #[test]
    fn test_response_without_candidates() {
        let parsed: GenerateContentResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.into_text().is_none());
    }
}
