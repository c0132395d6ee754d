//! Generation model client (Ollama `/api/generate`)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::retry::RetryConfig;

const SERVICE: &str = "generation";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    /// Upper bound on generated tokens (`num_predict`)
    pub max_tokens: u32,
    pub retry: RetryConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            temperature: 0.1,
            max_tokens: 2048,
            retry: RetryConfig {
                max_attempts: 2,
                base_delay_ms: 1_000,
                timeout_ms: 120_000,
            },
        }
    }
}

// ============================================================================
// GenerationClient Trait
// ============================================================================

/// Model output
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// False when the model stopped before finishing
    pub done: bool,
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Generate with `model`, or the configured model when `None`
    async fn generate(&self, system: &str, prompt: &str, model: Option<&str>) -> Result<Generation>;

    /// Configured default model
    fn model_name(&self) -> &str;
}

// ============================================================================
// OllamaGenerator
// ============================================================================

/// source: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-a-completion
pub struct OllamaGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    options: GenerateOptions,
}

#[derive(Debug, Clone, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    options: &'a GenerateOptions,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
    #[serde(default)]
    done: bool,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.retry.timeout_ms))
            .build()
            .map_err(|e| RagError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            options: GenerateOptions {
                temperature: config.temperature,
                num_predict: config.max_tokens,
            },
        })
    }
}

#[async_trait]
impl GenerationClient for OllamaGenerator {
    async fn generate(&self, system: &str, prompt: &str, model: Option<&str>) -> Result<Generation> {
        let request = GenerateRequest {
            model: model.unwrap_or(&self.model),
            prompt,
            system,
            options: &self.options,
            stream: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::from_http(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RagError::from_status(SERVICE, status, body));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| RagError::from_http(SERVICE, e))?;

        Ok(Generation {
            text: body.response,
            done: body.done,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let options = GenerateOptions {
            temperature: 0.1,
            num_predict: 2048,
        };
        let body = serde_json::to_value(GenerateRequest {
            model: "llama3",
            prompt: "question",
            system: "be careful",
            options: &options,
            stream: false,
        })
        .unwrap();

        assert_eq!(body["model"], "llama3");
        assert_eq!(body["system"], "be careful");
        assert_eq!(body["options"]["num_predict"], 2048);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_response_parsing() {
        let done: GenerateResponse =
            serde_json::from_str(r#"{"model":"llama3","response":"Answer [Source 1]","done":true}"#)
                .unwrap();
        assert!(done.done);
        assert_eq!(done.response, "Answer [Source 1]");

        let partial: GenerateResponse = serde_json::from_str(r#"{"response":"Ans"}"#).unwrap();
        assert!(!partial.done);
    }

    #[test]
    fn test_endpoint_and_model() {
        let generator = OllamaGenerator::new(&GenerationConfig::default()).unwrap();
        assert_eq!(generator.endpoint, "http://localhost:11434/api/generate");
        assert_eq!(generator.model_name(), "llama3");
    }
}
