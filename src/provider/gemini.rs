//! Gemini API client
//!
//! Uses a long-lived reqwest::Client for connection pooling.
//! Gemini models are driven in text mode by default; the invoker extracts the
//! JSON block from the answer. `GEMINI_JSON_MODE` switches to JSON responses.

use super::{classify_status, classify_transport, InferenceProvider, InferenceRequest, ProviderReply};
use crate::error::InvocationError;
use crate::models::ModelProvider;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    json_mode: bool,
}

impl GeminiClient {
    pub fn new(api_key: String) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            api_key,
            json_mode: false,
        })
    }

    /// Ask Gemini for `application/json` responses instead of free text.
    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.json_mode = json_mode;
        self
    }

    fn build_request(request: &InferenceRequest) -> GeminiRequest {
        GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: request.prompt.user.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.3,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 2048,
                response_mime_type: request.structured.then(|| "application/json".to_string()),
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: request.prompt.system.clone(),
                }],
            },
        }
    }
}

#[async_trait]
impl InferenceProvider for GeminiClient {
    fn provider(&self) -> ModelProvider {
        ModelProvider::Google
    }

    fn supports_structured_output(&self, _model: &str) -> bool {
        self.json_mode
    }

    async fn call(&self, request: &InferenceRequest) -> Result<ProviderReply, InvocationError> {
        if self.api_key.is_empty() {
            return Err(InvocationError::FatalConfiguration(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!(
            "{}/{}:generateContent?key={}",
            GEMINI_BASE_URL, request.model, self.api_key
        );

        debug!(model = %request.model, "Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&Self::build_request(request))
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                classify_transport(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Gemini API error response: {}", error_text);
            return Err(classify_status(status, &error_text));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            InvocationError::SchemaParse(format!("Gemini response body: {}", e))
        })?;

        let answer = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| {
                InvocationError::TransientProvider("Empty response from Gemini".to_string())
            })?;

        if request.structured {
            let value = serde_json::from_str(&answer)
                .map_err(|e| InvocationError::SchemaParse(format!("Gemini JSON output: {}", e)))?;
            Ok(ProviderReply::Structured(value))
        } else {
            Ok(ProviderReply::Text(answer))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}
