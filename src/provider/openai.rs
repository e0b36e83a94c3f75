//! OpenAI-compatible chat completions client
//!
//! Covers OpenAI itself and vendors exposing the same `/chat/completions`
//! surface (Groq, DeepSeek). Schema-constrained output uses the
//! `json_schema` response format where the vendor supports it.

use super::{classify_status, classify_transport, InferenceProvider, InferenceRequest, ProviderReply};
use crate::error::InvocationError;
use crate::models::ModelProvider;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";

fn default_base_url(provider: ModelProvider) -> &'static str {
    match provider {
        ModelProvider::Groq => GROQ_BASE_URL,
        ModelProvider::DeepSeek => DEEPSEEK_BASE_URL,
        _ => OPENAI_BASE_URL,
    }
}

pub struct OpenAiCompatibleClient {
    provider: ModelProvider,
    client: Client,
    api_key: String,
    base_url: String,
    json_mode: bool,
}

impl OpenAiCompatibleClient {
    /// Client for `provider` at its public endpoint.
    pub fn new(provider: ModelProvider, api_key: String) -> crate::Result<Self> {
        Self::with_base_url(provider, api_key, default_base_url(provider).to_string())
    }

    pub fn with_base_url(
        provider: ModelProvider,
        api_key: String,
        base_url: String,
    ) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            provider,
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            // DeepSeek has no JSON mode.
            json_mode: provider != ModelProvider::DeepSeek,
        })
    }

    fn build_request(request: &InferenceRequest) -> ChatRequest {
        let response_format = request.structured.then(|| {
            json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "analysis_output",
                    "schema": request.output_schema,
                }
            })
        });

        ChatRequest {
            model: request.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: request.prompt.system.clone(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.prompt.user.clone(),
                },
            ],
            temperature: 0.0,
            response_format,
        }
    }
}

#[async_trait]
impl InferenceProvider for OpenAiCompatibleClient {
    fn provider(&self) -> ModelProvider {
        self.provider
    }

    fn supports_structured_output(&self, model: &str) -> bool {
        self.json_mode && !model.starts_with("deepseek")
    }

    async fn call(&self, request: &InferenceRequest) -> Result<ProviderReply, InvocationError> {
        if self.api_key.is_empty() {
            return Err(InvocationError::FatalConfiguration(format!(
                "API key for {} not configured",
                self.provider
            )));
        }

        let url = format!("{}/chat/completions", self.base_url);
        debug!(provider = %self.provider, model = %request.model, "Calling chat completions");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&Self::build_request(request))
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(provider = %self.provider, %status, "Chat completion failed: {}", error_text);
            return Err(classify_status(status, &error_text));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| InvocationError::SchemaParse(format!("chat completion body: {}", e)))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                InvocationError::TransientProvider("chat completion had no content".to_string())
            })?;

        if request.structured {
            let value: Value = serde_json::from_str(&content)
                .map_err(|e| InvocationError::SchemaParse(format!("structured output: {}", e)))?;
            Ok(ProviderReply::Structured(value))
        } else {
            Ok(ProviderReply::Text(content))
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Prompt;

    #[test]
    fn test_structured_request_carries_schema() {
        let request = InferenceRequest {
            model: "gpt-4.1".to_string(),
            prompt: Prompt {
                system: "system".to_string(),
                user: "user".to_string(),
            },
            output_schema: json!({"type": "object", "required": ["signal"]}),
            structured: true,
        };

        let body = serde_json::to_value(OpenAiCompatibleClient::build_request(&request)).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "user");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(
            body["response_format"]["json_schema"]["schema"]["required"][0],
            "signal"
        );
    }

    #[test]
    fn test_json_mode_capability() {
        let openai = OpenAiCompatibleClient::new(ModelProvider::OpenAI, "k".into()).unwrap();
        assert!(openai.supports_structured_output("gpt-4.1"));

        let groq = OpenAiCompatibleClient::new(ModelProvider::Groq, "k".into()).unwrap();
        assert!(groq.supports_structured_output("llama-3.3-70b-versatile"));

        let deepseek = OpenAiCompatibleClient::new(ModelProvider::DeepSeek, "k".into()).unwrap();
        assert!(!deepseek.supports_structured_output("deepseek-chat"));
    }

    #[test]
    fn test_default_endpoints() {
        assert_eq!(default_base_url(ModelProvider::OpenAI), "https://api.openai.com/v1");
        assert_eq!(default_base_url(ModelProvider::Groq), "https://api.groq.com/openai/v1");
        assert_eq!(default_base_url(ModelProvider::DeepSeek), "https://api.deepseek.com");
    }
}
