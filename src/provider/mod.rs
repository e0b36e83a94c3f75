//! Inference provider trait and registry
//!
//! A provider turns a prompt plus an output schema into either a structured
//! JSON value (when it supports schema-constrained decoding) or raw text that
//! the invoker scans for an embedded JSON block.

use crate::config::OrchestratorConfig;
use crate::error::InvocationError;
use crate::models::ModelProvider;
use crate::Result;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub mod gemini;
pub mod mock;
pub mod openai;

pub use gemini::GeminiClient;
pub use mock::ScriptedProvider;
pub use openai::OpenAiCompatibleClient;

#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub model: String,
    pub prompt: Prompt,
    /// JSON Schema of the expected payload.
    pub output_schema: Value,
    /// Ask for schema-constrained output. Only set when the provider supports it.
    pub structured: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderReply {
    Structured(Value),
    Text(String),
}

/// Trait for a remote inference service
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn provider(&self) -> ModelProvider;

    /// Whether `model` can be asked for schema-constrained JSON.
    fn supports_structured_output(&self, model: &str) -> bool;

    async fn call(&self, request: &InferenceRequest) -> std::result::Result<ProviderReply, InvocationError>;
}

/// Provider lookup by vendor
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ModelProvider, Arc<dyn InferenceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn InferenceProvider>) {
        self.providers.insert(provider.provider(), provider);
    }

    pub fn get(&self, provider: ModelProvider) -> Option<Arc<dyn InferenceProvider>> {
        self.providers.get(&provider).cloned()
    }

    pub fn list(&self) -> Vec<ModelProvider> {
        let mut providers: Vec<_> = self.providers.keys().copied().collect();
        providers.sort();
        providers
    }

    /// Register every provider that has credentials in `config`.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let mut registry = Self::new();

        if let Some(key) = &config.gemini_api_key {
            registry.register(Arc::new(
                GeminiClient::new(key.clone())?.with_json_mode(config.gemini_json_mode),
            ));
        }

        let compatible = [
            (ModelProvider::OpenAI, &config.openai_api_key, &config.openai_base_url),
            (ModelProvider::Groq, &config.groq_api_key, &config.groq_base_url),
            (ModelProvider::DeepSeek, &config.deepseek_api_key, &config.deepseek_base_url),
        ];
        for (provider, key, base_url) in compatible {
            let Some(key) = key else { continue };
            let client = match base_url {
                Some(url) => OpenAiCompatibleClient::with_base_url(provider, key.clone(), url.clone())?,
                None => OpenAiCompatibleClient::new(provider, key.clone())?,
            };
            registry.register(Arc::new(client));
        }

        Ok(registry)
    }
}

/// Map a non-success HTTP status to the invocation error taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> InvocationError {
    let lowered = body.to_lowercase();

    if status == StatusCode::TOO_MANY_REQUESTS
        || lowered.contains("quota")
        || lowered.contains("rate limit")
    {
        InvocationError::QuotaExceeded(format!("{}: {}", status, body))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        InvocationError::FatalConfiguration(format!("provider rejected credentials ({})", status))
    } else {
        InvocationError::TransientProvider(format!("{}: {}", status, body))
    }
}

/// Network-level failures are always worth retrying.
pub(crate) fn classify_transport(err: reqwest::Error) -> InvocationError {
    InvocationError::TransientProvider(err.to_string())
}
