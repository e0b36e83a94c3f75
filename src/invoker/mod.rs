//! Single structured inference call with retry and default fallback
//!
//! `invoke` always comes back with a usable payload: the provider's answer
//! when one parses, the caller's default once the retry budget is spent. The
//! only error it returns is a fatal configuration error.

use crate::error::{InvocationError, OrchestrationError};
use crate::models::ModelConfig;
use crate::provider::{InferenceRequest, Prompt, ProviderRegistry, ProviderReply};
use crate::rate_limit::RateGovernor;
use crate::state::SharedState;
use crate::Result;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Payload types that can describe themselves as a JSON Schema.
pub trait OutputSchema {
    fn output_schema() -> Value;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub quota_base_delay: Duration,
    pub quota_step: Duration,
    pub quota_max_delay: Duration,
    /// Fixed wait after transient and parse errors.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            quota_base_delay: Duration::from_secs(30),
            quota_step: Duration::from_secs(10),
            quota_max_delay: Duration::from_secs(60),
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following zero-based `attempt`.
    pub fn delay_for(&self, err: &InvocationError, attempt: u32) -> Duration {
        match err {
            InvocationError::QuotaExceeded(_) => (self.quota_base_delay + self.quota_step * attempt)
                .min(self.quota_max_delay),
            _ => self.retry_delay,
        }
    }
}

/// Outcome of one invocation. Same shape whether or not the provider answered.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult<T> {
    pub success: bool,
    pub payload: T,
    pub error: Option<String>,
    pub attempts: u32,
}

pub struct TaskCall<'a> {
    /// Key used to look up per-task model overrides.
    pub task_key: &'a str,
    pub prompt: Prompt,
}

pub struct TaskInvoker {
    providers: ProviderRegistry,
    governor: Arc<RateGovernor>,
    retry: RetryPolicy,
    fallback_model: ModelConfig,
}

impl TaskInvoker {
    pub fn new(
        providers: ProviderRegistry,
        governor: Arc<RateGovernor>,
        retry: RetryPolicy,
        fallback_model: ModelConfig,
    ) -> Self {
        Self {
            providers,
            governor,
            retry,
            fallback_model,
        }
    }

    /// Task override, then run default, then the process default.
    pub fn resolve_model(&self, task_key: &str, state: &SharedState) -> Result<ModelConfig> {
        let model = state
            .model_for(task_key)
            .cloned()
            .unwrap_or_else(|| self.fallback_model.clone());

        if model.model_name.trim().is_empty() {
            return Err(OrchestrationError::FatalConfiguration(format!(
                "no model name resolved for task '{}'",
                task_key
            )));
        }

        Ok(model)
    }

    pub async fn invoke<T, F>(
        &self,
        call: TaskCall<'_>,
        state: &SharedState,
        default: F,
    ) -> Result<InvocationResult<T>>
    where
        T: OutputSchema + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let model = self.resolve_model(call.task_key, state)?;

        let provider = self.providers.get(model.provider).ok_or_else(|| {
            error!(
                task = call.task_key,
                provider = %model.provider,
                "No inference provider registered"
            );
            OrchestrationError::FatalConfiguration(format!(
                "provider {} is not configured (task '{}', model '{}')",
                model.provider, call.task_key, model.model_name
            ))
        })?;

        let request = InferenceRequest {
            model: model.model_name.clone(),
            prompt: call.prompt,
            output_schema: T::output_schema(),
            structured: provider.supports_structured_output(&model.model_name),
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error: Option<InvocationError> = None;

        for attempt in 0..max_attempts {
            self.governor.acquire(model.provider).await;

            debug!(
                task = call.task_key,
                provider = %model.provider,
                model = %model.model_name,
                attempt = attempt + 1,
                "Invoking provider"
            );

            let outcome = provider
                .call(&request)
                .await
                .and_then(|reply| decode::<T>(reply));

            match outcome {
                Ok(payload) => {
                    return Ok(InvocationResult {
                        success: true,
                        payload,
                        error: None,
                        attempts: attempt + 1,
                    });
                }
                Err(err) if !err.is_retryable() => {
                    error!(task = call.task_key, error = %err, "Non-retryable provider error");
                    return Err(err.into());
                }
                Err(err) => {
                    let remaining = max_attempts - attempt - 1;
                    if remaining > 0 {
                        let delay = self.retry.delay_for(&err, attempt);
                        warn!(
                            task = call.task_key,
                            attempt = attempt + 1,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Retrying provider call"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = Some(err);
                }
            }
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "retry budget exhausted".to_string());

        warn!(
            task = call.task_key,
            attempts = max_attempts,
            error = %detail,
            "Provider call failed, using default payload"
        );

        Ok(InvocationResult {
            success: false,
            payload: default(),
            error: Some(detail),
            attempts: max_attempts,
        })
    }
}

fn decode<T: DeserializeOwned>(reply: ProviderReply) -> std::result::Result<T, InvocationError> {
    let value = match reply {
        ProviderReply::Structured(value) => value,
        ProviderReply::Text(text) => extract_json_block(&text).ok_or_else(|| {
            InvocationError::SchemaParse("no JSON block found in response".to_string())
        })?,
    };

    serde_json::from_value(value)
        .map_err(|e| InvocationError::SchemaParse(format!("payload does not match schema: {}", e)))
}

/// Find the structured block in a free-text answer: a ```json fence first,
/// then the outermost `{ ... }` span.
pub fn extract_json_block(text: &str) -> Option<Value> {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            if let Ok(parsed) = serde_json::from_str::<Value>(after[..end].trim()) {
                return Some(parsed);
            }
        }
    }

    let brace_start = text.find('{')?;
    let brace_end = text.rfind('}')?;
    if brace_end <= brace_start {
        return None;
    }

    serde_json::from_str::<Value>(&text[brace_start..=brace_end])
        .ok()
        .filter(Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalystSignal, DateRange, ModelProvider, Portfolio, Signal};
    use crate::provider::ScriptedProvider;
    use crate::state::RunMetadata;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::time::Instant;

    fn state() -> SharedState {
        let symbols = vec!["AAPL".to_string()];
        let mut metadata = RunMetadata::new();
        metadata.default_model = Some(ModelConfig::new("gemini-2.0-flash", ModelProvider::Google));
        SharedState::new(
            symbols.clone(),
            DateRange::ending(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(), 30),
            Portfolio::new(Portfolio::DEFAULT_CASH, &symbols),
            metadata,
        )
    }

    fn invoker_with(provider: Arc<ScriptedProvider>) -> TaskInvoker {
        let mut providers = ProviderRegistry::new();
        providers.register(provider);
        TaskInvoker::new(
            providers,
            Arc::new(RateGovernor::unlimited()),
            RetryPolicy::default(),
            ModelConfig::new("gpt-4.1", ModelProvider::OpenAI),
        )
    }

    fn call() -> TaskCall<'static> {
        TaskCall {
            task_key: "ben_graham",
            prompt: Prompt {
                system: "system".to_string(),
                user: "user".to_string(),
            },
        }
    }

    #[test]
    fn test_extract_json_block() {
        let fenced = "Here you go:\n```json\n{\"signal\": \"bullish\", \"confidence\": 80, \"reasoning\": \"x\"}\n```\nThanks";
        assert_eq!(extract_json_block(fenced).unwrap()["signal"], "bullish");

        let bare = "Sure. {\"signal\": \"bearish\", \"nested\": {\"a\": 1}} done";
        assert_eq!(extract_json_block(bare).unwrap()["nested"]["a"], 1);

        assert!(extract_json_block("no json here").is_none());
        assert!(extract_json_block("} backwards {").is_none());
    }

    #[test]
    fn test_quota_backoff_escalates_and_caps() {
        let policy = RetryPolicy::default();
        let quota = InvocationError::QuotaExceeded("429".into());
        let transient = InvocationError::TransientProvider("503".into());

        assert_eq!(policy.delay_for(&quota, 0), Duration::from_secs(30));
        assert_eq!(policy.delay_for(&quota, 1), Duration::from_secs(40));
        assert_eq!(policy.delay_for(&quota, 5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(&transient, 1), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_structured_reply_is_used_directly() {
        let provider = Arc::new(ScriptedProvider::always(
            ModelProvider::Google,
            json!({"signal": "bullish", "confidence": 88.0, "reasoning": "wide moat"}),
        ));
        let invoker = invoker_with(provider.clone());

        let result = invoker
            .invoke(call(), &state(), AnalystSignal::neutral_default)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.payload.signal, Signal::Bullish);
        assert!(provider.requests().await[0].structured);
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_reply_parse_failure_is_retried() {
        let provider = Arc::new(ScriptedProvider::new(ModelProvider::Google, false, |_, index| {
            if index == 0 {
                Ok(ProviderReply::Text("I think it's fine".to_string()))
            } else {
                Ok(ProviderReply::Text(
                    "```json\n{\"signal\": \"bearish\", \"confidence\": 61.0, \"reasoning\": \"debt\"}\n```"
                        .to_string(),
                ))
            }
        }));
        let invoker = invoker_with(provider.clone());

        let start = Instant::now();
        let result = invoker
            .invoke(call(), &state(), AnalystSignal::neutral_default)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.payload.signal, Signal::Bearish);
        assert!(Instant::now() - start >= Duration::from_secs(2));
        assert!(!provider.requests().await[0].structured);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_errors_exhaust_to_default() {
        let provider = Arc::new(ScriptedProvider::failing(
            ModelProvider::Google,
            InvocationError::QuotaExceeded("429 Too Many Requests".into()),
        ));
        let invoker = invoker_with(provider.clone());

        let start = Instant::now();
        let result = invoker
            .invoke(call(), &state(), AnalystSignal::neutral_default)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.payload, AnalystSignal::neutral_default());
        assert!(result.error.unwrap().contains("429"));
        assert_eq!(provider.call_count(), 3);
        // 30s + 40s of backoff, none after the last attempt
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_secs(70));
        assert!(elapsed < Duration::from_secs(71));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_configuration_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::failing(
            ModelProvider::Google,
            InvocationError::FatalConfiguration("GEMINI_API_KEY not configured".into()),
        ));
        let invoker = invoker_with(provider.clone());

        let err = invoker
            .invoke(call(), &state(), AnalystSignal::neutral_default)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_provider_is_fatal() {
        let provider = Arc::new(ScriptedProvider::always(ModelProvider::Groq, json!({})));
        let invoker = invoker_with(provider.clone());

        let err = invoker
            .invoke(call(), &state(), AnalystSignal::neutral_default)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_resolution_falls_back_to_process_default() {
        let invoker = invoker_with(Arc::new(ScriptedProvider::always(ModelProvider::OpenAI, json!({}))));
        let symbols = vec!["MSFT".to_string()];
        let bare = SharedState::new(
            symbols.clone(),
            DateRange::ending(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(), 30),
            Portfolio::new(Portfolio::DEFAULT_CASH, &symbols),
            RunMetadata {
                run_id: uuid::Uuid::new_v4(),
                default_model: None,
                model_overrides: HashMap::new(),
            },
        );

        let model = invoker.resolve_model("ben_graham", &bare).unwrap();
        assert_eq!(model, ModelConfig::new("gpt-4.1", ModelProvider::OpenAI));
    }
}
