//! Process configuration loaded from the environment (and `.env`)

use crate::error::OrchestrationError;
use crate::graph::GraphPolicy;
use crate::invoker::RetryPolicy;
use crate::models::{ModelConfig, ModelProvider};
use crate::rate_limit::QuotaPolicy;
use crate::Result;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MODEL_NAME: &str = "gpt-4.1";
const DEFAULT_API_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub default_model: ModelConfig,
    pub graph: GraphPolicy,
    pub retry: RetryPolicy,
    pub quotas: HashMap<ModelProvider, QuotaPolicy>,
    /// Worker cap for the graph executor; `None` sizes the pool to the node count.
    pub max_concurrent_nodes: Option<usize>,
    pub gemini_api_key: Option<String>,
    /// Ask Gemini for a JSON response body instead of free text.
    pub gemini_json_mode: bool,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
    pub groq_api_key: Option<String>,
    pub groq_base_url: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub deepseek_base_url: Option<String>,
    pub financial_api_base_url: Option<String>,
    pub financial_api_key: Option<String>,
    pub api_port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_model: ModelConfig::new(DEFAULT_MODEL_NAME, ModelProvider::OpenAI),
            graph: GraphPolicy::default(),
            retry: RetryPolicy::default(),
            quotas: default_quotas(),
            max_concurrent_nodes: None,
            gemini_api_key: None,
            gemini_json_mode: false,
            openai_api_key: None,
            openai_base_url: None,
            groq_api_key: None,
            groq_base_url: None,
            deepseek_api_key: None,
            deepseek_base_url: None,
            financial_api_base_url: None,
            financial_api_key: None,
            api_port: DEFAULT_API_PORT,
        }
    }
}

/// Google's free tier allows 10 requests per minute.
pub fn default_quotas() -> HashMap<ModelProvider, QuotaPolicy> {
    let mut quotas = HashMap::new();
    quotas.insert(ModelProvider::Google, QuotaPolicy::gemini_free_tier());
    quotas
}

impl OrchestratorConfig {
    /// Read configuration from the process environment, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        let provider = match non_empty("DEFAULT_MODEL_PROVIDER") {
            Some(value) => ModelProvider::from_str(&value)?,
            None => config.default_model.provider,
        };
        let model_name =
            non_empty("DEFAULT_MODEL_NAME").unwrap_or_else(|| config.default_model.model_name.clone());
        config.default_model = ModelConfig::new(model_name, provider);

        if let Some(threshold) = parse_var::<usize>("PARALLEL_TASK_THRESHOLD")? {
            config.graph.parallel_threshold = threshold;
        }
        config.max_concurrent_nodes = parse_var::<usize>("MAX_CONCURRENT_NODES")?;

        if let Some(max_attempts) = parse_var::<u32>("LLM_MAX_RETRIES")? {
            if max_attempts == 0 {
                return Err(OrchestrationError::FatalConfiguration(
                    "LLM_MAX_RETRIES must be at least 1".to_string(),
                ));
            }
            config.retry.max_attempts = max_attempts;
        }

        // Spacing tiers scale with the quota.
        if let Some(rpm) = parse_var::<u32>("GEMINI_RPM")? {
            config.quotas.insert(
                ModelProvider::Google,
                QuotaPolicy::new(rpm, Duration::from_secs(60)),
            );
        }

        config.gemini_api_key = non_empty("GEMINI_API_KEY").or_else(|| non_empty("GOOGLE_API_KEY"));
        config.gemini_json_mode = parse_var::<bool>("GEMINI_JSON_MODE")?.unwrap_or(false);
        config.openai_api_key = non_empty("OPENAI_API_KEY");
        config.openai_base_url = non_empty("OPENAI_BASE_URL");
        config.groq_api_key = non_empty("GROQ_API_KEY");
        config.groq_base_url = non_empty("GROQ_BASE_URL");
        config.deepseek_api_key = non_empty("DEEPSEEK_API_KEY");
        config.deepseek_base_url = non_empty("DEEPSEEK_BASE_URL");
        config.financial_api_base_url = non_empty("FINANCIAL_API_BASE_URL");
        config.financial_api_key = non_empty("FINANCIAL_API_KEY");

        if let Some(port) = parse_var::<u16>("PORT")? {
            config.api_port = port;
        } else if let Some(port) = parse_var::<u16>("API_PORT")? {
            config.api_port = port;
        }

        Ok(config)
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(key: &str) -> Result<Option<T>> {
    match non_empty(key) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            OrchestrationError::FatalConfiguration(format!("{} has invalid value '{}'", key, raw))
        }),
        None => Ok(None),
    }
}
