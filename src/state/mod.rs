//! Run-scoped shared state
//!
//! Created at run start, threaded through every graph node, dropped when the
//! run returns. Task results are only ever added through [`SharedState::merge_result`].

use crate::error::OrchestrationError;
use crate::models::{
    DateRange, ModelConfig, Portfolio, RiskAssessment, RunRequest, TaskResult,
};
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub run_id: Uuid,
    /// Run-wide model, used when a task has no override.
    pub default_model: Option<ModelConfig>,
    /// Per-task model overrides keyed by task id.
    pub model_overrides: HashMap<String, ModelConfig>,
}

impl RunMetadata {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            default_model: None,
            model_overrides: HashMap::new(),
        }
    }
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SharedState {
    pub symbols: Vec<String>,
    pub date_range: DateRange,
    pub portfolio: Portfolio,
    pub metadata: RunMetadata,
    results: RwLock<BTreeMap<String, TaskResult>>,
    risk: RwLock<BTreeMap<String, RiskAssessment>>,
}

impl SharedState {
    pub fn new(
        symbols: Vec<String>,
        date_range: DateRange,
        portfolio: Portfolio,
        metadata: RunMetadata,
    ) -> Self {
        Self {
            symbols,
            date_range,
            portfolio,
            metadata,
            results: RwLock::new(BTreeMap::new()),
            risk: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn from_request(request: &RunRequest) -> Result<Self> {
        let symbols = request.normalized_symbols()?;
        let date_range = DateRange::new(request.date_range.start, request.date_range.end)?;
        let portfolio = request
            .portfolio
            .clone()
            .unwrap_or_else(|| Portfolio::new(Portfolio::DEFAULT_CASH, &symbols));

        let metadata = RunMetadata {
            run_id: Uuid::new_v4(),
            default_model: request.default_model.clone(),
            model_overrides: request.model_overrides.clone(),
        };

        Ok(Self::new(symbols, date_range, portfolio, metadata))
    }

    pub fn run_id(&self) -> Uuid {
        self.metadata.run_id
    }

    /// Model explicitly chosen for `task_key`, falling back to the run default.
    pub fn model_for(&self, task_key: &str) -> Option<&ModelConfig> {
        self.metadata
            .model_overrides
            .get(task_key)
            .or(self.metadata.default_model.as_ref())
    }

    /// Insert one task's result. Each key may be merged exactly once.
    pub async fn merge_result(&self, key: impl Into<String>, result: TaskResult) -> Result<()> {
        let key = key.into();
        let mut results = self.results.write().await;

        if results.contains_key(&key) {
            return Err(OrchestrationError::ExecutionError(format!(
                "result for task '{}' merged twice",
                key
            )));
        }

        results.insert(key, result);
        Ok(())
    }

    pub async fn results(&self) -> BTreeMap<String, TaskResult> {
        self.results.read().await.clone()
    }

    pub async fn set_risk(&self, risk: BTreeMap<String, RiskAssessment>) {
        *self.risk.write().await = risk;
    }

    pub async fn risk(&self) -> BTreeMap<String, RiskAssessment> {
        self.risk.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelProvider;
    use chrono::NaiveDate;

    fn state_with(metadata: RunMetadata) -> SharedState {
        let end = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let symbols = vec!["AAPL".to_string()];
        SharedState::new(
            symbols.clone(),
            DateRange::ending(end, 30),
            Portfolio::new(Portfolio::DEFAULT_CASH, &symbols),
            metadata,
        )
    }

    #[tokio::test]
    async fn test_merge_rejects_duplicate_keys() {
        let state = state_with(RunMetadata::new());
        let symbols = state.symbols.clone();

        state
            .merge_result("ben_graham", TaskResult::all_default(&symbols))
            .await
            .unwrap();
        let second = state
            .merge_result("ben_graham", TaskResult::default())
            .await;

        assert!(second.is_err());
        assert_eq!(state.results().await.len(), 1);
        assert!(state.results().await["ben_graham"].is_degraded());
    }

    #[test]
    fn test_model_override_precedence() {
        let mut metadata = RunMetadata::new();
        metadata.default_model = Some(ModelConfig::new("gpt-4.1", ModelProvider::OpenAI));
        metadata.model_overrides.insert(
            "cathie_wood".to_string(),
            ModelConfig::new("gemini-2.0-flash", ModelProvider::Google),
        );
        let state = state_with(metadata);

        assert_eq!(state.model_for("cathie_wood").unwrap().provider, ModelProvider::Google);
        assert_eq!(state.model_for("ben_graham").unwrap().provider, ModelProvider::OpenAI);

        let bare = state_with(RunMetadata::new());
        assert!(bare.model_for("ben_graham").is_none());
    }
}
