//! Core data models for the analyst orchestrator

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::OrchestrationError;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Short,
    Cover,
    Hold,
}

/// Remote inference vendor. Quotas are tracked per provider.
/// Every variant has a client in [`crate::provider::ProviderRegistry::from_config`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelProvider {
    OpenAI,
    Google,
    Groq,
    DeepSeek,
}

impl ModelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelProvider::OpenAI => "OPENAI",
            ModelProvider::Google => "GOOGLE",
            ModelProvider::Groq => "GROQ",
            ModelProvider::DeepSeek => "DEEPSEEK",
        }
    }
}

impl FromStr for ModelProvider {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "OPENAI" => Ok(ModelProvider::OpenAI),
            "GOOGLE" | "GEMINI" => Ok(ModelProvider::Google),
            "GROQ" => Ok(ModelProvider::Groq),
            "DEEPSEEK" => Ok(ModelProvider::DeepSeek),
            other => Err(OrchestrationError::FatalConfiguration(format!(
                "Unknown model provider: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ================= Model selection =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    pub model_name: String,
    pub provider: ModelProvider,
}

impl ModelConfig {
    pub fn new(model_name: impl Into<String>, provider: ModelProvider) -> Self {
        Self {
            model_name: model_name.into(),
            provider,
        }
    }
}

//
// ================= Run inputs =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> crate::Result<Self> {
        if start > end {
            return Err(OrchestrationError::InvalidRequest(format!(
                "start date {} is after end date {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Range of `days` calendar days ending at `end`.
    pub fn ending(end: NaiveDate, days: i64) -> Self {
        Self {
            start: end - chrono::Duration::days(days.max(0)),
            end,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    #[serde(default)]
    pub long: u64,
    #[serde(default)]
    pub short: u64,
    #[serde(default)]
    pub long_cost_basis: f64,
    #[serde(default)]
    pub short_cost_basis: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Portfolio {
    pub cash: f64,
    #[serde(default = "default_margin_requirement")]
    pub margin_requirement: f64,
    #[serde(default)]
    pub positions: BTreeMap<String, Position>,
}

fn default_margin_requirement() -> f64 {
    0.5
}

impl Portfolio {
    pub const DEFAULT_CASH: f64 = 100_000.0;

    pub fn new(cash: f64, tickers: &[String]) -> Self {
        Self {
            cash,
            margin_requirement: default_margin_requirement(),
            positions: tickers
                .iter()
                .map(|t| (t.clone(), Position::default()))
                .collect(),
        }
    }

    pub fn position(&self, ticker: &str) -> Position {
        self.positions.get(ticker).cloned().unwrap_or_default()
    }
}

/// Serving-layer request: one complete analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub tasks: Vec<String>,
    pub symbols: Vec<String>,
    pub date_range: DateRange,
    /// Keyed by task id (or `portfolio_manager`).
    #[serde(default)]
    pub model_overrides: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub default_model: Option<ModelConfig>,
    #[serde(default)]
    pub portfolio: Option<Portfolio>,
}

impl RunRequest {
    /// Uppercases and dedupes symbols in caller order.
    pub fn normalized_symbols(&self) -> crate::Result<Vec<String>> {
        let mut symbols: Vec<String> = Vec::with_capacity(self.symbols.len());
        for raw in &self.symbols {
            let symbol = raw.trim().to_uppercase();
            if !symbol.is_empty() && !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }

        if symbols.is_empty() {
            return Err(OrchestrationError::InvalidRequest(
                "at least one symbol is required".to_string(),
            ));
        }

        Ok(symbols)
    }
}

//
// ================= Task output =================
//

/// Structured opinion returned by one analysis task for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalystSignal {
    pub signal: Signal,
    /// 0 to 100
    pub confidence: f64,
    pub reasoning: String,
}

impl AnalystSignal {
    pub fn neutral_default() -> Self {
        Self {
            signal: Signal::Neutral,
            confidence: 0.0,
            reasoning: "Error in analysis, defaulting to neutral".to_string(),
        }
    }
}

/// One entry of the shared result mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub signals: BTreeMap<String, AnalystSignal>,
    /// Symbols whose signal is the default payload.
    #[serde(default)]
    pub defaulted: Vec<String>,
}

impl TaskResult {
    /// Every symbol defaulted, used when a task fails outside the invoker.
    pub fn all_default(symbols: &[String]) -> Self {
        Self {
            signals: symbols
                .iter()
                .map(|s| (s.clone(), AnalystSignal::neutral_default()))
                .collect(),
            defaulted: symbols.to_vec(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.defaulted.is_empty()
    }
}

//
// ================= Aggregation =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub remaining_position_limit: f64,
    pub current_price: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeDecision {
    pub action: TradeAction,
    pub quantity: u64,
    pub confidence: f64,
    pub reasoning: String,
}

impl TradeDecision {
    pub fn hold(reasoning: impl Into<String>) -> Self {
        Self {
            action: TradeAction::Hold,
            quantity: 0,
            confidence: 0.0,
            reasoning: reasoning.into(),
        }
    }
}

/// Terminal output of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedDecision {
    pub decisions: BTreeMap<String, TradeDecision>,
    pub analyst_signals: BTreeMap<String, TaskResult>,
    pub risk: BTreeMap<String, RiskAssessment>,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Signal::Bullish => "bullish",
            Signal::Bearish => "bearish",
            Signal::Neutral => "neutral",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
            TradeAction::Short => "short",
            TradeAction::Cover => "cover",
            TradeAction::Hold => "hold",
        };
        write!(f, "{}", s)
    }
}
