//! Analysis task kinds and registry
//!
//! Every task kind is listed in [`TaskKind`] and mapped to its executor in a
//! [`TaskRegistry`] built once at startup. Adding a kind means adding a
//! variant and its registry entry.

use crate::data::MarketData;
use crate::invoker::{OutputSchema, TaskCall, TaskInvoker};
use crate::models::{AnalystSignal, TaskResult};
use crate::provider::Prompt;
use crate::state::SharedState;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

const METRICS_LIMIT: usize = 5;
const NEWS_LIMIT: usize = 10;
const INSIDER_TRADES_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    WarrenBuffett,
    BenGraham,
    CharlieMunger,
    PhilFisher,
    PeterLynch,
    CathieWood,
    BillAckman,
    MichaelBurry,
    StanleyDruckenmiller,
    AswathDamodaran,
    RakeshJhunjhunwala,
    TechnicalAnalyst,
    FundamentalsAnalyst,
    SentimentAnalyst,
    ValuationAnalyst,
}

impl TaskKind {
    pub const ALL: [TaskKind; 15] = [
        TaskKind::WarrenBuffett,
        TaskKind::BenGraham,
        TaskKind::CharlieMunger,
        TaskKind::PhilFisher,
        TaskKind::PeterLynch,
        TaskKind::CathieWood,
        TaskKind::BillAckman,
        TaskKind::MichaelBurry,
        TaskKind::StanleyDruckenmiller,
        TaskKind::AswathDamodaran,
        TaskKind::RakeshJhunjhunwala,
        TaskKind::TechnicalAnalyst,
        TaskKind::FundamentalsAnalyst,
        TaskKind::SentimentAnalyst,
        TaskKind::ValuationAnalyst,
    ];

    /// Stable id used in requests, result keys and model overrides.
    pub fn key(&self) -> &'static str {
        match self {
            TaskKind::WarrenBuffett => "warren_buffett",
            TaskKind::BenGraham => "ben_graham",
            TaskKind::CharlieMunger => "charlie_munger",
            TaskKind::PhilFisher => "phil_fisher",
            TaskKind::PeterLynch => "peter_lynch",
            TaskKind::CathieWood => "cathie_wood",
            TaskKind::BillAckman => "bill_ackman",
            TaskKind::MichaelBurry => "michael_burry",
            TaskKind::StanleyDruckenmiller => "stanley_druckenmiller",
            TaskKind::AswathDamodaran => "aswath_damodaran",
            TaskKind::RakeshJhunjhunwala => "rakesh_jhunjhunwala",
            TaskKind::TechnicalAnalyst => "technical_analyst",
            TaskKind::FundamentalsAnalyst => "fundamentals_analyst",
            TaskKind::SentimentAnalyst => "sentiment_analyst",
            TaskKind::ValuationAnalyst => "valuation_analyst",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TaskKind::WarrenBuffett => "Warren Buffett",
            TaskKind::BenGraham => "Ben Graham",
            TaskKind::CharlieMunger => "Charlie Munger",
            TaskKind::PhilFisher => "Phil Fisher",
            TaskKind::PeterLynch => "Peter Lynch",
            TaskKind::CathieWood => "Cathie Wood",
            TaskKind::BillAckman => "Bill Ackman",
            TaskKind::MichaelBurry => "Michael Burry",
            TaskKind::StanleyDruckenmiller => "Stanley Druckenmiller",
            TaskKind::AswathDamodaran => "Aswath Damodaran",
            TaskKind::RakeshJhunjhunwala => "Rakesh Jhunjhunwala",
            TaskKind::TechnicalAnalyst => "Technical Analyst",
            TaskKind::FundamentalsAnalyst => "Fundamentals Analyst",
            TaskKind::SentimentAnalyst => "Sentiment Analyst",
            TaskKind::ValuationAnalyst => "Valuation Analyst",
        }
    }

    fn principles(&self) -> &'static str {
        match self {
            TaskKind::WarrenBuffett => "Buy wonderful businesses at fair prices. Demand a durable competitive moat, consistent earnings, conservative debt and shareholder-oriented management. Insist on a margin of safety.",
            TaskKind::BenGraham => "Demand a margin of safety below intrinsic value. Prefer low price-to-earnings and price-to-book, strong current ratio, low leverage and a long record of stable earnings.",
            TaskKind::CharlieMunger => "Invert, always invert. Favour predictable businesses with high returns on capital, pricing power and honest management. Pay a fair price for quality and avoid what you cannot understand.",
            TaskKind::PhilFisher => "Emphasize long-term growth potential and quality of management. Focus on companies investing in R&D, with strong and consistent margins. Willing to pay more for exceptional companies but still mindful of valuation.",
            TaskKind::PeterLynch => "Invest in what you know. Look for growth at a reasonable price (PEG ratio), understandable businesses, steady earnings growth and manageable debt. Seek potential ten-baggers.",
            TaskKind::CathieWood => "Seek disruptive innovation with exponential growth potential. Favour large addressable markets, heavy R&D and technology platforms. Accept volatility for a five-year horizon.",
            TaskKind::BillAckman => "Concentrate on high-quality, simple, predictable businesses with strong free cash flow. Look for catalysts and room for operational or capital-allocation improvements.",
            TaskKind::MichaelBurry => "Hunt for deep value with a contrarian eye. Scrutinize free cash flow yield, balance sheet strength and insider buying. Be sceptical of narratives and crowded trades.",
            TaskKind::StanleyDruckenmiller => "Seek asymmetric risk-reward. Weigh growth and price momentum, sentiment and insider activity. Preserve capital and press bets when conviction is high.",
            TaskKind::AswathDamodaran => "Tie story to numbers. Value the business on growth, reinvestment efficiency and risk, compare intrinsic value with price, and state the key assumptions behind the valuation.",
            TaskKind::RakeshJhunjhunwala => "Back high-quality growth businesses with strong return on equity and capable management. Stay optimistic on long-term economic growth while demanding reasonable valuation.",
            TaskKind::TechnicalAnalyst => "Read trend, momentum, mean reversion and volatility from price history. Base the signal on price action rather than fundamentals.",
            TaskKind::FundamentalsAnalyst => "Judge profitability, growth, financial health and valuation ratios. Base the signal on the financial statements.",
            TaskKind::SentimentAnalyst => "Judge market sentiment from news flow and insider transactions. Weigh recent headlines and net insider buying or selling.",
            TaskKind::ValuationAnalyst => "Estimate intrinsic value from earnings, margins and growth and compare it with market capitalization. Base the signal on the valuation gap.",
        }
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        let key = key.strip_suffix("_agent").unwrap_or(&key);

        TaskKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.key() == key)
            .ok_or_else(|| format!("unknown analysis task '{}'", s))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl OutputSchema for AnalystSignal {
    fn output_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "signal": { "type": "string", "enum": ["bullish", "bearish", "neutral"] },
                "confidence": { "type": "number", "minimum": 0, "maximum": 100 },
                "reasoning": { "type": "string" }
            },
            "required": ["signal", "confidence", "reasoning"],
            "additionalProperties": false
        })
    }
}

/// Everything a task needs during a run.
#[derive(Clone)]
pub struct TaskContext {
    pub state: Arc<SharedState>,
    pub invoker: Arc<TaskInvoker>,
}

/// Trait for a single analysis task
#[async_trait]
pub trait AnalysisTask: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Produce one signal per symbol. Errors other than fatal configuration
    /// are replaced by a default entry by the executor.
    async fn analyze(&self, ctx: &TaskContext) -> Result<TaskResult>;
}

/// Analyst that reasons in the voice of a named investor or discipline.
pub struct PersonaAnalyst {
    kind: TaskKind,
    data: MarketData,
}

impl PersonaAnalyst {
    pub fn new(kind: TaskKind, data: MarketData) -> Self {
        Self { kind, data }
    }

    /// Collect the facts the prompt is built from.
    async fn gather(&self, ticker: &str, state: &SharedState) -> Value {
        let range = &state.date_range;

        let prices = self.data.prices(ticker, range).await;
        let metrics = self.data.financial_metrics(ticker, range.end, METRICS_LIMIT).await;
        let news = self.data.company_news(ticker, range, NEWS_LIMIT).await;
        let trades = self
            .data
            .insider_trades(ticker, range, INSIDER_TRADES_LIMIT)
            .await;

        let price_summary = match (prices.first(), prices.last()) {
            (Some(first), Some(last)) if first.close > 0.0 => json!({
                "first_close": first.close,
                "latest_close": last.close,
                "change_pct": (last.close - first.close) / first.close * 100.0,
                "observations": prices.len(),
            }),
            _ => Value::Null,
        };

        let net_insider_shares: f64 = trades.iter().filter_map(|t| t.transaction_shares).sum();

        json!({
            "ticker": ticker,
            "period": { "start": range.start, "end": range.end },
            "prices": price_summary,
            "financial_metrics": metrics,
            "news": news
                .iter()
                .map(|n| json!({ "title": n.title, "date": n.date, "sentiment": n.sentiment }))
                .collect::<Vec<_>>(),
            "insider_activity": {
                "trades": trades.len(),
                "net_shares": net_insider_shares,
            },
        })
    }

    fn build_prompt(&self, ticker: &str, analysis: &Value) -> Prompt {
        let name = self.kind.display_name();

        let system = format!(
            r#"You are a {} AI agent, making investment decisions using these principles:

{}

When providing your reasoning, be specific: cite the metrics and trends from the analysis data.

You must output a JSON object with:
  - "signal": "bullish" or "bearish" or "neutral"
  - "confidence": a float between 0 and 100
  - "reasoning": a detailed explanation"#,
            name,
            self.kind.principles()
        );

        let analysis_data =
            serde_json::to_string_pretty(analysis).unwrap_or_else(|_| analysis.to_string());

        let user = format!(
            r#"Based on the following analysis, create a {}-style investment signal.

Analysis Data for {}:
{}

Return the trading signal in this JSON format:
{{
  "signal": "bullish/bearish/neutral",
  "confidence": float (0-100),
  "reasoning": "string"
}}"#,
            name, ticker, analysis_data
        );

        Prompt { system, user }
    }
}

#[async_trait]
impl AnalysisTask for PersonaAnalyst {
    fn kind(&self) -> TaskKind {
        self.kind
    }

    async fn analyze(&self, ctx: &TaskContext) -> Result<TaskResult> {
        let state = ctx.state.as_ref();
        let mut signals = BTreeMap::new();
        let mut defaulted = Vec::new();

        for ticker in &state.symbols {
            debug!(task = self.kind.key(), ticker = %ticker, "Analyzing");

            let analysis = self.gather(ticker, state).await;
            let call = TaskCall {
                task_key: self.kind.key(),
                prompt: self.build_prompt(ticker, &analysis),
            };

            let outcome = ctx
                .invoker
                .invoke(call, state, AnalystSignal::neutral_default)
                .await?;

            let mut signal = outcome.payload;
            signal.confidence = signal.confidence.clamp(0.0, 100.0);

            if !outcome.success {
                defaulted.push(ticker.clone());
            }
            signals.insert(ticker.clone(), signal);
        }

        info!(
            task = self.kind.key(),
            symbols = signals.len(),
            defaulted = defaulted.len(),
            "Analysis complete"
        );

        Ok(TaskResult { signals, defaulted })
    }
}

/// Static mapping from task kind to executor
pub struct TaskRegistry {
    tasks: HashMap<TaskKind, Arc<dyn AnalysisTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    pub fn register(&mut self, task: Arc<dyn AnalysisTask>) {
        self.tasks.insert(task.kind(), task);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn AnalysisTask>> {
        self.tasks.get(&kind).cloned()
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.tasks.contains_key(&kind)
    }

    pub fn list(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<_> = self.tasks.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry with every analyst kind backed by `data`.
pub fn create_default_registry(data: MarketData) -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    for kind in TaskKind::ALL {
        registry.register(Arc::new(PersonaAnalyst::new(kind, data.clone())));
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CompanyNews, InMemoryMarketData, Price};
    use crate::error::InvocationError;
    use crate::models::{DateRange, ModelConfig, ModelProvider, Portfolio, Signal};
    use crate::provider::{ProviderRegistry, ScriptedProvider};
    use crate::rate_limit::RateGovernor;
    use crate::invoker::RetryPolicy;
    use crate::state::RunMetadata;
    use chrono::NaiveDate;

    fn context(provider: Arc<ScriptedProvider>, symbols: &[&str]) -> TaskContext {
        let symbols: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        let mut providers = ProviderRegistry::new();
        providers.register(provider);

        let invoker = TaskInvoker::new(
            providers,
            Arc::new(RateGovernor::unlimited()),
            RetryPolicy::default(),
            ModelConfig::new("gemini-2.0-flash", ModelProvider::Google),
        );

        let state = SharedState::new(
            symbols.clone(),
            DateRange::ending(NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(), 90),
            Portfolio::new(Portfolio::DEFAULT_CASH, &symbols),
            RunMetadata::new(),
        );

        TaskContext {
            state: Arc::new(state),
            invoker: Arc::new(invoker),
        }
    }

    #[test]
    fn test_task_kind_parsing() {
        assert_eq!("ben_graham".parse::<TaskKind>().unwrap(), TaskKind::BenGraham);
        assert_eq!("Phil_Fisher_agent".parse::<TaskKind>().unwrap(), TaskKind::PhilFisher);
        assert!("jim_cramer".parse::<TaskKind>().is_err());

        for kind in TaskKind::ALL {
            assert_eq!(kind.key().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_default_registry_covers_every_kind() {
        let registry = create_default_registry(MarketData::empty());
        assert_eq!(registry.list().len(), TaskKind::ALL.len());
        assert_eq!(registry.get(TaskKind::CathieWood).unwrap().kind(), TaskKind::CathieWood);
    }

    #[tokio::test]
    async fn test_persona_prompt_carries_market_data() {
        let provider = Arc::new(ScriptedProvider::always(
            ModelProvider::Google,
            json!({"signal": "bullish", "confidence": 140.0, "reasoning": "growth"}),
        ));
        let source = InMemoryMarketData::new()
            .with_prices(
                "NVDA",
                vec![
                    Price { time: "2024-01-02".into(), open: 100.0, high: 100.0, low: 100.0, close: 100.0, volume: 10 },
                    Price { time: "2024-03-28".into(), open: 150.0, high: 150.0, low: 150.0, close: 150.0, volume: 10 },
                ],
            )
            .with_news(
                "NVDA",
                vec![CompanyNews {
                    ticker: "NVDA".into(),
                    title: "Data center demand surges".into(),
                    date: "2024-03-20".into(),
                    source: None,
                    sentiment: Some("positive".into()),
                }],
            );
        let analyst = PersonaAnalyst::new(TaskKind::CathieWood, MarketData::new(Arc::new(source)));
        let ctx = context(provider.clone(), &["NVDA"]);

        let result = analyst.analyze(&ctx).await.unwrap();

        let signal = &result.signals["NVDA"];
        assert_eq!(signal.signal, Signal::Bullish);
        assert_eq!(signal.confidence, 100.0);
        assert!(!result.is_degraded());

        let request = &provider.requests().await[0];
        assert!(request.prompt.system.contains("Cathie Wood"));
        assert!(request.prompt.user.contains("Data center demand surges"));
        assert!(request.prompt.user.contains("\"change_pct\": 50.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_symbols_are_marked_defaulted() {
        let provider = Arc::new(ScriptedProvider::new(ModelProvider::Google, true, |request, _| {
            if request.prompt.user.contains("Analysis Data for MSFT") {
                Err(InvocationError::TransientProvider("503".into()))
            } else {
                Ok(crate::provider::ProviderReply::Structured(json!({
                    "signal": "bearish", "confidence": 55.0, "reasoning": "valuation"
                })))
            }
        }));
        let analyst = PersonaAnalyst::new(TaskKind::BenGraham, MarketData::empty());
        let ctx = context(provider, &["AAPL", "MSFT"]);

        let result = analyst.analyze(&ctx).await.unwrap();

        assert_eq!(result.signals.len(), 2);
        assert_eq!(result.signals["AAPL"].signal, Signal::Bearish);
        assert_eq!(result.signals["MSFT"], AnalystSignal::neutral_default());
        assert_eq!(result.defaulted, vec!["MSFT".to_string()]);
    }
}
