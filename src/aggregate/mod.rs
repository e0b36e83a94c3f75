//! Risk and portfolio aggregation
//!
//! The last two graph nodes. Both read the complete result mapping and never
//! write task results.

use crate::data::MarketData;
use crate::invoker::{OutputSchema, TaskCall};
use crate::models::{Position, RiskAssessment, Signal, TradeAction, TradeDecision};
use crate::provider::Prompt;
use crate::state::SharedState;
use crate::tasks::TaskContext;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Model override key used by the portfolio aggregator.
pub const PORTFOLIO_MANAGER_KEY: &str = "portfolio_manager";

/// Largest single position as a share of total portfolio value.
const POSITION_LIMIT_PCT: f64 = 0.20;

/// Net weighted signal needed before the consensus manager trades.
const CONSENSUS_THRESHOLD: f64 = 0.2;

#[async_trait]
pub trait RiskAggregator: Send + Sync {
    async fn assess(&self, ctx: &TaskContext) -> Result<BTreeMap<String, RiskAssessment>>;
}

#[async_trait]
pub trait PortfolioAggregator: Send + Sync {
    /// Runs after risk assessment has been stored in the shared state.
    async fn decide(&self, ctx: &TaskContext) -> Result<BTreeMap<String, TradeDecision>>;
}

//
// ================= Risk =================
//

/// Caps each position at a fixed share of total portfolio value.
pub struct PositionLimitRiskManager {
    data: MarketData,
}

impl PositionLimitRiskManager {
    pub fn new(data: MarketData) -> Self {
        Self { data }
    }
}

#[async_trait]
impl RiskAggregator for PositionLimitRiskManager {
    async fn assess(&self, ctx: &TaskContext) -> Result<BTreeMap<String, RiskAssessment>> {
        let state = ctx.state.as_ref();
        let portfolio = &state.portfolio;

        let mut prices = BTreeMap::new();
        for ticker in &state.symbols {
            if let Some(price) = self.data.latest_close(ticker, &state.date_range).await {
                prices.insert(ticker.clone(), price);
            }
        }

        let holdings: f64 = prices
            .iter()
            .map(|(ticker, price)| {
                let position = portfolio.position(ticker);
                (position.long as f64 - position.short as f64) * price
            })
            .sum();
        let total_value = portfolio.cash + holdings;

        let mut assessments = BTreeMap::new();

        for ticker in &state.symbols {
            let assessment = match prices.get(ticker) {
                Some(&price) => {
                    let position = portfolio.position(ticker);
                    let exposure = (position.long as f64 + position.short as f64) * price;
                    let limit = total_value * POSITION_LIMIT_PCT;
                    let remaining = (limit - exposure).max(0.0).min(portfolio.cash.max(0.0));

                    RiskAssessment {
                        remaining_position_limit: remaining,
                        current_price: price,
                        reasoning: format!(
                            "Portfolio value {:.2}, position limit {:.2}, current exposure {:.2}, cash {:.2}",
                            total_value, limit, exposure, portfolio.cash
                        ),
                    }
                }
                None => {
                    warn!(ticker = %ticker, "No price data, position limit set to zero");
                    RiskAssessment {
                        remaining_position_limit: 0.0,
                        current_price: 0.0,
                        reasoning: "No price data available".to_string(),
                    }
                }
            };
            assessments.insert(ticker.clone(), assessment);
        }

        debug!(symbols = assessments.len(), total_value, "Risk assessment complete");
        Ok(assessments)
    }
}

//
// ================= Portfolio =================
//

fn max_quantity(action: TradeAction, position: &Position, risk: Option<&RiskAssessment>) -> u64 {
    let affordable = match risk {
        Some(r) if r.current_price > 0.0 => (r.remaining_position_limit / r.current_price).floor() as u64,
        _ => 0,
    };

    match action {
        TradeAction::Buy | TradeAction::Short => affordable,
        TradeAction::Sell => position.long,
        TradeAction::Cover => position.short,
        TradeAction::Hold => 0,
    }
}

/// Rule-based manager: trades in the direction of the confidence-weighted
/// consensus once it clears a fixed threshold.
pub struct ConsensusPortfolioManager {
    threshold: f64,
}

impl ConsensusPortfolioManager {
    pub fn new() -> Self {
        Self {
            threshold: CONSENSUS_THRESHOLD,
        }
    }
}

impl Default for ConsensusPortfolioManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortfolioAggregator for ConsensusPortfolioManager {
    async fn decide(&self, ctx: &TaskContext) -> Result<BTreeMap<String, TradeDecision>> {
        let state = ctx.state.as_ref();
        let results = state.results().await;
        let risk = state.risk().await;

        let mut decisions = BTreeMap::new();

        for ticker in &state.symbols {
            let mut weighted = 0.0;
            let mut total = 0.0;
            let mut voters = 0;

            // Defaulted signals carry no opinion.
            for result in results.values() {
                if result.defaulted.contains(ticker) {
                    continue;
                }
                if let Some(signal) = result.signals.get(ticker) {
                    let direction = match signal.signal {
                        Signal::Bullish => 1.0,
                        Signal::Bearish => -1.0,
                        Signal::Neutral => 0.0,
                    };
                    weighted += direction * signal.confidence;
                    total += signal.confidence;
                    voters += 1;
                }
            }

            if voters == 0 || total <= 0.0 {
                decisions.insert(ticker.clone(), TradeDecision::hold("No usable analyst signals"));
                continue;
            }

            let score = weighted / total;
            let position = state.portfolio.position(ticker);

            let action = if score >= self.threshold {
                TradeAction::Buy
            } else if score <= -self.threshold {
                if position.long > 0 {
                    TradeAction::Sell
                } else {
                    TradeAction::Short
                }
            } else {
                TradeAction::Hold
            };

            let quantity = max_quantity(action, &position, risk.get(ticker));
            let decision = if quantity == 0 {
                TradeDecision {
                    action: TradeAction::Hold,
                    quantity: 0,
                    confidence: (score.abs() * 100.0).clamp(0.0, 100.0),
                    reasoning: format!(
                        "Consensus score {:.2} from {} analysts, no tradable quantity",
                        score, voters
                    ),
                }
            } else {
                TradeDecision {
                    action,
                    quantity,
                    confidence: (score.abs() * 100.0).clamp(0.0, 100.0),
                    reasoning: format!("Consensus score {:.2} from {} analysts", score, voters),
                }
            };

            decisions.insert(ticker.clone(), decision);
        }

        info!(decisions = decisions.len(), "Consensus decisions made");
        Ok(decisions)
    }
}

/// Structured reply expected from the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PortfolioManagerOutput {
    pub decisions: BTreeMap<String, TradeDecision>,
}

impl OutputSchema for PortfolioManagerOutput {
    fn output_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "decisions": {
                    "type": "object",
                    "additionalProperties": {
                        "type": "object",
                        "properties": {
                            "action": { "type": "string", "enum": ["buy", "sell", "short", "cover", "hold"] },
                            "quantity": { "type": "integer", "minimum": 0 },
                            "confidence": { "type": "number", "minimum": 0, "maximum": 100 },
                            "reasoning": { "type": "string" }
                        },
                        "required": ["action", "quantity", "confidence", "reasoning"]
                    }
                }
            },
            "required": ["decisions"]
        })
    }
}

/// Manager that asks a model for the final call, then clamps every order to
/// what the risk limits and current positions allow.
pub struct LlmPortfolioManager;

impl LlmPortfolioManager {
    fn build_prompt(state: &SharedState, signals: &Value, limits: &Value) -> Prompt {
        let system = r#"You are a portfolio manager making final trading decisions based on multiple tickers.

Trading rules:
- Only buy if you have available cash and the order stays within the position limit
- Only sell if you currently hold long shares of that ticker
- Only short within the position limit and margin requirement
- Only cover if you have existing short positions
- Quantity must never exceed the max shares provided for each ticker

Inputs:
- signals_by_ticker: ticker -> analyst -> signal
- limits_by_ticker: ticker -> price, max shares per action
- portfolio: cash, margin requirement, positions"#
            .to_string();

        let portfolio = serde_json::to_string_pretty(&state.portfolio)
            .unwrap_or_else(|_| "{}".to_string());

        let user = format!(
            r#"Based on the team's analysis, make your trading decisions for each ticker.

Signals by ticker:
{}

Limits by ticker:
{}

Portfolio:
{}

Output strictly in JSON with the following structure:
{{
  "decisions": {{
    "TICKER": {{
      "action": "buy/sell/short/cover/hold",
      "quantity": integer,
      "confidence": float between 0 and 100,
      "reasoning": "string"
    }}
  }}
}}"#,
            serde_json::to_string_pretty(signals).unwrap_or_else(|_| signals.to_string()),
            serde_json::to_string_pretty(limits).unwrap_or_else(|_| limits.to_string()),
            portfolio
        );

        Prompt { system, user }
    }
}

#[async_trait]
impl PortfolioAggregator for LlmPortfolioManager {
    async fn decide(&self, ctx: &TaskContext) -> Result<BTreeMap<String, TradeDecision>> {
        let state = ctx.state.as_ref();
        let results = state.results().await;
        let risk = state.risk().await;

        let mut signals = serde_json::Map::new();
        let mut limits = serde_json::Map::new();

        for ticker in &state.symbols {
            let by_analyst: serde_json::Map<String, Value> = results
                .iter()
                .filter(|(_, result)| !result.defaulted.contains(ticker))
                .filter_map(|(task, result)| {
                    result.signals.get(ticker).map(|s| {
                        (task.clone(), json!({ "signal": s.signal, "confidence": s.confidence }))
                    })
                })
                .collect();
            signals.insert(ticker.clone(), Value::Object(by_analyst));

            let position = state.portfolio.position(ticker);
            let assessment = risk.get(ticker);
            limits.insert(
                ticker.clone(),
                json!({
                    "current_price": assessment.map(|r| r.current_price).unwrap_or(0.0),
                    "max_buy": max_quantity(TradeAction::Buy, &position, assessment),
                    "max_sell": max_quantity(TradeAction::Sell, &position, assessment),
                    "max_short": max_quantity(TradeAction::Short, &position, assessment),
                    "max_cover": max_quantity(TradeAction::Cover, &position, assessment),
                }),
            );
        }

        let call = TaskCall {
            task_key: PORTFOLIO_MANAGER_KEY,
            prompt: Self::build_prompt(state, &Value::Object(signals), &Value::Object(limits)),
        };

        let outcome = ctx
            .invoker
            .invoke(call, state, PortfolioManagerOutput::default)
            .await?;

        if !outcome.success {
            warn!(
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Portfolio manager defaulted, holding all positions"
            );
        }

        let mut proposed = outcome.payload.decisions;
        let mut decisions = BTreeMap::new();

        for ticker in &state.symbols {
            let decision = match proposed.remove(ticker) {
                Some(mut decision) => {
                    let position = state.portfolio.position(ticker);
                    let cap = max_quantity(decision.action, &position, risk.get(ticker));
                    if decision.quantity > cap {
                        debug!(ticker = %ticker, requested = decision.quantity, cap, "Clamping order quantity");
                        decision.quantity = cap;
                    }
                    decision.confidence = decision.confidence.clamp(0.0, 100.0);
                    if decision.action == TradeAction::Hold {
                        decision.quantity = 0;
                    }
                    decision
                }
                None => TradeDecision::hold("Error in portfolio management, defaulting to hold"),
            };
            decisions.insert(ticker.clone(), decision);
        }

        info!(decisions = decisions.len(), "Portfolio decisions made");
        Ok(decisions)
    }
}
