//! Run entry point
//!
//! REQUEST → BUILD GRAPH → EXECUTE → AGGREGATED DECISION

use crate::aggregate::{LlmPortfolioManager, PortfolioAggregator, PositionLimitRiskManager, RiskAggregator};
use crate::config::OrchestratorConfig;
use crate::data::{HttpMarketData, MarketData};
use crate::graph::{GraphBuilder, GraphExecutor, GraphPolicy};
use crate::invoker::TaskInvoker;
use crate::models::{AggregatedDecision, RunRequest};
use crate::provider::ProviderRegistry;
use crate::rate_limit::RateGovernor;
use crate::state::SharedState;
use crate::tasks::{create_default_registry, TaskRegistry};
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    executor: GraphExecutor,
    policy: GraphPolicy,
}

impl Orchestrator {
    pub fn new(registry: Arc<TaskRegistry>, executor: GraphExecutor, policy: GraphPolicy) -> Self {
        Self {
            registry,
            executor,
            policy,
        }
    }

    /// Assemble the production stack: configured providers, the process-wide
    /// rate governor, HTTP market data when a base URL is set.
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        let data = match &config.financial_api_base_url {
            Some(base_url) => MarketData::new(Arc::new(HttpMarketData::new(
                base_url,
                config.financial_api_key.clone(),
            )?)),
            None => {
                warn!("FINANCIAL_API_BASE_URL not set, analysts will run without market data");
                MarketData::empty()
            }
        };

        let providers = ProviderRegistry::from_config(config)?;
        info!(providers = ?providers.list(), "Inference providers registered");

        let invoker = Arc::new(TaskInvoker::new(
            providers,
            RateGovernor::global(),
            config.retry.clone(),
            config.default_model.clone(),
        ));

        let registry = Arc::new(create_default_registry(data.clone()));
        let risk: Arc<dyn RiskAggregator> = Arc::new(PositionLimitRiskManager::new(data));
        let portfolio: Arc<dyn PortfolioAggregator> = Arc::new(LlmPortfolioManager);

        let executor = GraphExecutor::new(registry.clone(), invoker, risk, portfolio)
            .with_max_workers(config.max_concurrent_nodes);

        Ok(Self::new(registry, executor, config.graph))
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Execute one complete analysis run.
    pub async fn run(&self, request: RunRequest) -> Result<AggregatedDecision> {
        let started = Instant::now();
        let state = SharedState::from_request(&request)?;
        let run_id = state.run_id();

        info!(
            run_id = %run_id,
            tasks = ?request.tasks,
            symbols = ?state.symbols,
            start = %state.date_range.start,
            end = %state.date_range.end,
            "Run received"
        );

        let graph = GraphBuilder::new(&self.registry)
            .with_policy(self.policy)
            .build(&request.tasks);

        let decision = self.executor.run(&graph, state).await?;

        info!(
            run_id = %run_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run complete"
        );

        Ok(decision)
    }

    /// Run on a background task so the caller's executor is never blocked.
    pub fn spawn_run(self: &Arc<Self>, request: RunRequest) -> JoinHandle<Result<AggregatedDecision>> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.run(request).await })
    }
}
