//! Concurrent graph execution
//!
//! Nodes run as soon as every predecessor has finished. Ready nodes share a
//! worker pool bounded by a semaphore. Task results are merged into the shared
//! state the moment each task completes.

use super::{ExecutionGraph, NodeId};
use crate::aggregate::{PortfolioAggregator, RiskAggregator};
use crate::error::OrchestrationError;
use crate::invoker::TaskInvoker;
use crate::models::{AggregatedDecision, TaskResult, TradeDecision};
use crate::state::SharedState;
use crate::tasks::{TaskContext, TaskRegistry};
use crate::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

enum NodeOutput {
    Done,
    Decisions(BTreeMap<String, TradeDecision>),
}

type NodeHandle = (NodeId, Result<NodeOutput>);

pub struct GraphExecutor {
    registry: Arc<TaskRegistry>,
    invoker: Arc<TaskInvoker>,
    risk: Arc<dyn RiskAggregator>,
    portfolio: Arc<dyn PortfolioAggregator>,
    max_workers: Option<usize>,
}

impl GraphExecutor {
    pub fn new(
        registry: Arc<TaskRegistry>,
        invoker: Arc<TaskInvoker>,
        risk: Arc<dyn RiskAggregator>,
        portfolio: Arc<dyn PortfolioAggregator>,
    ) -> Self {
        Self {
            registry,
            invoker,
            risk,
            portfolio,
            max_workers: None,
        }
    }

    /// Cap the number of nodes running at once.
    pub fn with_max_workers(mut self, max_workers: Option<usize>) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Execute `graph` to completion and return the terminal node's output.
    pub async fn run(&self, graph: &ExecutionGraph, state: SharedState) -> Result<AggregatedDecision> {
        graph.validate()?;

        let run_id = state.run_id();
        let started = Instant::now();
        let ctx = TaskContext {
            state: Arc::new(state),
            invoker: self.invoker.clone(),
        };

        let workers = self.max_workers.unwrap_or(graph.nodes().len()).max(1);
        let permits = Arc::new(Semaphore::new(workers));

        info!(
            run_id = %run_id,
            nodes = graph.nodes().len(),
            topology = ?graph.topology(),
            workers,
            "Starting graph execution"
        );

        let mut pending: HashMap<NodeId, usize> = graph
            .nodes()
            .iter()
            .map(|node| (*node, graph.predecessors(*node).len()))
            .collect();

        let mut running: JoinSet<NodeHandle> = JoinSet::new();
        for node in graph.nodes() {
            if pending.get(node) == Some(&0) {
                self.spawn_node(&mut running, &permits, *node, &ctx);
            }
        }

        let mut decisions = None;

        while let Some(joined) = running.join_next().await {
            let (node, outcome) = match joined {
                Ok(handle) => handle,
                Err(e) => {
                    running.abort_all();
                    error!(run_id = %run_id, error = %e, "Graph node panicked");
                    return Err(OrchestrationError::ExecutionError(format!(
                        "graph node failed to complete: {}",
                        e
                    )));
                }
            };

            match outcome {
                Ok(NodeOutput::Done) => {}
                Ok(NodeOutput::Decisions(output)) => decisions = Some(output),
                Err(e) => {
                    running.abort_all();
                    error!(run_id = %run_id, node = %node, error = %e, "Aborting run");
                    return Err(e);
                }
            }

            debug!(run_id = %run_id, node = %node, "Node completed");

            for next in graph.successors(node) {
                if let Some(remaining) = pending.get_mut(&next) {
                    *remaining -= 1;
                    if *remaining == 0 {
                        self.spawn_node(&mut running, &permits, next, &ctx);
                    }
                }
            }
        }

        let decisions = decisions.ok_or_else(|| {
            OrchestrationError::ExecutionError(format!(
                "terminal node {} produced no output",
                graph.terminal()
            ))
        })?;

        let analyst_signals = ctx.state.results().await;
        let degraded = analyst_signals.values().filter(|r| r.is_degraded()).count();

        info!(
            run_id = %run_id,
            tasks = analyst_signals.len(),
            degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Graph execution complete"
        );

        Ok(AggregatedDecision {
            decisions,
            analyst_signals,
            risk: ctx.state.risk().await,
        })
    }

    fn spawn_node(
        &self,
        running: &mut JoinSet<NodeHandle>,
        permits: &Arc<Semaphore>,
        node: NodeId,
        ctx: &TaskContext,
    ) {
        let permits = permits.clone();
        let ctx = ctx.clone();
        let registry = self.registry.clone();
        let risk = self.risk.clone();
        let portfolio = self.portfolio.clone();

        running.spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (
                        node,
                        Err(OrchestrationError::ExecutionError("worker pool closed".to_string())),
                    )
                }
            };

            let outcome = execute_node(node, &ctx, &registry, risk.as_ref(), portfolio.as_ref()).await;
            (node, outcome)
        });
    }
}

async fn execute_node(
    node: NodeId,
    ctx: &TaskContext,
    registry: &TaskRegistry,
    risk: &dyn RiskAggregator,
    portfolio: &dyn PortfolioAggregator,
) -> Result<NodeOutput> {
    match node {
        NodeId::Start => Ok(NodeOutput::Done),

        NodeId::Task(kind) => {
            let result = match registry.get(kind) {
                Some(task) => match task.analyze(ctx).await {
                    Ok(result) => result,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(
                            task = kind.key(),
                            error = %e,
                            "Task failed, recording default signals"
                        );
                        TaskResult::all_default(&ctx.state.symbols)
                    }
                },
                None => {
                    warn!(task = kind.key(), "Task not registered, recording default signals");
                    TaskResult::all_default(&ctx.state.symbols)
                }
            };

            ctx.state.merge_result(kind.key(), result).await?;
            Ok(NodeOutput::Done)
        }

        NodeId::RiskManager => {
            let assessments = risk.assess(ctx).await.map_err(|e| aggregation_failed(node, e))?;
            ctx.state.set_risk(assessments).await;
            Ok(NodeOutput::Done)
        }

        NodeId::PortfolioManager => {
            let decisions = portfolio.decide(ctx).await.map_err(|e| aggregation_failed(node, e))?;
            Ok(NodeOutput::Decisions(decisions))
        }
    }
}

/// Fatal errors pass through untouched so the caller can still tell them apart.
fn aggregation_failed(node: NodeId, err: OrchestrationError) -> OrchestrationError {
    if err.is_fatal() {
        err
    } else {
        OrchestrationError::AggregationError(format!("{}: {}", node, err))
    }
}
