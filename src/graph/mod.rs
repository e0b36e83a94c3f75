//! Execution graph construction
//!
//! The shape of a run is decided up front from the requested task list:
//!
//! ```text
//! parallel (n <= threshold)          chained (n > threshold)
//!
//!   start ─┬─ a ─┐                    start ─ a ─ b ─ ... ─ z
//!          ├─ b ─┼─ risk ─ portfolio                          │
//!          └─ c ─┘                          risk ─ portfolio ─┘
//! ```
//!
//! Building is pure: the same task list and policy always yield the same graph.

pub mod executor;

pub use executor::GraphExecutor;

use crate::error::OrchestrationError;
use crate::tasks::{TaskKind, TaskRegistry};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use tracing::{debug, warn};

pub const DEFAULT_PARALLEL_THRESHOLD: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPolicy {
    /// Largest task count still wired as a parallel fan-out.
    pub parallel_threshold: usize,
}

impl Default for GraphPolicy {
    fn default() -> Self {
        Self {
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Start,
    Task(TaskKind),
    RiskManager,
    PortfolioManager,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Start => f.write_str("start_node"),
            NodeId::Task(kind) => write!(f, "{}_agent", kind.key()),
            NodeId::RiskManager => f.write_str("risk_management_agent"),
            NodeId::PortfolioManager => f.write_str("portfolio_manager"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// No analysis tasks; source feeds the aggregators directly.
    Empty,
    Parallel,
    Chained,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionGraph {
    nodes: Vec<NodeId>,
    edges: Vec<(NodeId, NodeId)>,
    topology: Topology,
}

impl ExecutionGraph {
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn edges(&self) -> &[(NodeId, NodeId)] {
        &self.edges
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn source(&self) -> NodeId {
        NodeId::Start
    }

    pub fn terminal(&self) -> NodeId {
        NodeId::PortfolioManager
    }

    /// Task nodes in caller order.
    pub fn task_nodes(&self) -> Vec<TaskKind> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                NodeId::Task(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn predecessors(&self, node: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|(_, to)| *to == node)
            .map(|(from, _)| *from)
            .collect()
    }

    pub fn successors(&self, node: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|(from, _)| *from == node)
            .map(|(_, to)| *to)
            .collect()
    }

    /// Checks that the graph is acyclic and every non-source node is reachable
    /// from a predecessor.
    pub fn validate(&self) -> Result<()> {
        for node in &self.nodes {
            if *node != self.source() && self.predecessors(*node).is_empty() {
                return Err(OrchestrationError::InvalidGraph(format!(
                    "node {} has no predecessor",
                    node
                )));
            }
        }

        let mut in_degree: BTreeMap<NodeId, usize> =
            self.nodes.iter().map(|n| (*n, 0)).collect();
        for (from, to) in &self.edges {
            if !in_degree.contains_key(from) {
                return Err(OrchestrationError::InvalidGraph(format!(
                    "edge references unknown node {}",
                    from
                )));
            }
            match in_degree.get_mut(to) {
                Some(degree) => *degree += 1,
                None => {
                    return Err(OrchestrationError::InvalidGraph(format!(
                        "edge references unknown node {}",
                        to
                    )))
                }
            }
        }

        let mut ready: VecDeque<NodeId> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut visited = 0;

        while let Some(node) = ready.pop_front() {
            visited += 1;
            for next in self.successors(node) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(next);
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            return Err(OrchestrationError::InvalidGraph(
                "graph contains a cycle".to_string(),
            ));
        }

        Ok(())
    }
}

pub struct GraphBuilder<'a> {
    registry: &'a TaskRegistry,
    policy: GraphPolicy,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a TaskRegistry) -> Self {
        Self {
            registry,
            policy: GraphPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: GraphPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Unknown and unregistered ids are dropped with a warning; duplicates
    /// keep their first position.
    pub fn build<S: AsRef<str>>(&self, task_ids: &[S]) -> ExecutionGraph {
        let mut tasks: Vec<TaskKind> = Vec::with_capacity(task_ids.len());

        for id in task_ids {
            let id = id.as_ref();
            match id.parse::<TaskKind>() {
                Ok(kind) if self.registry.contains(kind) => {
                    if !tasks.contains(&kind) {
                        tasks.push(kind);
                    }
                }
                Ok(kind) => warn!(task = kind.key(), "Task kind not registered, skipping"),
                Err(e) => warn!(task = id, error = %e, "Unrecognized task id, skipping"),
            }
        }

        let mut nodes = vec![NodeId::Start];
        nodes.extend(tasks.iter().map(|kind| NodeId::Task(*kind)));
        nodes.push(NodeId::RiskManager);
        nodes.push(NodeId::PortfolioManager);

        let mut edges = Vec::with_capacity(tasks.len() + 3);

        let topology = if tasks.is_empty() {
            edges.push((NodeId::Start, NodeId::RiskManager));
            Topology::Empty
        } else if tasks.len() <= self.policy.parallel_threshold {
            for kind in &tasks {
                edges.push((NodeId::Start, NodeId::Task(*kind)));
                edges.push((NodeId::Task(*kind), NodeId::RiskManager));
            }
            Topology::Parallel
        } else {
            let mut previous = NodeId::Start;
            for kind in &tasks {
                edges.push((previous, NodeId::Task(*kind)));
                previous = NodeId::Task(*kind);
            }
            edges.push((previous, NodeId::RiskManager));
            Topology::Chained
        };

        edges.push((NodeId::RiskManager, NodeId::PortfolioManager));

        debug!(
            tasks = tasks.len(),
            threshold = self.policy.parallel_threshold,
            ?topology,
            "Execution graph built"
        );

        ExecutionGraph {
            nodes,
            edges,
            topology,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MarketData;
    use crate::tasks::create_default_registry;

    fn registry() -> TaskRegistry {
        create_default_registry(MarketData::empty())
    }

    #[test]
    fn test_small_request_fans_out_in_parallel() {
        let registry = registry();
        let graph = GraphBuilder::new(&registry).build(&["ben_graham", "cathie_wood"]);

        assert_eq!(graph.topology(), Topology::Parallel);
        assert_eq!(
            graph.successors(NodeId::Start),
            vec![
                NodeId::Task(TaskKind::BenGraham),
                NodeId::Task(TaskKind::CathieWood)
            ]
        );
        assert_eq!(
            graph.predecessors(NodeId::RiskManager),
            vec![
                NodeId::Task(TaskKind::BenGraham),
                NodeId::Task(TaskKind::CathieWood)
            ]
        );
        assert_eq!(
            graph.successors(NodeId::RiskManager),
            vec![NodeId::PortfolioManager]
        );
        assert!(graph.successors(graph.terminal()).is_empty());
        graph.validate().unwrap();
    }

    #[test]
    fn test_parallel_graph_has_exact_shape() {
        let registry = registry();
        let graph = GraphBuilder::new(&registry).build(&["ben_graham", "cathie_wood", "peter_lynch"]);
        let tasks = [
            NodeId::Task(TaskKind::BenGraham),
            NodeId::Task(TaskKind::CathieWood),
            NodeId::Task(TaskKind::PeterLynch),
        ];

        let mut expected = Vec::new();
        for task in tasks {
            expected.push((NodeId::Start, task));
            expected.push((task, NodeId::RiskManager));
        }
        expected.push((NodeId::RiskManager, NodeId::PortfolioManager));
        assert_eq!(graph.edges(), expected.as_slice());

        // No task feeds another.
        for task in tasks {
            assert_eq!(graph.predecessors(task), vec![NodeId::Start]);
            assert_eq!(graph.successors(task), vec![NodeId::RiskManager]);
        }
    }

    #[test]
    fn test_chained_graph_has_exact_shape() {
        let registry = registry();
        let kinds = [
            TaskKind::WarrenBuffett,
            TaskKind::BenGraham,
            TaskKind::CharlieMunger,
            TaskKind::PhilFisher,
            TaskKind::PeterLynch,
            TaskKind::CathieWood,
            TaskKind::BillAckman,
        ];
        let keys: Vec<&str> = kinds.iter().map(|k| k.key()).collect();
        let graph = GraphBuilder::new(&registry).build(&keys);
        assert_eq!(graph.topology(), Topology::Chained);

        let mut path = vec![NodeId::Start];
        path.extend(kinds.iter().map(|k| NodeId::Task(*k)));
        path.push(NodeId::RiskManager);
        path.push(NodeId::PortfolioManager);
        let expected: Vec<(NodeId, NodeId)> = path.windows(2).map(|w| (w[0], w[1])).collect();

        assert_eq!(graph.edges(), expected.as_slice());
        assert_eq!(graph.nodes(), path.as_slice());
    }

    #[test]
    fn test_large_request_is_chained_in_caller_order() {
        let registry = registry();
        let ids = [
            "warren_buffett",
            "ben_graham",
            "charlie_munger",
            "phil_fisher",
            "peter_lynch",
            "cathie_wood",
            "bill_ackman",
            "michael_burry",
        ];
        let graph = GraphBuilder::new(&registry).build(&ids);

        assert_eq!(graph.topology(), Topology::Chained);
        assert_eq!(graph.successors(NodeId::Start), vec![NodeId::Task(TaskKind::WarrenBuffett)]);
        assert_eq!(
            graph.successors(NodeId::Task(TaskKind::WarrenBuffett)),
            vec![NodeId::Task(TaskKind::BenGraham)]
        );
        assert_eq!(
            graph.predecessors(NodeId::RiskManager),
            vec![NodeId::Task(TaskKind::MichaelBurry)]
        );
        // 8 tasks + start + risk + portfolio
        assert_eq!(graph.nodes().len(), 11);
        assert_eq!(graph.edges().len(), 10);
        graph.validate().unwrap();
    }

    #[test]
    fn test_threshold_boundary_and_override() {
        let registry = registry();
        let six: Vec<&str> = TaskKind::ALL.iter().take(6).map(|k| k.key()).collect();
        let seven: Vec<&str> = TaskKind::ALL.iter().take(7).map(|k| k.key()).collect();

        assert_eq!(GraphBuilder::new(&registry).build(&six).topology(), Topology::Parallel);
        assert_eq!(GraphBuilder::new(&registry).build(&seven).topology(), Topology::Chained);

        let wide = GraphPolicy { parallel_threshold: 20 };
        assert_eq!(
            GraphBuilder::new(&registry).with_policy(wide).build(&seven).topology(),
            Topology::Parallel
        );
    }

    #[test]
    fn test_empty_request_goes_straight_to_aggregators() {
        let registry = registry();
        let graph = GraphBuilder::new(&registry).build::<&str>(&[]);

        assert_eq!(graph.topology(), Topology::Empty);
        assert_eq!(graph.successors(NodeId::Start), vec![NodeId::RiskManager]);
        assert!(graph.task_nodes().is_empty());
        graph.validate().unwrap();
    }

    #[test]
    fn test_unknown_and_duplicate_ids_are_filtered() {
        let registry = registry();
        let graph = GraphBuilder::new(&registry).build(&[
            "cathie_wood",
            "not_a_task",
            "ben_graham",
            "cathie_wood",
        ]);

        assert_eq!(graph.task_nodes(), vec![TaskKind::CathieWood, TaskKind::BenGraham]);
    }

    #[test]
    fn test_unregistered_kind_is_skipped() {
        let mut sparse = TaskRegistry::new();
        sparse.register(std::sync::Arc::new(crate::tasks::PersonaAnalyst::new(
            TaskKind::PeterLynch,
            MarketData::empty(),
        )));
        let graph = GraphBuilder::new(&sparse).build(&["peter_lynch", "ben_graham"]);

        assert_eq!(graph.task_nodes(), vec![TaskKind::PeterLynch]);
    }

    #[test]
    fn test_build_is_deterministic() {
        let registry = registry();
        let ids = ["valuation_analyst", "technical_analyst", "michael_burry"];
        assert_eq!(
            GraphBuilder::new(&registry).build(&ids),
            GraphBuilder::new(&registry).build(&ids)
        );
    }

    #[test]
    fn test_node_names() {
        assert_eq!(NodeId::Start.to_string(), "start_node");
        assert_eq!(NodeId::Task(TaskKind::BenGraham).to_string(), "ben_graham_agent");
        assert_eq!(NodeId::RiskManager.to_string(), "risk_management_agent");
        assert_eq!(NodeId::PortfolioManager.to_string(), "portfolio_manager");
    }

    #[test]
    fn test_validate_rejects_cycles() {
        let graph = ExecutionGraph {
            nodes: vec![NodeId::Start, NodeId::RiskManager, NodeId::PortfolioManager],
            edges: vec![
                (NodeId::Start, NodeId::RiskManager),
                (NodeId::RiskManager, NodeId::PortfolioManager),
                (NodeId::PortfolioManager, NodeId::RiskManager),
            ],
            topology: Topology::Empty,
        };

        assert!(graph.validate().is_err());
    }
}
