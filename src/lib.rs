//! Analyst Orchestrator
//!
//! Runs a requested set of investment-analyst tasks over a list of symbols:
//! - Builds an execution graph (parallel fan-out or caller-ordered chain)
//! - Executes ready nodes concurrently and merges each result as it lands
//! - Paces every remote inference call through a per-provider rate governor
//! - Retries failed calls and degrades to neutral defaults instead of failing
//! - Aggregates signals through risk and portfolio managers into one decision
//!
//! FLOW:
//! REQUEST → GRAPH → TASKS (→ GOVERNOR → PROVIDER) → RISK → PORTFOLIO → DECISION

pub mod aggregate;
pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod graph;
pub mod invoker;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod rate_limit;
pub mod state;
pub mod tasks;

pub use error::Result;

// Re-export common types
pub use config::OrchestratorConfig;
pub use models::*;
pub use orchestrator::Orchestrator;
pub use tasks::TaskKind;
