use analyst_orchestrator::{
    models::{DateRange, RunRequest},
    Orchestrator, OrchestratorConfig,
};
use chrono::Utc;
use std::collections::HashMap;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_TASKS: &str = "warren_buffett,ben_graham,technical_analyst";
const DEFAULT_SYMBOLS: &str = "AAPL,MSFT,NVDA";
const DEFAULT_LOOKBACK_DAYS: i64 = 90;

fn split(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Usage: `orchestrator [TASKS] [SYMBOLS]`, both comma separated.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::from_env()?;

    let mut args = std::env::args().skip(1);
    let tasks = split(&args.next().unwrap_or_else(|| DEFAULT_TASKS.to_string()));
    let symbols = split(&args.next().unwrap_or_else(|| DEFAULT_SYMBOLS.to_string()));

    info!(
        model = %config.default_model.model_name,
        provider = %config.default_model.provider,
        "Analyst orchestrator starting"
    );

    let orchestrator = Orchestrator::from_config(&config)?;

    let request = RunRequest {
        tasks,
        symbols,
        date_range: DateRange::ending(Utc::now().date_naive(), DEFAULT_LOOKBACK_DAYS),
        model_overrides: HashMap::new(),
        default_model: None,
        portfolio: None,
    };

    match orchestrator.run(request).await {
        Ok(decision) => {
            info!("Run successful");
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Run failed: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
