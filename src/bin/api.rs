use analyst_orchestrator::{api::start_server, Orchestrator, OrchestratorConfig};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::from_env()?;

    let keys = [
        &config.gemini_api_key,
        &config.openai_api_key,
        &config.groq_api_key,
        &config.deepseek_api_key,
    ];
    if keys.iter().all(|key| key.is_none()) {
        eprintln!("⚠️  No inference provider key is set (GEMINI, OPENAI, GROQ or DEEPSEEK)");
        eprintln!("📌 See .env.example for setup instructions");
    }

    info!("🚀 Analyst Orchestrator - API Server");
    info!("📍 Port: {}", config.api_port);

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);

    info!("✅ Orchestrator initialized");
    info!("📡 Starting API server...");

    start_server(orchestrator, config.api_port).await?;

    Ok(())
}
