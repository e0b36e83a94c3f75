//! REST API server for the analyst orchestrator
//!
//! Runs are executed on a background task; the handler only awaits the result.

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::OrchestrationError;
use crate::models::RunRequest;
use crate::orchestrator::Orchestrator;

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

fn status_for(err: &OrchestrationError) -> StatusCode {
    match err {
        OrchestrationError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        OrchestrationError::FatalConfiguration(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Task Listing
/// =============================

async fn list_tasks(State(state): State<ApiState>) -> Json<ApiResponse> {
    let tasks: Vec<serde_json::Value> = state
        .orchestrator
        .registry()
        .list()
        .into_iter()
        .map(|kind| {
            serde_json::json!({
                "key": kind.key(),
                "display_name": kind.display_name(),
            })
        })
        .collect();

    Json(ApiResponse::success(tasks))
}

/// =============================
/// Run Endpoint
/// =============================

async fn run_analysis(
    State(state): State<ApiState>,
    Json(req): Json<RunRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    info!(
        tasks = req.tasks.len(),
        symbols = ?req.symbols,
        "Received run request"
    );

    match state.orchestrator.spawn_run(req).await {
        Ok(Ok(decision)) => (StatusCode::OK, Json(ApiResponse::success(decision))),
        Ok(Err(e)) => {
            error!(error = %e, "Run failed");
            (status_for(&e), Json(ApiResponse::error(format!("Run failed: {}", e))))
        }
        Err(e) => {
            error!(error = %e, "Run task did not complete");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Run did not complete: {}", e))),
            )
        }
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks))
        .route("/api/run", post(run_analysis))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(orchestrator: Arc<Orchestrator>, port: u16) -> crate::Result<()> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{ConsensusPortfolioManager, PositionLimitRiskManager};
    use crate::data::MarketData;
    use crate::graph::{GraphExecutor, GraphPolicy};
    use crate::invoker::{RetryPolicy, TaskInvoker};
    use crate::models::{ModelConfig, ModelProvider};
    use crate::provider::{ProviderRegistry, ScriptedProvider};
    use crate::rate_limit::RateGovernor;
    use crate::tasks::create_default_registry;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(ScriptedProvider::always(
            ModelProvider::OpenAI,
            serde_json::json!({"signal": "bullish", "confidence": 70.0, "reasoning": "moat"}),
        )));

        let invoker = Arc::new(TaskInvoker::new(
            providers,
            Arc::new(RateGovernor::unlimited()),
            RetryPolicy::default(),
            ModelConfig::new("gpt-4.1", ModelProvider::OpenAI),
        ));
        let tasks = Arc::new(create_default_registry(MarketData::empty()));
        let executor = GraphExecutor::new(
            tasks.clone(),
            invoker,
            Arc::new(PositionLimitRiskManager::new(MarketData::empty())),
            Arc::new(ConsensusPortfolioManager::new()),
        );

        create_router(Arc::new(Orchestrator::new(tasks, executor, GraphPolicy::default())))
    }

    async fn post_run(body: serde_json::Value) -> (StatusCode, ApiResponse) {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/run")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let response = router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_run_endpoint_returns_decision() {
        let (status, body) = post_run(serde_json::json!({
            "tasks": ["ben_graham", "warren_buffett"],
            "symbols": ["AAPL"],
            "date_range": { "start": "2024-01-01", "end": "2024-03-31" }
        }))
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.success);
        let data = body.data.unwrap();
        assert_eq!(data["analyst_signals"]["ben_graham"]["signals"]["AAPL"]["signal"], "bullish");
        assert!(data["decisions"]["AAPL"].is_object());
    }

    #[tokio::test]
    async fn test_inverted_date_range_is_bad_request() {
        let (status, body) = post_run(serde_json::json!({
            "tasks": ["ben_graham"],
            "symbols": ["AAPL"],
            "date_range": { "start": "2024-03-31", "end": "2024-01-01" }
        }))
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!body.success);
        assert!(body.error.unwrap().contains("after end date"));
    }
}
