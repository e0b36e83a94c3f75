//! Scripted provider for development & testing
//! Keeps the system runnable without any network dependency

use super::{InferenceProvider, InferenceRequest, ProviderReply};
use crate::error::InvocationError;
use crate::models::ModelProvider;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

type Responder =
    Arc<dyn Fn(&InferenceRequest, usize) -> Result<ProviderReply, InvocationError> + Send + Sync>;
type Latency = Arc<dyn Fn(&InferenceRequest) -> Duration + Send + Sync>;

/// Provider whose answers come from a closure of `(request, call_index)`.
pub struct ScriptedProvider {
    provider: ModelProvider,
    structured: bool,
    responder: Responder,
    latency: Option<Latency>,
    calls: AtomicUsize,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedProvider {
    pub fn new<F>(provider: ModelProvider, structured: bool, responder: F) -> Self
    where
        F: Fn(&InferenceRequest, usize) -> Result<ProviderReply, InvocationError> + Send + Sync + 'static,
    {
        Self {
            provider,
            structured,
            responder: Arc::new(responder),
            latency: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Schema-capable provider that always returns `value`.
    pub fn always(provider: ModelProvider, value: Value) -> Self {
        Self::new(provider, true, move |_, _| Ok(ProviderReply::Structured(value.clone())))
    }

    /// Text-mode provider that always returns `text`.
    pub fn text(provider: ModelProvider, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(provider, false, move |_, _| Ok(ProviderReply::Text(text.clone())))
    }

    /// Provider that fails every call with `error`.
    pub fn failing(provider: ModelProvider, error: InvocationError) -> Self {
        Self::new(provider, true, move |_, _| Err(error.clone()))
    }

    /// Simulated per-call latency.
    pub fn with_latency<F>(mut self, latency: F) -> Self
    where
        F: Fn(&InferenceRequest) -> Duration + Send + Sync + 'static,
    {
        self.latency = Some(Arc::new(latency));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    fn provider(&self) -> ModelProvider {
        self.provider
    }

    fn supports_structured_output(&self, _model: &str) -> bool {
        self.structured
    }

    async fn call(&self, request: &InferenceRequest) -> Result<ProviderReply, InvocationError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());

        if let Some(latency) = &self.latency {
            tokio::time::sleep(latency(request)).await;
        }

        (self.responder)(request, index)
    }
}
