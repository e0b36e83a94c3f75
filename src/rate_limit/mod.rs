//! Per-provider call-rate governor
//!
//! Every remote inference call passes through [`RateGovernor::acquire`] first.
//! The governor never rejects a call, it only delays the caller:
//!
//! - counters reset once the provider's window has elapsed
//! - at the safety threshold (one below the hard cap) the caller sleeps until
//!   the window is over
//! - below it, calls are spaced by a delay that grows with the call count, so
//!   a parallel fan-out bursts quickly at first and slows as the budget drains.
//!   Tier boundaries are shares of the threshold and delays are fractions of
//!   `window / max_calls`, so a generous quota is barely paced at all
//!
//! Each provider has its own lock. Providers without a declared quota pass
//! straight through.

use crate::models::ModelProvider;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// One step of the spacing schedule, scaled to the quota it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpacingTier {
    /// Applies once the window holds this share (in percent) of the safety threshold.
    pub threshold_pct: u32,
    /// Gap between calls as a fraction of the even interval `window / max_calls`.
    pub interval_divisor: u32,
}

impl SpacingTier {
    pub const fn new(threshold_pct: u32, interval_divisor: u32) -> Self {
        Self {
            threshold_pct,
            interval_divisor,
        }
    }

    /// First call count this tier applies to, rounded up and never below 1.
    fn min_calls(&self, threshold: u32) -> u32 {
        let scaled = (u64::from(threshold) * u64::from(self.threshold_pct)).div_ceil(100);
        u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
    }
}

const DEFAULT_SPACING: [SpacingTier; 3] = [
    SpacingTier::new(10, 12),
    SpacingTier::new(30, 3),
    SpacingTier::new(60, 1),
];

/// Call budget for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaPolicy {
    pub max_calls_per_window: u32,
    pub window: Duration,
    /// Calls kept in reserve below the hard cap.
    pub safety_margin: u32,
    /// Extra wait added after a full window reset.
    pub reset_buffer: Duration,
    /// Spacing tiers, ascending by threshold share.
    pub spacing: Vec<SpacingTier>,
}

impl QuotaPolicy {
    pub fn new(max_calls_per_window: u32, window: Duration) -> Self {
        Self {
            max_calls_per_window,
            window,
            safety_margin: 1,
            reset_buffer: Duration::from_secs(1),
            spacing: DEFAULT_SPACING.to_vec(),
        }
    }

    /// 10 requests per minute: spacing of 500 ms, 2 s, then 6 s.
    pub fn gemini_free_tier() -> Self {
        Self::new(10, Duration::from_secs(60))
    }

    pub fn with_spacing(mut self, spacing: Vec<SpacingTier>) -> Self {
        self.spacing = spacing;
        self
    }

    /// Even gap that would spread the full quota over one window.
    pub fn call_interval(&self) -> Duration {
        self.window / self.max_calls_per_window.max(1)
    }

    /// Call count at which the caller must wait for the window to reset.
    pub fn safety_threshold(&self) -> u32 {
        self.max_calls_per_window
            .saturating_sub(self.safety_margin)
            .max(1)
    }

    /// Minimum gap since the previous call, given how many calls the window has seen.
    pub fn spacing_for(&self, calls_in_window: u32) -> Duration {
        let threshold = self.safety_threshold();
        self.spacing
            .iter()
            .rev()
            .find(|tier| calls_in_window >= tier.min_calls(threshold))
            .map(|tier| self.call_interval() / tier.interval_divisor.max(1))
            .unwrap_or(Duration::ZERO)
    }
}

/// Live counters for one provider.
#[derive(Debug, Clone)]
pub struct ProviderQuota {
    pub provider: ModelProvider,
    pub window_start: Instant,
    pub calls: u32,
    pub window: Duration,
    pub max_calls: u32,
    pub last_call: Option<Instant>,
}

impl ProviderQuota {
    fn new(provider: ModelProvider, policy: &QuotaPolicy, now: Instant) -> Self {
        Self {
            provider,
            window_start: now,
            calls: 0,
            window: policy.window,
            max_calls: policy.max_calls_per_window,
            last_call: None,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.calls = 0;
        self.window_start = now;
    }
}

struct QuotaSlot {
    policy: QuotaPolicy,
    // Created on the first call to the provider.
    quota: Mutex<Option<ProviderQuota>>,
}

pub struct RateGovernor {
    slots: HashMap<ModelProvider, QuotaSlot>,
}

lazy_static! {
    // Initialized on first use from the environment configuration; falls back
    // to the built-in quotas when configuration cannot be read.
    static ref GLOBAL_GOVERNOR: Arc<RateGovernor> = Arc::new(
        crate::config::OrchestratorConfig::from_env()
            .map(|config| RateGovernor::new(config.quotas))
            .unwrap_or_else(|_| RateGovernor::new(crate::config::default_quotas()))
    );
}

impl RateGovernor {
    pub fn new(quotas: HashMap<ModelProvider, QuotaPolicy>) -> Self {
        let slots = quotas
            .into_iter()
            .map(|(provider, policy)| {
                (
                    provider,
                    QuotaSlot {
                        policy,
                        quota: Mutex::new(None),
                    },
                )
            })
            .collect();

        Self { slots }
    }

    /// Governor with no quotas; every call passes through.
    pub fn unlimited() -> Self {
        Self::new(HashMap::new())
    }

    /// Process-wide governor shared by every run in this process.
    pub fn global() -> Arc<RateGovernor> {
        GLOBAL_GOVERNOR.clone()
    }

    /// Wait until a call to `provider` fits the budget, then record it.
    /// Returns how long the caller was held.
    pub async fn acquire(&self, provider: ModelProvider) -> Duration {
        let Some(slot) = self.slots.get(&provider) else {
            return Duration::ZERO;
        };
        let policy = &slot.policy;

        let mut guard = slot.quota.lock().await;
        let quota = guard.get_or_insert_with(|| ProviderQuota::new(provider, policy, Instant::now()));

        let now = Instant::now();
        if now.duration_since(quota.window_start) > quota.window {
            quota.reset(now);
        }

        let mut waited = Duration::ZERO;

        if quota.calls >= policy.safety_threshold() {
            let elapsed = now.duration_since(quota.window_start);
            if elapsed < quota.window {
                let wait = quota.window - elapsed + policy.reset_buffer;
                info!(
                    provider = %provider,
                    calls = quota.calls,
                    wait_ms = wait.as_millis() as u64,
                    "Rate limit reached, waiting for window reset"
                );
                sleep(wait).await;
                waited += wait;
            }
            quota.reset(Instant::now());
        }

        if quota.calls > 0 {
            let min_spacing = policy.spacing_for(quota.calls);
            if let Some(last_call) = quota.last_call {
                let since_last = Instant::now().duration_since(last_call);
                if since_last < min_spacing {
                    let wait = min_spacing - since_last;
                    debug!(
                        provider = %provider,
                        calls = quota.calls,
                        wait_ms = wait.as_millis() as u64,
                        "Spacing call"
                    );
                    sleep(wait).await;
                    waited += wait;
                }
            }
        }

        quota.calls += 1;
        quota.last_call = Some(Instant::now());

        waited
    }

    /// Current counters for a provider, if it has been called.
    pub async fn snapshot(&self, provider: ModelProvider) -> Option<ProviderQuota> {
        let slot = self.slots.get(&provider)?;
        slot.quota.lock().await.clone()
    }
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new(crate::config::default_quotas())
    }
}
