use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for transient store faults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), doubled each time,
    /// capped, with up to 50% random jitter taken off.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        base.mul_f64(jitter)
    }
}

/// Configuration for the document pipeline and its reconciler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Timeout applied to each asset or record store call.
    pub store_timeout: Duration,
    /// Maximum wall-clock time for one render.
    pub render_timeout: Duration,
    /// Retry policy for transient store faults.
    pub retry: RetryPolicy,
    /// How long a duplicate request waits on an in-flight generation.
    pub inflight_wait: Duration,
    /// Poll interval while waiting on an in-flight generation.
    pub inflight_poll: Duration,
    /// Records untouched for this long are picked up by reconciliation.
    pub grace_period: Duration,
    /// Pause between reconciliation passes.
    pub reconcile_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(10),
            render_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            inflight_wait: Duration::from_secs(30),
            inflight_poll: Duration::from_millis(50),
            grace_period: Duration::from_secs(5 * 60),
            reconcile_interval: Duration::from_secs(60),
        }
    }
}
