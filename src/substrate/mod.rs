//! Substrate module - where units of work actually run.
//!
//! # Key Concepts
//! - Stage: declarative dispatch target (name, queue, timeout, retry policy)
//! - Dispatch: run one unit of work on a stage and await its result
//! - Signals: at-least-once messages sent back to a run; the only one
//!   handled is `update_progress`
//!
//! # Implementations
//! - [`LocalSubstrate`]: in-process execution with bounded queues, retries
//!   and task registry bookkeeping

mod handlers;
mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::progress::{ProgressSignal, ProgressSink};

pub use handlers::{
    async_handler, blocking_handler, Affinity, BlockingStageHandler, Handler, HandlerRegistry,
    Registration, StageHandler, UnitContext,
};
pub use local::LocalSubstrate;
pub(crate) use handlers::name_filter;

/// Name of the signal carrying a serialized [`ProgressSignal`].
pub const UPDATE_PROGRESS_SIGNAL: &str = "update_progress";

/// Timeout applied to a stage when none is given.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Exponential backoff between attempts of one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    /// Defaults to 100 times `initial_interval`.
    pub maximum_interval: Option<Duration>,
    /// Total attempts including the first one. 0 means unlimited.
    pub maximum_attempts: u32,
    /// Up to this fraction of the delay is added at random.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: None,
            maximum_attempts: 3,
            jitter_ratio: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            maximum_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_maximum_attempts(mut self, maximum_attempts: u32) -> Self {
        self.maximum_attempts = maximum_attempts;
        self
    }

    pub fn with_initial_interval(mut self, initial_interval: Duration) -> Self {
        self.initial_interval = initial_interval;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }

    /// Whether attempt number `attempt` (1-based) may start.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.maximum_attempts == 0 || attempt <= self.maximum_attempts
    }

    /// Attempts left after `attempt` ran, `None` when unlimited.
    pub fn retries_left(&self, attempt: u32) -> Option<u32> {
        (self.maximum_attempts != 0).then(|| self.maximum_attempts.saturating_sub(attempt))
    }

    /// Wait before the attempt that follows failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let cap = self
            .maximum_interval
            .unwrap_or(self.initial_interval * 100)
            .as_secs_f64();
        let capped = base.min(cap);
        let jitter = if self.jitter_ratio > 0.0 {
            capped * self.jitter_ratio * rand::thread_rng().gen::<f64>()
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Declarative description of one dispatch target.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStage {
    pub name: String,
    pub queue: String,
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl PipelineStage {
    pub fn new(name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            timeout: DEFAULT_STAGE_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// One unit of work to run on a stage.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub run_id: String,
    pub stage: PipelineStage,
    pub args: serde_json::Value,
    /// Progress weight of the unit, usually its batch size.
    pub weight: f64,
    /// Cancelling it abandons the unit.
    pub cancel: CancellationToken,
}

/// Execution substrate consumed by the orchestrator.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Run one unit of work to completion, retries included.
    async fn dispatch(&self, request: DispatchRequest) -> Result<serde_json::Value>;

    /// Deliver a signal to a run. Unknown signal names are an error.
    async fn send_signal(&self, run_id: &str, name: &str, payload: serde_json::Value)
        -> Result<()>;
}

/// Shared substrate handle.
pub type SharedSubstrate = Arc<dyn Substrate>;

/// Routes progress through the substrate's signal channel.
pub struct SignalSink {
    substrate: SharedSubstrate,
}

impl SignalSink {
    pub fn new(substrate: SharedSubstrate) -> Self {
        Self { substrate }
    }
}

#[async_trait]
impl ProgressSink for SignalSink {
    async fn update_progress(&self, signal: ProgressSignal) -> Result<()> {
        let payload = serde_json::to_value(&signal)?;
        self.substrate
            .send_signal(&signal.run_id, UPDATE_PROGRESS_SIGNAL, payload)
            .await
    }
}
