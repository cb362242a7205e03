//! Progress handles handed to units of work.

use std::sync::Arc;

use async_trait::async_trait;

use super::aggregator::{ProgressAggregator, ProgressSignal};
use crate::error::{PipelineError, Result};

/// Destination of progress signals.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn update_progress(&self, signal: ProgressSignal) -> Result<()>;
}

#[async_trait]
impl ProgressSink for ProgressAggregator {
    async fn update_progress(&self, signal: ProgressSignal) -> Result<()> {
        self.record_signal(&signal).map(|_| ())
    }
}

/// Something that accepts a completion rate in `[0, 1]`.
#[async_trait]
pub trait ProgressRate: Send + Sync {
    async fn report(&self, rate: f64) -> Result<()>;

    /// Report from a blocking worker thread.
    fn report_blocking(&self, rate: f64) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| PipelineError::Config(format!("no runtime to report progress: {}", e)))?;
        handle.block_on(self.report(rate))
    }
}

/// Emits signals for one `(run_id, source_id)` pair with a fixed weight.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    run_id: String,
    source_id: String,
    weight: f64,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("run_id", &self.run_id)
            .field("source_id", &self.source_id)
            .field("weight", &self.weight)
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        run_id: impl Into<String>,
        source_id: impl Into<String>,
        weight: f64,
    ) -> Self {
        Self {
            sink,
            run_id: run_id.into(),
            source_id: source_id.into(),
            weight,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Rescale reports of this handle to `[start, end]`.
    pub fn scaled(self, start: f64, end: f64) -> Result<ScaledProgress<Self>> {
        ScaledProgress::new(self, start, end)
    }

    /// Turn iteration counts out of `max` into rates.
    pub fn raw(self, max: u64) -> Result<RawProgress<Self>> {
        RawProgress::new(self, max)
    }
}

#[async_trait]
impl ProgressRate for ProgressReporter {
    async fn report(&self, rate: f64) -> Result<()> {
        let signal = ProgressSignal::new(&self.run_id, &self.source_id, rate, self.weight);
        signal.validate()?;
        self.sink.update_progress(signal).await
    }
}

/// Maps `[0, 1]` onto the sub-range `[start, end]` of an inner handle.
#[derive(Debug, Clone)]
pub struct ScaledProgress<R> {
    inner: R,
    start: f64,
    end: f64,
}

impl<R: ProgressRate> ScaledProgress<R> {
    pub fn new(inner: R, start: f64, end: f64) -> Result<Self> {
        if !(0.0 <= start && start < end && end <= 1.0) {
            return Err(PipelineError::InvalidInput(format!(
                "expected 0 <= start < end <= 1, found start={} end={}",
                start, end
            )));
        }
        Ok(Self { inner, start, end })
    }
}

#[async_trait]
impl<R: ProgressRate> ProgressRate for ScaledProgress<R> {
    async fn report(&self, rate: f64) -> Result<()> {
        self.inner
            .report(self.start + rate * (self.end - self.start))
            .await
    }
}

/// Converts raw iteration counts out of `max` into rates.
#[derive(Debug, Clone)]
pub struct RawProgress<R> {
    inner: R,
    max: u64,
}

impl<R: ProgressRate> RawProgress<R> {
    pub fn new(inner: R, max: u64) -> Result<Self> {
        if max == 0 {
            return Err(PipelineError::InvalidInput(
                "max progress must be > 0".to_string(),
            ));
        }
        Ok(Self { inner, max })
    }

    pub async fn report_count(&self, done: u64) -> Result<()> {
        self.inner.report(done as f64 / self.max as f64).await
    }
}
