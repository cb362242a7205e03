//! Per-run weighted progress aggregation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{PipelineError, Result};

/// Absolute progress: `current` units done out of `max_progress`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub max_progress: f64,
    pub current: f64,
}

impl Progress {
    /// Completion rate in `[0, 1]`, 0 when nothing is expected yet.
    pub fn rate(&self) -> f64 {
        if self.max_progress == 0.0 {
            return 0.0;
        }
        self.current / self.max_progress
    }
}

/// Latest completion rate reported by one source of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSignal {
    pub run_id: String,
    pub source_id: String,
    pub rate: f64,
    pub weight: f64,
}

impl ProgressSignal {
    pub fn new(
        run_id: impl Into<String>,
        source_id: impl Into<String>,
        rate: f64,
        weight: f64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            source_id: source_id.into(),
            rate,
            weight,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.rate) {
            return Err(PipelineError::InvalidInput(format!(
                "progress rate must be within [0, 1], found {}",
                self.rate
            )));
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return Err(PipelineError::InvalidInput(format!(
                "progress weight must be positive, found {}",
                self.weight
            )));
        }
        Ok(())
    }

    pub fn to_progress(&self) -> Progress {
        Progress {
            current: self.rate * self.weight,
            max_progress: self.weight,
        }
    }
}

struct RunProgress {
    sources: HashMap<String, Progress>,
    closed: bool,
    published: watch::Sender<Progress>,
}

impl RunProgress {
    fn aggregate(&self) -> Progress {
        self.sources
            .values()
            .fold(Progress::default(), |acc, p| Progress {
                current: acc.current + p.current,
                max_progress: acc.max_progress + p.max_progress,
            })
    }
}

/// Aggregates progress signals per run.
///
/// Each run has its own guard: emitters of different runs never contend,
/// and emitters of the same run are serialized so no update is lost. The
/// run map itself is only locked to look a run up. Guards are never held
/// across an await, so recording works from blocking workers too.
///
/// Last write per source wins, which makes duplicate or reordered
/// deliveries of the same signal harmless. Rates are not forced to be
/// monotonic; callers report non-decreasing rates.
#[derive(Default)]
pub struct ProgressAggregator {
    runs: RwLock<HashMap<String, Arc<Mutex<RunProgress>>>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting signals for `run_id` and subscribe to its aggregate.
    ///
    /// Opening an already open run returns a new subscription to it.
    pub fn open_run(&self, run_id: &str) -> watch::Receiver<Progress> {
        let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
        let run = runs.entry(run_id.to_string()).or_insert_with(|| {
            let (published, _) = watch::channel(Progress::default());
            Arc::new(Mutex::new(RunProgress {
                sources: HashMap::new(),
                closed: false,
                published,
            }))
        });
        let run = run.lock().unwrap_or_else(PoisonError::into_inner);
        run.published.subscribe()
    }

    /// Subscribe to the published aggregate of an open run.
    pub fn subscribe(&self, run_id: &str) -> Option<watch::Receiver<Progress>> {
        let run = self.run(run_id)?;
        let run = run.lock().unwrap_or_else(PoisonError::into_inner);
        Some(run.published.subscribe())
    }

    /// Record one source's rate and republish the run aggregate.
    ///
    /// Returns the new aggregate, or `None` when the run isn't accepting
    /// signals (never opened, or already closed).
    pub fn record(
        &self,
        run_id: &str,
        source_id: &str,
        rate: f64,
        weight: f64,
    ) -> Result<Option<Progress>> {
        self.record_signal(&ProgressSignal::new(run_id, source_id, rate, weight))
    }

    pub fn record_signal(&self, signal: &ProgressSignal) -> Result<Option<Progress>> {
        signal.validate()?;
        let Some(run) = self.run(&signal.run_id) else {
            tracing::debug!(run_id = %signal.run_id, "Ignoring progress for inactive run");
            return Ok(None);
        };
        let mut run = run.lock().unwrap_or_else(PoisonError::into_inner);
        if run.closed {
            tracing::debug!(run_id = %signal.run_id, "Ignoring progress for closed run");
            return Ok(None);
        }
        run.sources
            .insert(signal.source_id.clone(), signal.to_progress());
        let aggregate = run.aggregate();
        run.published.send_replace(aggregate);
        tracing::debug!(
            run_id = %signal.run_id,
            source_id = %signal.source_id,
            current = aggregate.current,
            max_progress = aggregate.max_progress,
            "Recorded progress"
        );
        Ok(Some(aggregate))
    }

    /// Current aggregate of an open run.
    pub fn snapshot(&self, run_id: &str) -> Option<Progress> {
        let run = self.run(run_id)?;
        let run = run.lock().unwrap_or_else(PoisonError::into_inner);
        Some(run.aggregate())
    }

    /// Stop accepting signals for `run_id` and discard its map.
    ///
    /// Returns the final aggregate. Subscribers keep the last published
    /// value and observe the channel closing.
    pub fn close_run(&self, run_id: &str) -> Option<Progress> {
        let run = self
            .runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id)?;
        let mut run = run.lock().unwrap_or_else(PoisonError::into_inner);
        run.closed = true;
        let last = run.aggregate();
        run.sources.clear();
        Some(last)
    }

    pub fn is_open(&self, run_id: &str) -> bool {
        self.run(run_id).is_some()
    }

    fn run(&self, run_id: &str) -> Option<Arc<Mutex<RunProgress>>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }
}

/// Shared aggregator handle.
pub type SharedProgressAggregator = Arc<ProgressAggregator>;
