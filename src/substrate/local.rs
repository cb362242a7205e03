//! In-process substrate: bounded queues, per-attempt timeouts and retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinError};
use tokio_util::sync::CancellationToken;

use super::handlers::{Handler, HandlerRegistry, Registration, UnitContext};
use super::{DispatchRequest, SignalSink, Substrate, UPDATE_PROGRESS_SIGNAL};
use crate::classify::FatalError;
use crate::config::WorkerConfig;
use crate::error::{PipelineError, Result};
use crate::progress::{ProgressRate, ProgressReporter, ProgressSignal, SharedProgressAggregator};
use crate::task::{SharedTaskRegistry, TaskError, TaskState, TaskUpdate};

struct Inner {
    handlers: HandlerRegistry,
    queues: HashMap<String, Arc<Semaphore>>,
    registry: SharedTaskRegistry,
    progress: SharedProgressAggregator,
    worker_id: Option<String>,
}

/// Runs registered handlers in this process.
///
/// Each queue admits at most its configured number of concurrent units.
/// Every unit is tracked as a task in the registry, from `CREATED` to its
/// terminal state. Only retryable failures are attempted again, following
/// the stage's retry policy.
#[derive(Clone)]
pub struct LocalSubstrate {
    inner: Arc<Inner>,
}

impl LocalSubstrate {
    pub fn new<I, S>(
        handlers: HandlerRegistry,
        queues: I,
        registry: SharedTaskRegistry,
        progress: SharedProgressAggregator,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let mut bounded = HashMap::new();
        for (name, max_concurrency) in queues {
            let name = name.into();
            if max_concurrency == 0 {
                return Err(PipelineError::Config(format!(
                    "queue {} needs a concurrency of at least one",
                    name
                )));
            }
            bounded.insert(name, Arc::new(Semaphore::new(max_concurrency)));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                handlers,
                queues: bounded,
                registry,
                progress,
                worker_id: None,
            }),
        })
    }

    /// Build from worker configuration: queues and worker id.
    pub fn from_config(
        config: &WorkerConfig,
        handlers: HandlerRegistry,
        registry: SharedTaskRegistry,
        progress: SharedProgressAggregator,
    ) -> Result<Self> {
        let queues = config
            .queues
            .iter()
            .map(|q| (q.name.clone(), q.max_concurrency));
        let substrate = Self::new(handlers, queues, registry, progress)?;
        tracing::info!(
            queues = ?config.queues.iter().map(|q| q.name.as_str()).collect::<Vec<_>>(),
            stages = ?substrate.inner.handlers.names(),
            "Local substrate ready"
        );
        Ok(match &config.worker_id {
            Some(worker_id) => substrate.with_worker_id(worker_id.clone()),
            None => substrate,
        })
    }

    pub fn with_worker_id(self, worker_id: impl Into<String>) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => Inner {
                handlers: shared.handlers.clone(),
                queues: shared.queues.clone(),
                registry: shared.registry.clone(),
                progress: shared.progress.clone(),
                worker_id: None,
            },
        };
        Self {
            inner: Arc::new(Inner {
                worker_id: Some(worker_id.into()),
                ..inner
            }),
        }
    }

    pub fn progress(&self) -> SharedProgressAggregator {
        self.inner.progress.clone()
    }

    pub fn registry(&self) -> SharedTaskRegistry {
        self.inner.registry.clone()
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.handlers
    }

    fn queue(&self, name: &str) -> Result<Arc<Semaphore>> {
        self.inner
            .queues
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::Config(format!("unknown queue: {}", name)))
    }

    fn reporter(&self, run_id: &str, task_id: &str, weight: f64) -> ProgressReporter {
        let substrate: Arc<dyn Substrate> = Arc::new(self.clone());
        ProgressReporter::new(Arc::new(SignalSink::new(substrate)), run_id, task_id, weight)
    }

    async fn finish(&self, task_id: &str, update: TaskUpdate) {
        if let Err(e) = self.inner.registry.transition(task_id, update).await {
            tracing::warn!(task_id = %task_id, "Failed to record task outcome: {}", e);
        }
    }

    /// Abandon a unit: its task ends `CANCELLED`.
    async fn cancelled(&self, run_id: &str, task_id: &str) -> PipelineError {
        tracing::info!(run_id = %run_id, task_id = %task_id, "Unit cancelled");
        self.finish(task_id, TaskUpdate::state(TaskState::Cancelled))
            .await;
        PipelineError::Cancelled(run_id.to_string())
    }
}

/// Aborts the spawned attempt if the dispatcher stops waiting for it.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one attempt of a unit, classifying its failure.
///
/// The queue slot travels with the attempt and is released only when the
/// handler itself returns, even after the caller stopped waiting for it.
async fn run_attempt(
    registration: &Registration,
    ctx: UnitContext,
    args: Value,
    timeout: Duration,
    permit: OwnedSemaphorePermit,
) -> Result<Value> {
    let stage = ctx.stage.clone();
    let cancel = ctx.cancel.clone();
    let run_id = ctx.run_id.clone();
    let classifier = registration.classifier.clone();
    let mut handle = match registration.handler.clone() {
        Handler::Async(handler) => {
            tokio::spawn(async move {
                let _permit = permit;
                classifier.guard(handler.handle(ctx, args)).await
            })
        }
        // Blocking work can't be interrupted; cancellation only stops waiting for it
        Handler::Blocking(handler) => tokio::task::spawn_blocking(move || {
            let _permit = permit;
            classifier.guard_blocking(|| handler.handle(ctx, args))
        }),
    };
    let _abort = AbortOnDrop(handle.abort_handle());
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled(run_id)),
        joined = tokio::time::timeout(timeout, &mut handle) => match joined {
            Err(_) => Err(PipelineError::Timeout { stage, timeout }),
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Err(join_failure(e, &run_id)),
        },
    }
}

fn join_failure(err: JoinError, run_id: &str) -> PipelineError {
    if !err.is_panic() {
        return PipelineError::Cancelled(run_id.to_string());
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unit of work panicked".to_string());
    FatalError::new("Panic", message).into()
}

/// Registry payload for a unit that ended with `err`.
fn task_error(err: &PipelineError) -> TaskError {
    match err {
        PipelineError::Fatal(fatal) => fatal.to_task_error(),
        PipelineError::Transient(inner) => crate::classify::fatal_error_from(inner).to_task_error(),
        other => TaskError {
            name: error_kind(other).to_string(),
            message: other.to_string(),
            cause: None,
            stacktrace: Vec::new(),
        },
    }
}

fn error_kind(err: &PipelineError) -> &'static str {
    match err {
        PipelineError::InvalidInput(_) => "InvalidInput",
        PipelineError::Fatal(_) => "Fatal",
        PipelineError::Transient(_) => "Transient",
        PipelineError::DependencyMissing(_) => "DependencyMissing",
        PipelineError::UnknownTask { .. } => "UnknownTask",
        PipelineError::InvalidTransition { .. } => "InvalidTransition",
        PipelineError::PartitionMisuse(_) => "PartitionMisuse",
        PipelineError::StageNotRegistered(_) => "StageNotRegistered",
        PipelineError::Timeout { .. } => "Timeout",
        PipelineError::Cancelled(_) => "Cancelled",
        PipelineError::Search(_) => "Search",
        PipelineError::Serialization(_) => "Serialization",
        PipelineError::Config(_) => "Config",
    }
}

/// Wait for `delay` unless the unit is cancelled first.
async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[async_trait]
impl Substrate for LocalSubstrate {
    async fn dispatch(&self, request: DispatchRequest) -> Result<Value> {
        let DispatchRequest {
            run_id,
            stage,
            args,
            weight,
            cancel,
        } = request;
        let registration = self.inner.handlers.get(&stage.name)?.clone();
        let queue = self.queue(&stage.queue)?;
        let policy = &stage.retry_policy;

        let task_id = self
            .inner
            .registry
            .create_task(&stage.name, Some(args.clone()), None, Some(&stage.queue))
            .await?;
        let max_retries = policy.retries_left(1);
        self.inner
            .registry
            .transition(
                &task_id,
                TaskUpdate::state(TaskState::Queued)
                    .with_max_retries(max_retries)
                    .with_retries_left(max_retries),
            )
            .await?;
        let reporter = self.reporter(&run_id, &task_id, weight);

        let mut attempt = 1;
        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled(&run_id, &task_id).await),
                permit = queue.clone().acquire_owned() => permit.map_err(|_| {
                    PipelineError::Config(format!("queue {} is closed", stage.queue))
                })?,
            };
            self.inner
                .registry
                .transition(&task_id, TaskUpdate::state(TaskState::Running))
                .await?;
            tracing::debug!(
                run_id = %run_id,
                stage = %stage.name,
                task_id = %task_id,
                attempt,
                worker_id = ?self.inner.worker_id,
                "Running unit"
            );
            if let Err(e) = reporter.report(0.0).await {
                tracing::warn!(task_id = %task_id, "Failed to report start: {}", e);
            }

            let ctx = UnitContext {
                run_id: run_id.clone(),
                task_id: task_id.clone(),
                stage: stage.name.clone(),
                attempt,
                progress: reporter.clone(),
                cancel: cancel.clone(),
            };
            let outcome =
                run_attempt(&registration, ctx, args.clone(), stage.timeout, permit).await;

            match outcome {
                Ok(value) => {
                    if let Err(e) = reporter.report(1.0).await {
                        tracing::warn!(task_id = %task_id, "Failed to report completion: {}", e);
                    }
                    self.finish(&task_id, TaskUpdate::done(value.clone())).await;
                    return Ok(value);
                }
                Err(PipelineError::Cancelled(_)) => {
                    return Err(self.cancelled(&run_id, &task_id).await);
                }
                Err(e) if e.is_retryable() && policy.allows_attempt(attempt + 1) => {
                    let delay = policy.delay_for(attempt);
                    tracing::warn!(
                        "Unit {} of stage {} attempt {} failed: {}, retrying in {}ms",
                        task_id,
                        stage.name,
                        attempt,
                        e,
                        delay.as_millis()
                    );
                    self.inner
                        .registry
                        .transition(
                            &task_id,
                            TaskUpdate::state(TaskState::Queued)
                                .with_retries_left(policy.retries_left(attempt)),
                        )
                        .await?;
                    if !backoff(delay, &cancel).await {
                        return Err(self.cancelled(&run_id, &task_id).await);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        "Unit {} of stage {} failed after {} attempt(s): {}",
                        task_id,
                        stage.name,
                        attempt,
                        e
                    );
                    self.finish(
                        &task_id,
                        TaskUpdate::failed(task_error(&e))
                            .with_retries_left(policy.retries_left(attempt)),
                    )
                    .await;
                    return Err(e);
                }
            }
        }
    }

    async fn send_signal(&self, run_id: &str, name: &str, payload: Value) -> Result<()> {
        if name != UPDATE_PROGRESS_SIGNAL {
            return Err(PipelineError::InvalidInput(format!(
                "unknown signal: {}",
                name
            )));
        }
        let signal: ProgressSignal = serde_json::from_value(payload)?;
        if signal.run_id != run_id {
            return Err(PipelineError::InvalidInput(format!(
                "signal for run {} delivered to run {}",
                signal.run_id, run_id
            )));
        }
        self.inner.progress.record_signal(&signal)?;
        // Units report under their task id
        if let Err(e) = self
            .inner
            .registry
            .set_progress(&signal.source_id, signal.rate)
            .await
        {
            tracing::debug!(source_id = %signal.source_id, "Progress not mirrored to registry: {}", e);
        }
        Ok(())
    }
}
