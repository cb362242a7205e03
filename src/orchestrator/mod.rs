//! Orchestrator module - sequencing stages of a run.
//!
//! # Run phases
//! ```text
//! PLANNING ──► DISPATCHING(stage) ──► BARRIER(stage) ──► ... ──► DONE
//!     │               │                     │
//!     └───────────────┴─────────────────────┴──────────────────► FAILED
//! ```
//!
//! A stage fans out one dispatch per unit of work, all running at once,
//! and the barrier waits for every one of them. Results are kept by
//! dispatch index, so their order never depends on completion order. A
//! failing branch doesn't cancel its siblings; once the barrier resolves
//! the run fails with the first failing branch's error, by index.

mod context;

use std::fmt;

use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::{PipelineError, Result};
use crate::progress::Progress;
use crate::substrate::{DispatchRequest, PipelineStage};

pub use context::{RunContext, RunContextBuilder};

/// Where a run stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunPhase {
    Planning,
    Dispatching(String),
    Barrier(String),
    Done,
    Failed,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn can_advance_to(&self, next: &RunPhase) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Self::Failed) => true,
            (Self::Planning, Self::Dispatching(_) | Self::Done) => true,
            (Self::Dispatching(a), Self::Barrier(b)) => a == b,
            (Self::Barrier(_), Self::Planning | Self::Dispatching(_) | Self::Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => write!(f, "PLANNING"),
            Self::Dispatching(stage) => write!(f, "DISPATCHING({})", stage),
            Self::Barrier(stage) => write!(f, "BARRIER({})", stage),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Arguments of one dispatch and its progress weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit<A> {
    pub args: A,
    pub weight: f64,
}

impl<A> Unit<A> {
    pub fn new(args: A, weight: f64) -> Self {
        Self { args, weight }
    }

    /// A unit weighing as much as the number of items it carries.
    pub fn sized(args: A, items: usize) -> Self {
        Self::new(args, items.max(1) as f64)
    }
}

/// Drives the phases of one run against its context.
pub struct Orchestrator<'a> {
    ctx: &'a RunContext,
    phase: watch::Sender<RunPhase>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        let (phase, _) = watch::channel(RunPhase::Planning);
        Self { ctx, phase }
    }

    pub fn context(&self) -> &RunContext {
        self.ctx
    }

    pub fn phase(&self) -> RunPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    fn advance(&self, next: RunPhase) -> Result<()> {
        let current = self.phase();
        if current == next {
            return Ok(());
        }
        if !current.can_advance_to(&next) {
            return Err(PipelineError::InvalidInput(format!(
                "run {} can't go from {} to {}",
                self.ctx.run_id(),
                current,
                next
            )));
        }
        tracing::debug!(run_id = %self.ctx.run_id(), phase = %next, "Run phase");
        self.phase.send_replace(next);
        Ok(())
    }

    /// Start planning the next stage.
    pub fn begin_planning(&self) -> Result<()> {
        self.advance(RunPhase::Planning)
    }

    /// Dispatch every unit to `stage` at once and wait for all of them.
    ///
    /// Returns the results in unit order. If any unit failed, the first
    /// failure in unit order is returned once every unit has settled.
    pub async fn fan_out<A, R>(&self, stage: &PipelineStage, units: Vec<Unit<A>>) -> Result<Vec<R>>
    where
        A: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        if self.ctx.is_cancelled() {
            return Err(self.fail(PipelineError::Cancelled(self.ctx.run_id().to_string())));
        }
        let substrate = self.ctx.substrate().map_err(|e| self.fail(e))?;
        self.advance(RunPhase::Dispatching(stage.name.clone()))?;

        let mut requests = Vec::with_capacity(units.len());
        for unit in units {
            let args = serde_json::to_value(&unit.args).map_err(|e| self.fail(e.into()))?;
            requests.push(DispatchRequest {
                run_id: self.ctx.run_id().to_string(),
                stage: stage.clone(),
                args,
                weight: unit.weight,
                cancel: self.ctx.cancel_token().clone(),
            });
        }
        let fan_out = requests.len();
        tracing::info!(
            run_id = %self.ctx.run_id(),
            stage = %stage.name,
            queue = %stage.queue,
            units = fan_out,
            "Dispatching stage"
        );
        let pending = join_all(requests.into_iter().map(|r| substrate.dispatch(r)));
        self.advance(RunPhase::Barrier(stage.name.clone()))?;
        let settled = pending.await;

        let failed = settled.iter().filter(|r| r.is_err()).count();
        let mut values = Vec::with_capacity(fan_out);
        let mut first_error = None;
        for (index, outcome) in settled.into_iter().enumerate() {
            match outcome {
                Ok(value) => values.push(value),
                Err(e) if first_error.is_none() => {
                    tracing::warn!(
                        run_id = %self.ctx.run_id(),
                        stage = %stage.name,
                        "Unit {} failed ({} of {} units failed): {}",
                        index,
                        failed,
                        fan_out,
                        e
                    );
                    first_error = Some(e);
                }
                Err(_) => {}
            }
        }
        if let Some(e) = first_error {
            return Err(self.fail(e));
        }
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| self.fail(e.into())))
            .collect()
    }

    /// Dispatch a single unit and wait for it.
    pub async fn dispatch_one<A, R>(&self, stage: &PipelineStage, unit: Unit<A>) -> Result<R>
    where
        A: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        let mut results = self.fan_out(stage, vec![unit]).await?;
        results
            .pop()
            .ok_or_else(|| PipelineError::InvalidInput("dispatch returned nothing".to_string()))
    }

    /// Move to `FAILED` and hand `err` back.
    fn fail(&self, err: PipelineError) -> PipelineError {
        if !self.phase().is_terminal() {
            self.phase.send_replace(RunPhase::Failed);
        }
        err
    }

    fn finish(&self, succeeded: bool) {
        let next = if succeeded {
            RunPhase::Done
        } else {
            RunPhase::Failed
        };
        if self.advance(next).is_err() && !self.phase().is_terminal() {
            self.phase.send_replace(RunPhase::Failed);
        }
    }
}

/// A multi-stage pipeline run by the orchestrator.
#[async_trait]
pub trait Pipeline: Send + Sync {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + 'static;

    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        orchestrator: &Orchestrator<'_>,
        request: Self::Request,
    ) -> Result<Self::Response>;

    /// Items a response accounts for, when it tracks a count.
    fn processed(&self, _response: &Self::Response) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

/// What a caller sees of a finished run: a payload or a single error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub pipeline: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Message of the error that failed the run, as the failing unit raised it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Kind of a unit failure (e.g. `ParseIntError`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    /// Last aggregate progress published for the run.
    pub progress: Progress,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Run `pipeline` end to end within `ctx`.
///
/// Progress signals are accepted for the run's id from start to finish
/// and rejected afterwards.
pub async fn run_pipeline<P: Pipeline>(
    ctx: &RunContext,
    pipeline: &P,
    request: P::Request,
) -> RunOutcome {
    let run_id = ctx.run_id().to_string();
    let name = Pipeline::name(pipeline);
    ctx.progress().open_run(&run_id);
    tracing::info!(run_id = %run_id, pipeline = name, "Run started");

    let orchestrator = Orchestrator::new(ctx);
    let execute = pipeline.execute(&orchestrator, request);
    tokio::pin!(execute);
    let finished = tokio::select! {
        biased;
        result = &mut execute => Some(result),
        _ = ctx.cancel_token().cancelled() => None,
    };
    // A cancelled run stops accepting progress right away, then waits for
    // its dispatches to wind down.
    let mut closed = None;
    let executed = match finished {
        Some(result) => result,
        None => {
            tracing::info!(run_id = %run_id, "Run cancelled, progress closed");
            closed = ctx.progress().close_run(&run_id);
            execute.await
        }
    };
    let result = match executed {
        Ok(response) => {
            let processed = pipeline.processed(&response);
            serde_json::to_value(&response)
                .map(|payload| (payload, processed))
                .map_err(PipelineError::from)
        }
        Err(e) => Err(e),
    };
    orchestrator.finish(result.is_ok());
    let progress = closed
        .or_else(|| ctx.progress().close_run(&run_id))
        .unwrap_or_default();

    match result {
        Ok((payload, processed)) => {
            tracing::info!(
                run_id = %run_id,
                pipeline = name,
                processed = ?processed,
                "Run succeeded"
            );
            RunOutcome {
                run_id,
                pipeline: name.to_string(),
                status: RunStatus::Success,
                payload: Some(payload),
                error: None,
                error_kind: None,
                processed,
                progress,
            }
        }
        Err(e) => {
            tracing::error!(run_id = %run_id, pipeline = name, "Run failed: {}", e);
            let (error, error_kind) = match e {
                PipelineError::Fatal(fatal) => (fatal.message, Some(fatal.kind)),
                other => (other.to_string(), None),
            };
            RunOutcome {
                run_id,
                pipeline: name.to_string(),
                status: RunStatus::Error,
                payload: None,
                error: Some(error),
                error_kind,
                processed: None,
                progress,
            }
        }
    }
}

/// A pipeline behind a JSON request, so different pipelines share one table.
#[async_trait]
pub trait DynPipeline: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_json(&self, ctx: &RunContext, request: Value) -> RunOutcome;
}

#[async_trait]
impl<P: Pipeline> DynPipeline for P {
    fn name(&self) -> &'static str {
        Pipeline::name(self)
    }

    async fn run_json(&self, ctx: &RunContext, request: Value) -> RunOutcome {
        match serde_json::from_value::<P::Request>(request) {
            Ok(request) => run_pipeline(ctx, self, request).await,
            Err(e) => RunOutcome {
                run_id: ctx.run_id().to_string(),
                pipeline: Pipeline::name(self).to_string(),
                status: RunStatus::Error,
                payload: None,
                error: Some(format!("invalid request: {}", e)),
                error_kind: None,
                processed: None,
                progress: Progress::default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressAggregator;
    use crate::substrate::{
        async_handler, HandlerRegistry, LocalSubstrate, Registration, RetryPolicy,
    };
    use crate::task::InMemoryTaskRegistry;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn context(handlers: HandlerRegistry) -> RunContext {
        let progress = Arc::new(ProgressAggregator::new());
        let substrate = LocalSubstrate::new(
            handlers,
            vec![("cpu", 4)],
            Arc::new(InMemoryTaskRegistry::new()),
            progress.clone(),
        )
        .unwrap();
        RunContext::builder()
            .substrate(Arc::new(substrate))
            .progress(progress)
            .build()
    }

    fn stage(name: &str) -> PipelineStage {
        PipelineStage::new(name, "cpu").with_retry_policy(RetryPolicy::no_retry())
    }

    /// Processes batches, failing the ones holding a negative number.
    struct Batches {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl Pipeline for Batches {
        type Request = Vec<Vec<i64>>;
        type Response = Vec<i64>;

        fn name(&self) -> &'static str {
            "batches"
        }

        async fn execute(
            &self,
            orchestrator: &Orchestrator<'_>,
            request: Self::Request,
        ) -> Result<Self::Response> {
            let units = request
                .into_iter()
                .map(|batch| {
                    let n = batch.len();
                    Unit::sized(batch, n)
                })
                .collect();
            let sums: Vec<i64> = orchestrator.fan_out(&stage("sum"), units).await?;
            Ok(sums)
        }

        fn processed(&self, response: &Self::Response) -> Option<u64> {
            Some(response.len() as u64)
        }
    }

    fn batches_pipeline() -> (Batches, HandlerRegistry) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let handlers = HandlerRegistry::new()
            .with(Registration::new(
                "sum",
                async_handler(move |_, args| {
                    let recorded = recorded.clone();
                    async move {
                        let batch: Vec<i64> = serde_json::from_value(args)?;
                        if let Some(bad) = batch.iter().find(|n| **n < 0) {
                            anyhow::bail!("negative item {}", bad);
                        }
                        // Later batches finish first
                        tokio::time::sleep(Duration::from_millis(
                            10 * (5 - batch.len() as u64).min(5),
                        ))
                        .await;
                        recorded.lock().unwrap().extend(batch.iter().copied());
                        Ok(json!(batch.iter().sum::<i64>()))
                    }
                }),
            ))
            .unwrap();
        (Batches { seen }, handlers)
    }

    #[test]
    fn test_phase_transitions() {
        use RunPhase::*;
        let translate = || Dispatching("translate".to_string());
        assert!(Planning.can_advance_to(&translate()));
        assert!(translate().can_advance_to(&Barrier("translate".to_string())));
        assert!(!translate().can_advance_to(&Barrier("classify".to_string())));
        assert!(Barrier("translate".to_string()).can_advance_to(&Planning));
        assert!(Barrier("translate".to_string()).can_advance_to(&Done));
        assert!(!Planning.can_advance_to(&Barrier("translate".to_string())));
        assert!(translate().can_advance_to(&Failed));
        assert!(!Done.can_advance_to(&Failed));
        assert!(!Failed.can_advance_to(&Planning));
    }

    #[tokio::test]
    async fn test_results_in_dispatch_order() {
        let (pipeline, handlers) = batches_pipeline();
        let ctx = context(handlers);
        let outcome = run_pipeline(&ctx, &pipeline, vec![vec![1], vec![2, 3], vec![4, 5, 6]]).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.payload, Some(json!([1, 5, 15])));
        assert_eq!(outcome.processed, Some(3));
        assert_eq!(outcome.progress.rate(), 1.0);
        assert_eq!(outcome.progress.max_progress, 6.0);
        // The run no longer accepts signals
        assert!(!ctx.progress().is_open(ctx.run_id()));
    }

    #[tokio::test]
    async fn test_failing_branch_fails_run_without_cancelling_siblings() {
        let (pipeline, handlers) = batches_pipeline();
        let seen = pipeline.seen.clone();
        let ctx = context(handlers);
        let outcome =
            run_pipeline(&ctx, &pipeline, vec![vec![1, 2], vec![3, -4], vec![5, 6]]).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(outcome.payload, None);
        assert_eq!(outcome.error.as_deref(), Some("negative item -4"));
        assert_eq!(outcome.error_kind.as_deref(), Some("Error"));

        // Batches 1 and 3 still did their work
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![1, 2, 5, 6]);
    }

    #[tokio::test]
    async fn test_first_error_by_dispatch_index() {
        let (pipeline, handlers) = batches_pipeline();
        let ctx = context(handlers);
        let outcome = run_pipeline(&ctx, &pipeline, vec![vec![1], vec![-2], vec![-3]]).await;
        assert_eq!(outcome.error.as_deref(), Some("negative item -2"));
    }

    #[tokio::test]
    async fn test_missing_substrate() {
        let (pipeline, _) = batches_pipeline();
        let ctx = RunContext::builder().build();
        let outcome = run_pipeline(&ctx, &pipeline, vec![vec![1]]).await;
        assert_eq!(outcome.error.as_deref(), Some("substrate was not injected"));
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let (pipeline, handlers) = batches_pipeline();
        let ctx = context(handlers);
        ctx.cancel();
        let outcome = run_pipeline(&ctx, &pipeline, vec![vec![1]]).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.error.unwrap().contains("cancelled"));
    }

    struct Slow;

    #[async_trait]
    impl Pipeline for Slow {
        type Request = ();
        type Response = ();

        fn name(&self) -> &'static str {
            "slow"
        }

        async fn execute(&self, orchestrator: &Orchestrator<'_>, _: ()) -> Result<()> {
            orchestrator
                .dispatch_one(&stage("slow"), Unit::new((), 1.0))
                .await
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_run_stops_progress() {
        let handlers = HandlerRegistry::new()
            .with(Registration::new(
                "slow",
                async_handler(|_, _| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(json!(null))
                }),
            ))
            .unwrap();
        let ctx = context(handlers);
        let (outcome, _) = tokio::join!(run_pipeline(&ctx, &Slow, ()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(ctx.progress().is_open(ctx.run_id()));
            ctx.cancel();
        });
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(!ctx.progress().is_open(ctx.run_id()));
        assert!(ctx
            .progress()
            .record(ctx.run_id(), "late", 1.0, 1.0)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_phases_observed() {
        let (_, handlers) = batches_pipeline();
        let ctx = context(handlers);
        let orchestrator = Orchestrator::new(&ctx);
        let sums: Vec<i64> = orchestrator
            .fan_out(&stage("sum"), vec![Unit::sized(vec![1, 2], 2)])
            .await
            .unwrap();
        assert_eq!(sums, vec![3]);
        assert_eq!(orchestrator.phase(), RunPhase::Barrier("sum".to_string()));
        orchestrator.begin_planning().unwrap();
        let one: i64 = orchestrator
            .dispatch_one(&stage("sum"), Unit::new(vec![4], 1.0))
            .await
            .unwrap();
        assert_eq!(one, 4);
        orchestrator.finish(true);
        assert_eq!(orchestrator.phase(), RunPhase::Done);
        assert!(orchestrator.begin_planning().is_err());
    }

    #[tokio::test]
    async fn test_json_entry_point() {
        let (pipeline, handlers) = batches_pipeline();
        let ctx = context(handlers);
        let outcome = pipeline.run_json(&ctx, json!([[1, 1]])).await;
        assert_eq!(outcome.payload, Some(json!([2])));
        let outcome = pipeline.run_json(&ctx, json!({"not": "batches"})).await;
        assert!(outcome.error.unwrap().starts_with("invalid request"));
    }
}
