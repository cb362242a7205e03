//! Worker process wiring: configuration, handlers, pipelines and runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::WorkerConfig;
use crate::error::{PipelineError, Result};
use crate::logging::{init_tracing, worker_span};
use crate::orchestrator::{DynPipeline, RunContext, RunOutcome};
use crate::pipelines::builtin_pipelines;
use crate::progress::{ProgressAggregator, SharedProgressAggregator};
use crate::search::SharedSearchIndex;
use crate::substrate::{name_filter, Affinity, HandlerRegistry, LocalSubstrate};
use crate::task::SharedTaskRegistry;

/// Serves pipeline runs with handlers executed in this process.
pub struct Worker {
    config: WorkerConfig,
    substrate: LocalSubstrate,
    search: Option<SharedSearchIndex>,
    pipelines: BTreeMap<&'static str, Arc<dyn DynPipeline>>,
    shutdown: CancellationToken,
    span: tracing::Span,
}

fn warn_on_mixed_affinity(handlers: &HandlerRegistry) {
    let mut blocking = Vec::new();
    let mut cooperative = Vec::new();
    for name in handlers.names() {
        match handlers.get(name).map(|r| r.affinity()) {
            Ok(Affinity::Blocking) => blocking.push(name),
            Ok(Affinity::Async) => cooperative.push(name),
            Err(_) => {}
        }
    }
    if !blocking.is_empty() && !cooperative.is_empty() {
        tracing::warn!(
            blocking = ?blocking,
            cooperative = ?cooperative,
            "Worker mixes blocking and async handlers"
        );
    }
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        handlers: HandlerRegistry,
        registry: SharedTaskRegistry,
    ) -> Result<Self> {
        config.validate()?;
        warn_on_mixed_affinity(&handlers);
        let progress = Arc::new(ProgressAggregator::new());
        let substrate = LocalSubstrate::from_config(&config, handlers, registry, progress)?;
        let span = worker_span(&config.logging());
        Ok(Self {
            config,
            substrate,
            search: None,
            pipelines: BTreeMap::new(),
            shutdown: CancellationToken::new(),
            span,
        })
    }

    /// Install the tracing subscriber described by the worker configuration.
    pub fn init_logging(&self) -> bool {
        init_tracing(&self.config.logging())
    }

    pub fn with_search(mut self, search: SharedSearchIndex) -> Self {
        self.search = Some(search);
        self
    }

    /// Serve `pipeline`. Pipeline names are unique.
    pub fn with_pipeline(mut self, pipeline: Arc<dyn DynPipeline>) -> Result<Self> {
        let name = pipeline.name();
        if self.pipelines.contains_key(name) {
            return Err(PipelineError::Config(format!(
                "pipeline \"{}\" registered twice",
                name
            )));
        }
        tracing::debug!(pipeline = name, "Registered pipeline");
        self.pipelines.insert(name, pipeline);
        Ok(self)
    }

    /// Serve every built-in pipeline.
    pub fn with_builtin_pipelines(self) -> Result<Self> {
        builtin_pipelines(self.config.search.default_page_size)
            .into_iter()
            .try_fold(self, |worker, pipeline| worker.with_pipeline(pipeline))
    }

    /// Keep the pipelines whose name fully matches one of `patterns`.
    pub fn select_pipelines<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self> {
        if let Some(pattern) = name_filter(patterns)? {
            self.pipelines.retain(|name, _| pattern.is_match(name));
        }
        Ok(self)
    }

    pub fn pipelines(&self) -> Vec<&'static str> {
        self.pipelines.keys().copied().collect()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn progress(&self) -> SharedProgressAggregator {
        self.substrate.progress()
    }

    pub fn registry(&self) -> SharedTaskRegistry {
        self.substrate.registry()
    }

    /// A fresh context for one run, cancelled when the worker shuts down.
    pub fn context(&self, run_id: Option<String>) -> RunContext {
        let mut builder = RunContext::builder()
            .registry(self.substrate.registry())
            .substrate(Arc::new(self.substrate.clone()))
            .progress(self.substrate.progress())
            .cancel_with(&self.shutdown);
        if let Some(search) = &self.search {
            builder = builder.search(search.clone());
        }
        if let Some(run_id) = run_id {
            builder = builder.run_id(run_id);
        }
        builder.build()
    }

    /// Run the pipeline named `pipeline` on a JSON request.
    pub async fn run(&self, pipeline: &str, request: Value) -> Result<RunOutcome> {
        self.run_with_id(pipeline, request, None).await
    }

    pub async fn run_with_id(
        &self,
        pipeline: &str,
        request: Value,
        run_id: Option<String>,
    ) -> Result<RunOutcome> {
        let runner = self
            .pipelines
            .get(pipeline)
            .ok_or_else(|| PipelineError::InvalidInput(format!("unknown pipeline: {}", pipeline)))?;
        let ctx = self.context(run_id);
        let span = tracing::info_span!(
            parent: &self.span,
            "run",
            run_id = %ctx.run_id(),
            pipeline = pipeline
        );
        Ok(runner.run_json(&ctx, request).instrument(span).await)
    }

    /// Cancel every run in flight. Runs started afterwards are cancelled
    /// from the start.
    pub fn shutdown(&self) {
        tracing::info!(parent: &self.span, "Shutting down worker");
        self.shutdown.cancel();
    }
}
