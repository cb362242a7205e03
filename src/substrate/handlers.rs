//! Static table of stage handlers.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::classify::ErrorClassifier;
use crate::error::{PipelineError, Result};
use crate::progress::ProgressReporter;

/// Where a handler runs, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    /// Cooperative executor, for IO-bound handlers.
    Async,
    /// Bounded blocking pool, for CPU-bound handlers.
    Blocking,
}

/// What a unit of work knows about itself while it runs.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub run_id: String,
    pub task_id: String,
    pub stage: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, ctx: UnitContext, args: Value) -> anyhow::Result<Value>;
}

pub trait BlockingStageHandler: Send + Sync {
    fn handle(&self, ctx: UnitContext, args: Value) -> anyhow::Result<Value>;
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> StageHandler for AsyncFn<F>
where
    F: Fn(UnitContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, ctx: UnitContext, args: Value) -> anyhow::Result<Value> {
        (self.0)(ctx, args).await
    }
}

struct BlockingFn<F>(F);

impl<F> BlockingStageHandler for BlockingFn<F>
where
    F: Fn(UnitContext, Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn handle(&self, ctx: UnitContext, args: Value) -> anyhow::Result<Value> {
        (self.0)(ctx, args)
    }
}

/// Wrap an async closure as a handler.
pub fn async_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(UnitContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Handler::Async(Arc::new(AsyncFn(f)))
}

/// Wrap a blocking closure as a handler.
pub fn blocking_handler<F>(f: F) -> Handler
where
    F: Fn(UnitContext, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Handler::Blocking(Arc::new(BlockingFn(f)))
}

#[derive(Clone)]
pub enum Handler {
    Async(Arc<dyn StageHandler>),
    Blocking(Arc<dyn BlockingStageHandler>),
}

impl Handler {
    pub fn affinity(&self) -> Affinity {
        match self {
            Self::Async(_) => Affinity::Async,
            Self::Blocking(_) => Affinity::Blocking,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{:?}", self.affinity())
    }
}

/// A handler with the classifier deciding which of its failures retry.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub handler: Handler,
    pub classifier: ErrorClassifier,
}

impl Registration {
    pub fn new(name: impl Into<String>, handler: Handler) -> Self {
        Self {
            name: name.into(),
            handler,
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn affinity(&self) -> Affinity {
        self.handler.affinity()
    }
}

/// Stage name to handler, filled once at startup.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration. Stage names are unique.
    pub fn register(&mut self, registration: Registration) -> Result<()> {
        if self.handlers.contains_key(&registration.name) {
            return Err(PipelineError::Config(format!(
                "stage \"{}\" registered twice",
                registration.name
            )));
        }
        tracing::debug!(
            stage = %registration.name,
            affinity = ?registration.affinity(),
            retry_on = ?registration.classifier.retriable_kinds(),
            "Registered stage handler"
        );
        self.handlers
            .insert(registration.name.clone(), registration);
        Ok(())
    }

    /// Builder-style [`Self::register`].
    pub fn with(mut self, registration: Registration) -> Result<Self> {
        self.register(registration)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<&Registration> {
        self.handlers
            .get(name)
            .ok_or_else(|| PipelineError::StageNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Keep the registrations whose name fully matches one of `patterns`.
    ///
    /// Patterns are regular expressions; an empty list keeps everything.
    pub fn select<S: AsRef<str>>(&self, patterns: &[S]) -> Result<Self> {
        let Some(pattern) = name_filter(patterns)? else {
            return Ok(self.clone());
        };
        let handlers = self
            .handlers
            .iter()
            .filter(|(name, _)| pattern.is_match(name))
            .map(|(name, registration)| (name.clone(), registration.clone()))
            .collect();
        Ok(Self { handlers })
    }
}

/// Anchored alternation of `patterns`, or `None` when there is nothing to filter on.
pub(crate) fn name_filter<S: AsRef<str>>(patterns: &[S]) -> Result<Option<Regex>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let alternation = patterns
        .iter()
        .map(|p| p.as_ref())
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("^(?:{})$", alternation))
        .map(Some)
        .map_err(|e| PipelineError::Config(format!("invalid name filter: {}", e)))
}
