//! Per-run collaborators, passed explicitly to every component.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::progress::{ProgressAggregator, SharedProgressAggregator};
use crate::search::{SearchIndex, SharedSearchIndex};
use crate::substrate::{SharedSubstrate, Substrate};
use crate::task::{SharedTaskRegistry, TaskRegistry};

/// Everything one run needs, built once when the run starts.
///
/// Collaborators are optional so that pipelines only pay for what they
/// use; asking for one that was never injected fails at first use with
/// [`PipelineError::DependencyMissing`].
#[derive(Clone)]
pub struct RunContext {
    run_id: String,
    registry: Option<SharedTaskRegistry>,
    search: Option<SharedSearchIndex>,
    substrate: Option<SharedSubstrate>,
    progress: SharedProgressAggregator,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("registry", &self.registry.is_some())
            .field("search", &self.search.is_some())
            .field("substrate", &self.substrate.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl RunContext {
    pub fn builder() -> RunContextBuilder {
        RunContextBuilder::default()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn registry(&self) -> Result<&dyn TaskRegistry> {
        self.registry
            .as_deref()
            .ok_or(PipelineError::DependencyMissing("task registry"))
    }

    pub fn search(&self) -> Result<&dyn SearchIndex> {
        self.search
            .as_deref()
            .ok_or(PipelineError::DependencyMissing("search index"))
    }

    pub fn substrate(&self) -> Result<&dyn Substrate> {
        self.substrate
            .as_deref()
            .ok_or(PipelineError::DependencyMissing("substrate"))
    }

    pub fn progress(&self) -> &ProgressAggregator {
        &self.progress
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the run: outstanding dispatches are abandoned.
    pub fn cancel(&self) {
        tracing::info!(run_id = %self.run_id, "Cancelling run");
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Default)]
pub struct RunContextBuilder {
    run_id: Option<String>,
    registry: Option<SharedTaskRegistry>,
    search: Option<SharedSearchIndex>,
    substrate: Option<SharedSubstrate>,
    progress: Option<SharedProgressAggregator>,
    cancel: Option<CancellationToken>,
}

impl RunContextBuilder {
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn registry(mut self, registry: SharedTaskRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn search(mut self, search: SharedSearchIndex) -> Self {
        self.search = Some(search);
        self
    }

    pub fn substrate(mut self, substrate: SharedSubstrate) -> Self {
        self.substrate = Some(substrate);
        self
    }

    /// Aggregator receiving the run's progress. It must be the one the
    /// substrate delivers `update_progress` signals to.
    pub fn progress(mut self, progress: SharedProgressAggregator) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Derive the run's token from `parent`, so cancelling the parent cancels the run.
    pub fn cancel_with(mut self, parent: &CancellationToken) -> Self {
        self.cancel = Some(parent.child_token());
        self
    }

    pub fn build(self) -> RunContext {
        RunContext {
            run_id: self
                .run_id
                .unwrap_or_else(|| format!("run-{}", Uuid::new_v4())),
            registry: self.registry,
            search: self.search,
            substrate: self.substrate,
            progress: self
                .progress
                .unwrap_or_else(|| Arc::new(ProgressAggregator::new())),
            cancel: self.cancel.unwrap_or_else(CancellationToken::new),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::InMemoryIndex;

    #[test]
    fn test_missing_dependencies_fail_at_first_use() {
        let ctx = RunContext::builder().build();
        assert!(ctx.run_id().starts_with("run-"));
        let err = ctx.search().err().unwrap();
        assert_eq!(err.to_string(), "search index was not injected");
        assert!(matches!(
            ctx.substrate(),
            Err(PipelineError::DependencyMissing("substrate"))
        ));
        assert!(ctx.registry().is_err());
    }

    #[test]
    fn test_injected_dependencies() {
        let ctx = RunContext::builder()
            .run_id("run-1")
            .search(Arc::new(InMemoryIndex::new()))
            .build();
        assert_eq!(ctx.run_id(), "run-1");
        assert!(ctx.search().is_ok());
    }

    #[test]
    fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let ctx = RunContext::builder().cancel_with(&parent).build();
        assert!(!ctx.is_cancelled());
        parent.cancel();
        assert!(ctx.is_cancelled());

        // Cancelling one run leaves the parent alone
        let parent = CancellationToken::new();
        let ctx = RunContext::builder().cancel_with(&parent).build();
        ctx.cancel();
        assert!(!parent.is_cancelled());
    }
}
