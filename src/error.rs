//! Error taxonomy shared by every pipeline component.
//!
//! Units of work return `anyhow::Result`; the [`ErrorClassifier`] is the
//! boundary that turns those into a [`PipelineError`]. Everything past that
//! boundary (substrate, orchestrator, callers) speaks `PipelineError` only.
//!
//! [`ErrorClassifier`]: crate::classify::ErrorClassifier

use std::time::Duration;

use thiserror::Error;

use crate::classify::FatalError;
use crate::task::TaskState;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Caller supplied arguments that can never succeed (batch size of 0, rate out of range, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Terminal failure of a unit of work. Never retried.
    #[error(transparent)]
    Fatal(#[from] FatalError),

    /// Allow-listed failure, carried unchanged so the substrate retry policy applies.
    #[error(transparent)]
    Transient(anyhow::Error),

    /// A collaborator was never injected into the run context.
    #[error("{0} was not injected")]
    DependencyMissing(&'static str),

    #[error("unknown task \"{task_id}\"{}", worker_suffix(.worker_id))]
    UnknownTask {
        task_id: String,
        worker_id: Option<String>,
    },

    #[error("task {task_id} can't transition from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    /// Both halves of a partitioned stream were driven out of order.
    #[error("partition misuse: {0}")]
    PartitionMisuse(&'static str),

    #[error("no handler registered for stage \"{0}\"")]
    StageNotRegistered(String),

    #[error("stage {stage} timed out after {timeout:?}")]
    Timeout { stage: String, timeout: Duration },

    #[error("run {0} was cancelled")]
    Cancelled(String),

    #[error("search failed: {0}")]
    Search(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the substrate may schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout { .. })
    }

    pub fn unknown_task(task_id: impl Into<String>) -> Self {
        Self::UnknownTask {
            task_id: task_id.into(),
            worker_id: None,
        }
    }
}

fn worker_suffix(worker_id: &Option<String>) -> String {
    match worker_id {
        Some(worker) => format!(" for {}", worker),
        None => String::new(),
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_task_message() {
        let err = PipelineError::unknown_task("translate-1");
        assert_eq!(err.to_string(), "unknown task \"translate-1\"");

        let err = PipelineError::UnknownTask {
            task_id: "translate-1".to_string(),
            worker_id: Some("worker-0".to_string()),
        };
        assert_eq!(err.to_string(), "unknown task \"translate-1\" for worker-0");
    }

    #[test]
    fn test_dependency_missing_message() {
        let err = PipelineError::DependencyMissing("search index");
        assert_eq!(err.to_string(), "search index was not injected");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(PipelineError::Transient(anyhow::anyhow!("flaky")).is_retryable());
        assert!(PipelineError::Timeout {
            stage: "translate-docs".to_string(),
            timeout: Duration::from_secs(1),
        }
        .is_retryable());
        assert!(!PipelineError::InvalidInput("bad".to_string()).is_retryable());
        assert!(!PipelineError::Cancelled("run".to_string()).is_retryable());
    }
}
