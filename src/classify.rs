//! Failure classification at the boundary of a unit of work.
//!
//! A unit of work returns `anyhow::Result`. Errors whose type is on the
//! classifier's allow-list leave the unit unchanged as
//! [`PipelineError::Transient`] so the substrate's retry policy applies.
//! Anything else becomes a [`FatalError`], which is never retried: a
//! malformed document fails the same way on every attempt.

use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PipelineError;
use crate::task::{StacktraceItem, TaskError};

/// Terminal failure of a unit of work.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct FatalError {
    /// Kind name of the original error (e.g. `ParseIntError`).
    pub kind: String,
    pub message: String,
    /// Lower layers of the error chain, outermost first.
    pub cause: Option<String>,
    pub stacktrace: Vec<StacktraceItem>,
    pub non_retryable: bool,
}

impl FatalError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
            stacktrace: Vec::new(),
            non_retryable: true,
        }
    }

    /// Registry payload for a task that ended with this error.
    pub fn to_task_error(&self) -> TaskError {
        TaskError {
            name: self.kind.clone(),
            message: self.message.clone(),
            cause: self.cause.clone(),
            stacktrace: self.stacktrace.clone(),
        }
    }
}

/// An allow-listed error type.
#[derive(Clone)]
struct Retriable {
    name: &'static str,
    matches: fn(&anyhow::Error) -> bool,
}

fn is_kind<E>(err: &anyhow::Error) -> bool
where
    E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
{
    err.downcast_ref::<E>().is_some()
}

/// Wraps units of work and decides which of their failures may be retried.
#[derive(Clone, Default)]
pub struct ErrorClassifier {
    retriables: Vec<Retriable>,
}

impl std::fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("retriables", &self.retriable_kinds())
            .finish()
    }
}

impl ErrorClassifier {
    /// A classifier with an empty allow-list: every failure is fatal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow-list errors of type `E`.
    pub fn retry_on<E>(mut self) -> Self
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.retriables.push(Retriable {
            name: short_type_name(std::any::type_name::<E>()),
            matches: is_kind::<E>,
        });
        self
    }

    pub fn retriable_kinds(&self) -> Vec<&'static str> {
        self.retriables.iter().map(|r| r.name).collect()
    }

    /// Classify a failure raised by a unit of work.
    ///
    /// A [`PipelineError`] raised inside the unit gets no special treatment:
    /// unless allow-listed it becomes fatal like anything else. Only errors
    /// that are already terminal (`Fatal`, `Cancelled`) pass through.
    pub fn classify(&self, mut err: anyhow::Error) -> PipelineError {
        if self.retriables.iter().any(|r| (r.matches)(&err)) {
            return PipelineError::Transient(err);
        }
        let terminal = matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Fatal(_) | PipelineError::Cancelled(_))
        );
        if terminal {
            match err.downcast::<PipelineError>() {
                Ok(classified) => return classified,
                Err(unchanged) => err = unchanged,
            }
        }
        match err.downcast::<FatalError>() {
            Ok(fatal) => fatal.into(),
            Err(err) => fatal_error_from(&err).into(),
        }
    }

    /// Run an async unit of work, classifying its failure.
    pub async fn guard<T, F>(&self, work: F) -> Result<T, PipelineError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        work.await.map_err(|e| self.classify(e))
    }

    /// Run a blocking unit of work, classifying its failure.
    pub fn guard_blocking<T>(
        &self,
        work: impl FnOnce() -> anyhow::Result<T>,
    ) -> Result<T, PipelineError> {
        work().map_err(|e| self.classify(e))
    }
}

/// Build the terminal error for an unclassified failure.
pub fn fatal_error_from(err: &anyhow::Error) -> FatalError {
    let message = err.to_string();
    let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
    FatalError {
        kind: kind_name(err.root_cause()),
        message,
        cause: if causes.is_empty() {
            None
        } else {
            Some(causes.join(": "))
        },
        stacktrace: parse_backtrace(&err.backtrace().to_string()),
        non_retryable: true,
    }
}

/// Best-effort kind name of an opaque error, read off its `Debug` output.
///
/// Derived `Debug` starts with the type or variant name
/// (`ParseIntError { kind: InvalidDigit }`); ad-hoc errors don't, and get
/// the generic `Error`.
fn kind_name(err: &(dyn std::error::Error + 'static)) -> String {
    let debug = format!("{:?}", err);
    let head: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    match head.chars().next() {
        Some(c) if c.is_ascii_uppercase() => head,
        _ => "Error".to_string(),
    }
}

fn short_type_name(name: &'static str) -> &'static str {
    let base = name.split('<').next().unwrap_or(name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Parse a rendered `std::backtrace::Backtrace` into frames.
///
/// Frames look like `  3: crate::module::function` followed by an
/// optional `             at ./src/file.rs:12:5` line. Returns nothing
/// when backtraces are disabled.
fn parse_backtrace(rendered: &str) -> Vec<StacktraceItem> {
    let mut frames: Vec<StacktraceItem> = Vec::new();
    for line in rendered.lines() {
        let trimmed = line.trim();
        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                let mut parts = location.rsplitn(3, ':');
                let _column = parts.next();
                let lineno = parts.next().and_then(|l| l.parse().ok());
                if let (Some(lineno), Some(file)) = (lineno, parts.next()) {
                    frame.file = file.to_string();
                    frame.lineno = lineno;
                }
            }
        } else if let Some((index, name)) = trimmed.split_once(": ") {
            if index.chars().all(|c| c.is_ascii_digit()) && !index.is_empty() {
                frames.push(StacktraceItem {
                    name: name.to_string(),
                    file: String::new(),
                    lineno: 0,
                });
            }
        }
    }
    frames
}
