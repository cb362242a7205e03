//! # docflow
//!
//! Orchestration and progress aggregation for batched document-processing
//! pipelines (translation, classification, transcription) whose units of
//! work run on an execution substrate.
//!
//! This library provides:
//! - Order-preserving batching of paged search results, grouped by key
//! - Concurrent fan-out of batches with deterministic fan-in
//! - Weighted progress aggregation across in-flight units of work
//! - Classification of failures into retryable and terminal
//!
//! ## Architecture
//!
//! ```text
//!   ┌─────────────┐  pages   ┌──────────────┐  batches  ┌──────────────┐
//!   │ SearchIndex ├─────────►│ BatchPlanner ├──────────►│ Orchestrator │
//!   └─────────────┘          │ (partition)  │           └──────┬───────┘
//!                            └──────────────┘                  │ dispatch × N
//!                                                              ▼
//!   ┌────────────────────┐  update_progress   ┌─────────────────────────┐
//!   │ ProgressAggregator │◄───────────────────┤ Substrate               │
//!   └────────────────────┘                    │  handlers + classifier  │
//!                                             └─────────────────────────┘
//! ```
//!
//! ## Run Flow
//! 1. Plan batches for a stage from an ordered source
//! 2. Dispatch every batch at once, each reporting weighted progress
//! 3. Wait for the whole stage at the barrier
//! 4. Repeat for the next stage, then return the assembled response
//!
//! ## Modules
//! - `stream`: stream partitioning, grouping and batching
//! - `progress`: weighted progress aggregation and reporting handles
//! - `classify`: retryable vs. terminal failure classification
//! - `orchestrator`: run context, phases and fan-out/barrier
//! - `substrate`: stage dispatch, handlers and the in-process substrate
//! - `pipelines`: the built-in pipelines
//! - `task`, `search`: registry and index collaborators
//! - `config`, `logging`, `worker`: process wiring

pub mod classify;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pipelines;
pub mod progress;
pub mod search;
pub mod stream;
pub mod substrate;
pub mod task;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{PipelineError, Result};
pub use orchestrator::{run_pipeline, Pipeline, RunContext, RunOutcome, RunStatus};
pub use worker::Worker;
