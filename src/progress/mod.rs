//! Progress module - weighted progress aggregation across concurrent units.
//!
//! # Key Concepts
//! - Signal: one source's latest completion rate and its weight
//! - Aggregator: per-run map of sources, summed into one observable pair
//! - Reporters: handles given to units of work to emit signals, optionally
//!   rescaled to a sub-range or fed with raw iteration counts

mod aggregator;
mod reporter;

pub use aggregator::{Progress, ProgressAggregator, ProgressSignal, SharedProgressAggregator};
pub use reporter::{ProgressRate, ProgressReporter, ProgressSink, RawProgress, ScaledProgress};
