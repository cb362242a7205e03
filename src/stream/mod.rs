//! Ordered-stream plumbing used to plan batches.
//!
//! # Key Concepts
//! - Partition: split one stream into a head (while a predicate holds) and
//!   the remainder, without buffering
//! - Grouping: repeated partitioning on "same key as the first element"
//! - Batching: fixed-size chunks that never cross a group boundary

mod batch;
mod partition;

pub use batch::{chunk, Batch, BatchPlanner};
pub use partition::{group_by_key, partition, Group, Head, Remainder};
