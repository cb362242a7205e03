//! Fixed-size batching of ordered work.

use futures::stream::{Stream, StreamExt};

use super::partition::{group_by_key, Group};
use crate::error::{PipelineError, Result};

/// Ordered, non-empty run of items dispatched as one unit of work.
pub type Batch<T> = Vec<T>;

/// Chunk `items` into batches of `batch_size`, the last one possibly shorter.
pub fn chunk<T>(items: impl IntoIterator<Item = T>, batch_size: usize) -> Result<Vec<Batch<T>>> {
    Ok(BatchPlanner::new(batch_size)?.chunk(items))
}

/// Splits ordered work into batches of a validated size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlanner {
    batch_size: usize,
}

impl BatchPlanner {
    pub fn new(batch_size: usize) -> Result<Self> {
        if batch_size < 1 {
            return Err(PipelineError::InvalidInput(
                "batch size must be at least one".to_string(),
            ));
        }
        Ok(Self { batch_size })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn chunk<T>(&self, items: impl IntoIterator<Item = T>) -> Vec<Batch<T>> {
        let mut batches = Vec::new();
        let mut current = Vec::with_capacity(self.batch_size);
        for item in items {
            current.push(item);
            if current.len() == self.batch_size {
                batches.push(std::mem::replace(
                    &mut current,
                    Vec::with_capacity(self.batch_size),
                ));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Lazily chunk a fallible stream. Stops at the first source error.
    pub fn chunk_stream<S, T, E>(&self, source: S) -> impl Stream<Item = Result<Batch<T>, E>> + Send
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let batch_size = self.batch_size;
        async_stream::try_stream! {
            let mut source = Box::pin(source);
            let mut current = Vec::with_capacity(batch_size);
            while let Some(item) = source.next().await {
                current.push(item?);
                if current.len() == batch_size {
                    yield std::mem::replace(&mut current, Vec::with_capacity(batch_size));
                }
            }
            if !current.is_empty() {
                yield current;
            }
        }
    }

    /// Chunk every group separately: no batch spans two groups, and each
    /// group's last partial batch is emitted as is.
    pub fn chunk_by_group<G, K, T, E>(
        &self,
        groups: G,
    ) -> impl Stream<Item = Result<(K, Batch<T>), E>> + Send
    where
        G: Stream<Item = Result<(K, Group<T, E>), E>> + Send + 'static,
        K: Clone + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let planner = *self;
        async_stream::try_stream! {
            let mut groups = Box::pin(groups);
            while let Some(group) = groups.next().await {
                let (key, items) = group?;
                let batches = planner.chunk_stream(items);
                futures::pin_mut!(batches);
                while let Some(batch) = batches.next().await {
                    yield (key.clone(), batch?);
                }
            }
        }
    }

    /// Group an ordered stream by `key` and batch each group, collecting
    /// the batches in source order.
    pub async fn plan_grouped<S, T, E, K, F>(&self, source: S, key: F) -> Result<Vec<Batch<T>>, E>
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<PipelineError> + Send + 'static,
        K: PartialEq + Clone + Send + Sync + 'static,
        F: Fn(&T) -> K + Clone + Send + Sync + 'static,
    {
        let batches = self.chunk_by_group(group_by_key(source, key));
        futures::pin_mut!(batches);
        let mut planned = Vec::new();
        while let Some(batch) = batches.next().await {
            let (_, batch) = batch?;
            planned.push(batch);
        }
        Ok(planned)
    }
}
