//! Lazy two-way split of an ordered stream.
//!
//! [`partition`] returns a [`Head`] yielding elements while the predicate
//! holds and a [`Remainder`] starting at the first element that fails it.
//! Both halves share the source and a single-assignment handoff slot: when
//! the head sees the first failing element it parks it in the slot and
//! ends; the remainder takes it from there and keeps pulling the source.
//!
//! Only one half may pull at a time. Driving the remainder before the head
//! has ended, or polling both halves at the same instant from different
//! threads, yields [`PipelineError::PartitionMisuse`] instead of waiting
//! forever for a handoff that nobody is going to make.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::PipelineError;

enum Handoff<T> {
    /// Head is still running.
    Pending,
    /// Head parked the first failing element.
    Ready(T),
    /// Remainder took the parked element and owns the source.
    Taken,
    /// Source ended while the head was running.
    Exhausted,
}

struct Shared<S, T> {
    source: Pin<Box<S>>,
    handoff: Handoff<T>,
}

type SharedHandle<S, T> = Arc<Mutex<Shared<S, T>>>;

/// Lock the shared state without blocking; contention means both halves
/// are being driven at once.
fn claim<S, T>(shared: &SharedHandle<S, T>) -> Result<MutexGuard<'_, Shared<S, T>>, PipelineError> {
    match shared.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => Err(PipelineError::PartitionMisuse(
            "head and remainder polled concurrently",
        )),
    }
}

/// Elements of the source while the predicate holds.
pub struct Head<S, T, P> {
    shared: SharedHandle<S, T>,
    predicate: P,
    done: bool,
}

/// Elements of the source from the first predicate failure onward.
pub struct Remainder<S, T> {
    shared: SharedHandle<S, T>,
}

// Nothing is structurally pinned: the source lives in its own `Pin<Box<_>>`.
impl<S, T, P> Unpin for Head<S, T, P> {}
impl<S, T> Unpin for Remainder<S, T> {}

/// Split `source` into a head and a remainder.
///
/// Source errors are passed through by whichever half is pulling. The
/// handoff slot belongs to this call only.
pub fn partition<S, T, E, P>(source: S, predicate: P) -> (Head<S, T, P>, Remainder<S, T>)
where
    S: Stream<Item = Result<T, E>>,
    E: From<PipelineError>,
    P: FnMut(&T) -> bool,
{
    let shared = Arc::new(Mutex::new(Shared {
        source: Box::pin(source),
        handoff: Handoff::Pending,
    }));
    (
        Head {
            shared: shared.clone(),
            predicate,
            done: false,
        },
        Remainder { shared },
    )
}

impl<S, T, E, P> Stream for Head<S, T, P>
where
    S: Stream<Item = Result<T, E>>,
    E: From<PipelineError>,
    P: FnMut(&T) -> bool,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let mut shared = match claim(&this.shared) {
            Ok(shared) => shared,
            Err(e) => return Poll::Ready(Some(Err(e.into()))),
        };
        match shared.source.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                shared.handoff = Handoff::Exhausted;
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(Some(Ok(item))) => {
                if (this.predicate)(&item) {
                    Poll::Ready(Some(Ok(item)))
                } else {
                    shared.handoff = Handoff::Ready(item);
                    this.done = true;
                    Poll::Ready(None)
                }
            }
        }
    }
}

impl<S, T, E> Stream for Remainder<S, T>
where
    S: Stream<Item = Result<T, E>>,
    E: From<PipelineError>,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut shared = match claim(&this.shared) {
            Ok(shared) => shared,
            Err(e) => return Poll::Ready(Some(Err(e.into()))),
        };
        match std::mem::replace(&mut shared.handoff, Handoff::Taken) {
            Handoff::Pending => {
                shared.handoff = Handoff::Pending;
                Poll::Ready(Some(Err(PipelineError::PartitionMisuse(
                    "remainder polled before the head ended",
                )
                .into())))
            }
            Handoff::Ready(item) => Poll::Ready(Some(Ok(item))),
            Handoff::Exhausted => {
                shared.handoff = Handoff::Exhausted;
                Poll::Ready(None)
            }
            Handoff::Taken => shared.source.as_mut().poll_next(cx),
        }
    }
}

/// One contiguous run of elements sharing a key.
pub type Group<T, E> = BoxStream<'static, Result<T, E>>;

/// Split an ordered stream into contiguous runs sharing the same key.
///
/// Each yielded group must be drained before the next one is requested;
/// asking early ends the outer stream with a partition misuse error.
pub fn group_by_key<S, T, E, K, F>(
    source: S,
    key: F,
) -> impl Stream<Item = Result<(K, Group<T, E>), E>> + Send
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<PipelineError> + Send + 'static,
    K: PartialEq + Clone + Send + Sync + 'static,
    F: Fn(&T) -> K + Clone + Send + Sync + 'static,
{
    async_stream::try_stream! {
        let mut rest: Group<T, E> = source.boxed();
        while let Some(first) = rest.next().await {
            let first = first?;
            let group_key = key(&first);
            let same_key = {
                let key = key.clone();
                let group_key = group_key.clone();
                move |item: &T| key(item) == group_key
            };
            let (head, remainder) = partition(rest, same_key);
            let group: Group<T, E> = stream::once(async move { Ok(first) }).chain(head).boxed();
            yield (group_key, group);
            rest = remainder.boxed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn source(items: Vec<i32>) -> impl Stream<Item = Result<i32, PipelineError>> + Send + 'static {
        stream::iter(items.into_iter().map(Ok))
    }

    async fn split(items: Vec<i32>, below: i32) -> (Vec<i32>, Vec<i32>) {
        let (head, remainder) = partition(source(items), move |x: &i32| *x < below);
        let head: Vec<i32> = head.try_collect().await.unwrap();
        let remainder: Vec<i32> = remainder.try_collect().await.unwrap();
        (head, remainder)
    }

    #[tokio::test]
    async fn test_head_and_remainder_reconstruct_source() {
        let items = vec![1, 2, 5, 1, 7, 0];
        for below in [0, 1, 2, 3, 6, 10] {
            let (head, remainder) = split(items.clone(), below).await;
            let joined: Vec<i32> = head.iter().chain(remainder.iter()).copied().collect();
            assert_eq!(joined, items, "predicate x < {}", below);
            assert!(head.iter().all(|x| *x < below));
            if let Some(first) = remainder.first() {
                assert!(*first >= below);
            }
        }
    }

    #[tokio::test]
    async fn test_empty_source() {
        let (head, remainder) = split(vec![], 3).await;
        assert!(head.is_empty());
        assert!(remainder.is_empty());
    }

    #[tokio::test]
    async fn test_predicate_never_fails() {
        let (head, remainder) = split(vec![1, 2, 3], 100).await;
        assert_eq!(head, vec![1, 2, 3]);
        assert!(remainder.is_empty());
    }

    #[tokio::test]
    async fn test_remainder_before_head_fails_fast() {
        let (head, mut remainder) = partition(source(vec![1, 2, 3]), |x: &i32| *x < 2);
        let err = remainder.next().await.unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::PartitionMisuse(_)));

        // The split is still usable once the discipline is respected
        let head: Vec<i32> = head.try_collect().await.unwrap();
        assert_eq!(head, vec![1]);
        let remainder: Vec<i32> = remainder.try_collect().await.unwrap();
        assert_eq!(remainder, vec![2, 3]);
    }

    #[test]
    fn test_halves_polled_concurrently_fail_fast() {
        use std::sync::mpsc;

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut pulled = false;
        // Parks the puller inside the source until released
        let gated = stream::poll_fn(move |_| {
            if pulled {
                return Poll::Ready(None);
            }
            pulled = true;
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            Poll::Ready(Some(Ok::<i32, PipelineError>(1)))
        });
        let (head, mut remainder) = partition(gated, |x: &i32| *x < 10);

        let draining = std::thread::spawn(move || {
            futures::executor::block_on(head.try_collect::<Vec<i32>>())
        });
        entered_rx.recv().unwrap();
        let err = futures::executor::block_on(remainder.next())
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::PartitionMisuse(msg) if msg.contains("concurrently")
        ));

        release_tx.send(()).unwrap();
        assert_eq!(draining.join().unwrap().unwrap(), vec![1]);
        assert!(futures::executor::block_on(remainder.next()).is_none());
    }

    #[tokio::test]
    async fn test_source_is_read_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let counted = source(vec![1, 1, 2, 3]).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let (head, remainder) = partition(counted, |x: &i32| *x == 1);
        let head: Vec<i32> = head.try_collect().await.unwrap();
        let remainder: Vec<i32> = remainder.try_collect().await.unwrap();
        assert_eq!(head, vec![1, 1]);
        assert_eq!(remainder, vec![2, 3]);
        assert_eq!(pulled.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_group_by_key() {
        let groups = group_by_key(source(vec![1, 1, 1, 2, 2, 2, 3]), |x: &i32| *x);
        futures::pin_mut!(groups);
        let mut collected = Vec::new();
        while let Some(group) = groups.next().await {
            let (key, items) = group.unwrap();
            let items: Vec<i32> = items.try_collect().await.unwrap();
            collected.push((key, items));
        }
        assert_eq!(
            collected,
            vec![(1, vec![1, 1, 1]), (2, vec![2, 2, 2]), (3, vec![3])]
        );
    }

    #[tokio::test]
    async fn test_group_by_key_requires_draining() {
        let groups = group_by_key(source(vec![1, 1, 2]), |x: &i32| *x);
        futures::pin_mut!(groups);
        let (_, _undrained) = groups.next().await.unwrap().unwrap();
        let err = groups.next().await.unwrap().err().unwrap();
        assert!(matches!(err, PipelineError::PartitionMisuse(_)));
    }

    #[tokio::test]
    async fn test_source_errors_pass_through() {
        let items = vec![Ok(1), Err(PipelineError::Search("page 2".to_string())), Ok(3)];
        let (mut head, _remainder) = partition(stream::iter(items), |x: &i32| *x < 10);
        assert_eq!(head.next().await.unwrap().unwrap(), 1);
        assert!(matches!(
            head.next().await.unwrap(),
            Err(PipelineError::Search(_))
        ));
        assert_eq!(head.next().await.unwrap().unwrap(), 3);
    }
}
