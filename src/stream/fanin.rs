//! Merge independently paced async sources into one sequence.
//!
//! Each source has exactly one pull outstanding. Whichever pull settles first
//! is emitted and its source is pulled again; a source that ends is dropped
//! and the merged stream ends once every source has ended.

use futures::FutureExt;
use futures::stream::{FuturesUnordered, Stream, StreamExt, StreamFuture};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;

/// A value tagged with the source that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxedEvent<K, V> {
    pub source: K,
    pub value: V,
}

/// One pending pull against a source
struct Pull<K, S> {
    key: K,
    inner: StreamFuture<S>,
}

impl<K, S> Pull<K, S>
where
    S: Stream + Unpin,
{
    fn new(key: K, stream: S) -> Self {
        Self {
            key,
            inner: stream.into_future(),
        }
    }
}

impl<K, S> Future for Pull<K, S>
where
    K: Clone + Unpin,
    S: Stream + Unpin,
{
    type Output = (K, Option<S::Item>, S);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner.poll_unpin(cx) {
            Poll::Ready((item, stream)) => Poll::Ready((self.key.clone(), item, stream)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct FanIn<K, S> {
    pending: FuturesUnordered<Pull<K, S>>,
}

impl<K, S> FanIn<K, S>
where
    K: Clone + Unpin,
    S: Stream + Unpin,
{
    pub fn new<I>(sources: I) -> Self
    where
        I: IntoIterator<Item = (K, S)>,
    {
        let pending = sources
            .into_iter()
            .map(|(key, stream)| Pull::new(key, stream))
            .collect();
        Self { pending }
    }

    /// Sources that have not ended yet
    pub fn active_sources(&self) -> usize {
        self.pending.len()
    }
}

impl<K, S> Stream for FanIn<K, S>
where
    K: Clone + Unpin,
    S: Stream + Unpin,
{
    type Item = MuxedEvent<K, S::Item>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.pending.poll_next_unpin(cx) {
                Poll::Ready(Some((key, Some(value), stream))) => {
                    self.pending.push(Pull::new(key.clone(), stream));
                    return Poll::Ready(Some(MuxedEvent { source: key, value }));
                }
                Poll::Ready(Some((_, None, _))) => {
                    debug!(remaining = self.pending.len(), "fan-in source exhausted");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, if self.pending.is_empty() { Some(0) } else { None })
    }
}

/// Merge named sources; see the module docs for ordering
pub fn mux_events<K, S, I>(sources: I) -> FanIn<K, S>
where
    K: Clone + Unpin,
    S: Stream + Unpin,
    I: IntoIterator<Item = (K, S)>,
{
    FanIn::new(sources)
}
