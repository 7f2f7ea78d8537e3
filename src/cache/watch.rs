//! Entry results as a `Stream`.
//!
//! Backed by a `tokio::sync::watch` channel, so a slow consumer sees the
//! latest result rather than every intermediate one and memory stays
//! bounded. The stream ends when the entry is evicted.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::Subscription;
use crate::types::QueryResult;

/// Sending half, owned by the subscriber callback.
pub(crate) struct Feed {
    sender: watch::Sender<QueryResult>,
    touched: AtomicBool,
}

impl Feed {
    pub(crate) fn channel() -> (Arc<Feed>, watch::Receiver<QueryResult>) {
        let (sender, receiver) = watch::channel(QueryResult::Stale);
        let feed = Feed {
            sender,
            touched: AtomicBool::new(false),
        };
        (Arc::new(feed), receiver)
    }

    /// Publish a notified result.
    pub(crate) fn push(&self, result: &QueryResult) {
        self.sender.send_modify(|current| {
            self.touched.store(true, Ordering::Release);
            *current = result.clone();
        });
    }

    /// Publish the subscription snapshot unless a notification already
    /// superseded it.
    pub(crate) fn seed(&self, snapshot: &QueryResult) {
        self.sender.send_if_modified(|current| {
            if self.touched.load(Ordering::Acquire) {
                return false;
            }
            *current = snapshot.clone();
            true
        });
    }
}

/// Stream of an entry's visible results, starting with the current one.
///
/// Holds a [`Subscription`], so the entry counts as observed while the
/// stream is alive.
#[derive(Debug)]
pub struct ResultStream {
    inner: WatchStream<QueryResult>,
    subscription: Subscription,
}

impl ResultStream {
    pub(crate) fn new(receiver: watch::Receiver<QueryResult>, subscription: Subscription) -> Self {
        Self {
            inner: WatchStream::new(receiver),
            subscription,
        }
    }

    pub fn key(&self) -> &str {
        self.subscription.key()
    }
}

impl Stream for ResultStream {
    type Item = QueryResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
