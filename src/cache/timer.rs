//! Cancellable one-shot and repeating timers on the tokio scheduler.
//!
//! A [`Timer`] owns the spawned task; dropping it aborts the task. Each
//! timer carries a token allocated by the cache. Callbacks re-check their
//! token under the cache lock, so a timer that already woke up when it was
//! replaced or cancelled does nothing.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

pub(crate) struct Timer {
    token: u64,
    handle: JoinHandle<()>,
}

impl Timer {
    /// Run `fire` once after `delay`.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub(crate) fn once<F>(token: u64, delay: Duration, fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(token, async move {
            tokio::time::sleep(delay).await;
            fire();
        })
    }

    /// Run `tick` every `period` until it returns `false`.
    ///
    /// The first tick happens one full period after arming.
    pub(crate) fn repeating<F>(token: u64, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::spawn(token, async move {
            loop {
                tokio::time::sleep(period).await;
                if !tick() {
                    break;
                }
            }
        })
    }

    fn spawn<Fut>(token: u64, task: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            token,
            handle: tokio::spawn(task),
        }
    }

    pub(crate) fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The three timers an entry may own, at most one of each.
#[derive(Default)]
pub(crate) struct Timers {
    pub(crate) refetch: Option<Timer>,
    pub(crate) stop_refetch: Option<Timer>,
    pub(crate) evict: Option<Timer>,
}

impl Timers {
    /// Whether `token` still names the armed refetch timer.
    pub(crate) fn is_refetch(&self, token: u64) -> bool {
        self.refetch.as_ref().is_some_and(|t| t.token() == token)
    }

    pub(crate) fn is_stop_refetch(&self, token: u64) -> bool {
        self.stop_refetch.as_ref().is_some_and(|t| t.token() == token)
    }

    pub(crate) fn is_evict(&self, token: u64) -> bool {
        self.evict.as_ref().is_some_and(|t| t.token() == token)
    }

    /// Cancel the two garbage-collection timers.
    pub(crate) fn cancel_gc(&mut self) {
        self.stop_refetch = None;
        self.evict = None;
    }

    pub(crate) fn cancel_all(&mut self) {
        self.refetch = None;
        self.cancel_gc();
    }
}
