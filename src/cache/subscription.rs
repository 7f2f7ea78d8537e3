//! Subscriber registration guard.

use std::fmt;

use crate::types::QueryResult;

/// Registration of one subscriber with one entry.
///
/// Carries the sync counter and result current when the registration took
/// effect. Compare [`sync`](Subscription::sync) with a counter read earlier
/// to detect a change in between. Dropping the guard unsubscribes; once the
/// entry has no observers left its garbage-collection timers are armed.
///
/// # Panics
///
/// Dropping may arm timers and so requires a tokio runtime context.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    key: String,
    sync: u64,
    result: QueryResult,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new<F>(key: String, sync: u64, result: QueryResult, detach: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            key,
            sync,
            result,
            detach: Some(Box::new(detach)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Entry sync counter when the subscription took effect.
    pub fn sync(&self) -> u64 {
        self.sync
    }

    /// Entry result when the subscription took effect.
    pub fn result(&self) -> &QueryResult {
        &self.result
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("sync", &self.sync)
            .field("result", &self.result)
            .finish()
    }
}
