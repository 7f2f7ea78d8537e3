//! Work collected under the cache lock and carried out after releasing it.
//!
//! Subscriber callbacks, `should_notify` and recalculation predicates are
//! user code. They never run while the lock is held: entry writes produce
//! [`Notice`]s, started fetches produce [`FetchTicket`]s, and removed state
//! lands in the graveyard so its destructors also run unlocked.

use std::sync::Arc;

use crate::cache::fetch::FetchTicket;
use crate::cache::getter::RecalculatePredicate;
use crate::key::EntryId;
use crate::types::{QueryResult, ShouldNotify};

/// Subscriber callback.
pub(crate) type Callback = Arc<dyn Fn(&QueryResult) + Send + Sync>;

/// One visible result write.
pub(crate) struct Notice {
    pub(crate) entry: EntryId,
    pub(crate) prev: QueryResult,
    pub(crate) next: QueryResult,
    /// Subscribers at the time of the write, in subscription order.
    pub(crate) callbacks: Vec<Callback>,
    pub(crate) should_notify: ShouldNotify,
}

#[derive(Default)]
pub(crate) struct Outbox {
    pub(crate) notices: Vec<Notice>,
    pub(crate) tickets: Vec<FetchTicket>,
    pub(crate) graveyard: Vec<Box<dyn Send>>,
}

impl Outbox {
    pub(crate) fn notice(&mut self, notice: Option<Notice>) {
        if let Some(notice) = notice {
            self.notices.push(notice);
        }
    }

    pub(crate) fn bury<T: Send + 'static>(&mut self, value: T) {
        self.graveyard.push(Box::new(value));
    }
}

/// A notice together with the dependents to consider for recomputation.
pub(crate) struct Delivery {
    pub(crate) notice: Notice,
    pub(crate) dependents: Vec<(EntryId, RecalculatePredicate)>,
}

impl Delivery {
    /// Run subscriber callbacks. Returns the dependents whose predicate
    /// accepts the new result.
    pub(crate) fn notify(self) -> Vec<EntryId> {
        let Delivery { notice, dependents } = self;
        if (notice.should_notify)(&notice.prev, &notice.next) {
            for callback in &notice.callbacks {
                callback(&notice.next);
            }
        }
        dependents
            .into_iter()
            .filter(|(_, predicate)| predicate(&notice.next))
            .map(|(id, _)| id)
            .collect()
    }
}

/// Everything left to do once the lock is released.
#[derive(Default)]
pub(crate) struct Flush {
    pub(crate) deliveries: Vec<Delivery>,
    pub(crate) tickets: Vec<FetchTicket>,
    pub(crate) graveyard: Vec<Box<dyn Send>>,
}

impl Flush {
    pub(crate) fn is_empty(&self) -> bool {
        self.deliveries.is_empty() && self.tickets.is_empty() && self.graveyard.is_empty()
    }
}
