//! One cache entry and its result state machine.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::fetch::FetchTicket;
use crate::cache::outbox::{Callback, Notice, Outbox};
use crate::cache::timer::Timers;
use crate::events::EventSubscription;
use crate::key::{EntryId, SubscriberId};
use crate::query::BuildFn;
use crate::types::{QueryResult, Request, ResolvedOptions};

/// What currently produces the entry's result.
pub(crate) enum EntryKind {
    /// Result assigned directly by a dependent computation.
    Static,
    /// Result fetched from `request`. `in_flight` holds the generation of the
    /// running fetch, if any.
    Dynamic {
        request: Arc<dyn Request>,
        in_flight: Option<u64>,
    },
}

/// How a write interacts with background fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Notify {
    /// Suppress `Stale`/`Loading` writes when `background_fetch` is on.
    Background,
    /// Always visible.
    Always,
}

pub(crate) struct Entry<C> {
    pub(crate) id: EntryId,
    pub(crate) key: String,
    pub(crate) result: QueryResult,
    pub(crate) sync: u64,
    pub(crate) kind: EntryKind,
    pub(crate) subscribers: BTreeMap<SubscriberId, Callback>,
    pub(crate) options: ResolvedOptions,
    pub(crate) timers: Timers,
    pub(crate) build: BuildFn<C>,
    /// Generation of the most recently started fetch.
    pub(crate) generation: u64,
    /// Refetching was stopped for lack of observers.
    pub(crate) fetch_canceled: bool,
    pub(crate) external: Option<EventSubscription>,
}

impl<C> Entry<C> {
    /// A fresh `Static` entry holding `Stale`.
    pub(crate) fn new(
        id: EntryId,
        key: String,
        build: BuildFn<C>,
        options: ResolvedOptions,
    ) -> Self {
        Self {
            id,
            key,
            result: QueryResult::Stale,
            sync: 0,
            kind: EntryKind::Static,
            subscribers: BTreeMap::new(),
            options,
            timers: Timers::default(),
            build,
            generation: 0,
            fetch_canceled: false,
            external: None,
        }
    }

    pub(crate) fn is_dynamic(&self) -> bool {
        matches!(self.kind, EntryKind::Dynamic { .. })
    }

    pub(crate) fn in_flight(&self) -> bool {
        matches!(
            self.kind,
            EntryKind::Dynamic {
                in_flight: Some(_),
                ..
            }
        )
    }

    /// Store `next`, bump the sync counter and describe who must hear of it.
    ///
    /// Returns `None` when the write is hidden by background fetching.
    pub(crate) fn write(&mut self, next: QueryResult, mode: Notify) -> Option<Notice> {
        let prev = std::mem::replace(&mut self.result, next.clone());
        self.sync += 1;

        let visible =
            mode == Notify::Always || !self.options.background_fetch || next.is_terminal();
        if !visible {
            return None;
        }
        Some(Notice {
            entry: self.id,
            prev,
            next,
            callbacks: self.subscribers.values().cloned().collect(),
            should_notify: self.options.should_notify.clone(),
        })
    }

    /// Start a fetch generation.
    ///
    /// Does nothing for `Static` entries, or while a fetch is in flight unless
    /// `force` is set. Expires a terminal result, writes `Loading` and queues
    /// a ticket for the executor.
    pub(crate) fn begin_fetch(&mut self, force: bool, outbox: &mut Outbox) {
        let request = match &mut self.kind {
            EntryKind::Dynamic { request, in_flight } if force || in_flight.is_none() => {
                self.generation += 1;
                *in_flight = Some(self.generation);
                request.clone()
            }
            _ => return,
        };
        self.fetch_canceled = false;

        if self.result.is_terminal() {
            outbox.notice(self.write(QueryResult::Stale, Notify::Background));
        }
        if self.result != QueryResult::Loading {
            outbox.notice(self.write(QueryResult::Loading, Notify::Background));
        }
        outbox.tickets.push(FetchTicket {
            entry: self.id,
            key: self.key.clone(),
            generation: self.generation,
            request,
            retry_limit: self.options.retry_limit,
        });
    }

    /// Apply a finished fetch. Returns `false` if `generation` was superseded.
    pub(crate) fn finish_fetch(
        &mut self,
        generation: u64,
        result: QueryResult,
        outbox: &mut Outbox,
    ) -> bool {
        match &mut self.kind {
            EntryKind::Dynamic { in_flight, .. } if *in_flight == Some(generation) => {
                *in_flight = None;
            }
            _ => return false,
        }
        outbox.notice(self.write(result, Notify::Background));
        true
    }

    /// Forget a fetch that faulted. The result stays as it is (`Loading`).
    pub(crate) fn abandon_fetch(&mut self, generation: u64) -> bool {
        match &mut self.kind {
            EntryKind::Dynamic { in_flight, .. } if *in_flight == Some(generation) => {
                *in_flight = None;
                true
            }
            _ => false,
        }
    }
}
