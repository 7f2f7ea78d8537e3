//! The entry registry and its scheduling engine.
//!
//! [`Cache`] owns a keyed table of entries. Each entry holds one
//! [`QueryResult`], a set of subscribers, its resolved options and up to
//! three timers: a repeating refetch timer and the two delayed
//! garbage-collection timers (stop refetching, then evict).
//!
//! # Architecture
//!
//! All entries, the key table and the [dependency graph](graph) live behind
//! one mutex. User code (build closures, predicates, subscriber callbacks)
//! never runs under it. Every operation collects its side effects in an
//! [`Outbox`](outbox::Outbox) while locked, releases the lock and then
//! delivers notifications, re-evaluates dependents and spawns fetches.
//!
//! An entry is *observed* while it has subscribers or dependents. When the
//! last observer leaves, the stop-refetch and evict timers are armed; a new
//! observer cancels both. Entries also arm them at creation, so a prefetched
//! entry nobody subscribes to is collected eventually.
//!
//! Fetches are tagged with a per-entry generation. A completion that is not
//! the latest generation is discarded, so a forced fetch always wins over
//! the one it superseded.
//!
//! # Dependent computations
//!
//! A dependent build reads other entries through a [`Getter`]. The reads
//! become edges once the evaluation returns, replacing the previous edge set
//! in one step. A visible write to an upstream re-evaluates each dependent
//! whose edge predicate accepts the new result. Installing edges that would
//! close a cycle fails with [`CacheError::CyclicDependency`].

mod builder;
mod entry;
mod fetch;
mod getter;
mod graph;
mod outbox;
mod subscription;
mod timer;
mod watch;

pub use builder::CacheBuilder;
pub use getter::{Getter, GetterOptions, RecalculatePredicate};
pub use subscription::Subscription;
pub use watch::ResultStream;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};

use self::entry::{Entry, EntryKind, Notify};
use self::fetch::FetchTicket;
use self::graph::DependencyGraph;
use self::outbox::{Delivery, Flush, Outbox};
use self::timer::Timer;
use self::watch::Feed;
use crate::events::{EventSource, ExternalEvent};
use crate::hash::KeyHasher;
use crate::key::{EntryId, IdSource, SubscriberId};
use crate::mutation::MutationCache;
use crate::query::{Build, BuildFn, Query, Resolved};
use crate::telemetry;
use crate::types::{CacheOptions, QueryResult, ResolvedOptions};
use crate::{CacheError, Result};

/// Handle to a live entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRef {
    pub id: EntryId,
    pub key: String,
}

pub(crate) struct Shared<C> {
    client: C,
    hasher: KeyHasher,
    defaults: CacheOptions,
    events: Option<Arc<dyn EventSource>>,
    state: Mutex<State<C>>,
    ids: IdSource,
}

pub(crate) struct State<C> {
    keys: HashMap<String, EntryId>,
    entries: HashMap<EntryId, Entry<C>>,
    graph: DependencyGraph,
}

impl<C> Default for State<C> {
    fn default() -> Self {
        Self {
            keys: HashMap::new(),
            entries: HashMap::new(),
            graph: DependencyGraph::default(),
        }
    }
}

impl<C> State<C> {
    fn id_of(&self, key: &str) -> Result<EntryId> {
        self.keys
            .get(key)
            .copied()
            .ok_or_else(|| CacheError::NoSuchEntry(key.to_string()))
    }

    fn entry(&self, key: &str) -> Result<&Entry<C>> {
        let id = self.id_of(key)?;
        self.entries
            .get(&id)
            .ok_or_else(|| CacheError::NoSuchEntry(key.to_string()))
    }

    fn entry_mut(&mut self, key: &str) -> Result<&mut Entry<C>> {
        let id = self.id_of(key)?;
        self.entries
            .get_mut(&id)
            .ok_or_else(|| CacheError::NoSuchEntry(key.to_string()))
    }

    fn key_of(&self, id: EntryId) -> String {
        self.entries
            .get(&id)
            .map(|entry| entry.key.clone())
            .unwrap_or_default()
    }

    /// Subscribers plus dependents.
    fn observers(&self, id: EntryId) -> usize {
        let subscribers = self.entries.get(&id).map_or(0, |e| e.subscribers.len());
        subscribers + self.graph.dependent_count(id)
    }

    /// Attach the dependents of every written entry to its notice.
    fn seal(&self, outbox: Outbox) -> Flush {
        let Outbox {
            notices,
            tickets,
            graveyard,
        } = outbox;
        let deliveries = notices
            .into_iter()
            .map(|notice| {
                let dependents = self.graph.dependents_of(notice.entry);
                Delivery { notice, dependents }
            })
            .collect();
        Flush {
            deliveries,
            tickets,
            graveyard,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GcStage {
    StopRefetch,
    Evict,
}

/// A registry of auto-refreshing query results over client `C`.
///
/// Cheap to clone; clones share the same entries. Methods that arm timers
/// or start fetches must be called from within a tokio runtime.
pub struct Cache<C> {
    shared: Arc<Shared<C>>,
}

impl<C> Clone for Cache<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C> Cache<C>
where
    C: Send + Sync + 'static,
{
    /// A cache with built-in defaults, no event source and a fresh hasher.
    pub fn new(client: C) -> Self {
        CacheBuilder::new(client).build()
    }

    pub fn builder(client: C) -> CacheBuilder<C> {
        CacheBuilder::new(client)
    }

    pub fn client(&self) -> &C {
        &self.shared.client
    }

    pub fn hasher(&self) -> &KeyHasher {
        &self.shared.hasher
    }

    /// Ambient default options of this cache.
    pub fn defaults(&self) -> &CacheOptions {
        &self.shared.defaults
    }

    /// A mutation registry over the same client and hasher.
    pub fn mutation_cache(&self) -> MutationCache<C>
    where
        C: Clone,
    {
        MutationCache::with_hasher(self.shared.client.clone(), self.shared.hasher.clone())
    }

    fn lock(&self) -> MutexGuard<'_, State<C>> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn weak(&self) -> Weak<Shared<C>> {
        Arc::downgrade(&self.shared)
    }

    fn upgrade(weak: &Weak<Shared<C>>) -> Option<Self> {
        weak.upgrade().map(|shared| Cache { shared })
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Get or create the entry of `query(args)`.
    ///
    /// Options resolve, lowest first: built-in defaults, the cache's
    /// defaults, the query's options, then `overrides`. Options of an
    /// existing entry are left alone; use [`set_options`](Self::set_options).
    ///
    /// # Errors
    ///
    /// [`CacheError::NonSerializableArgument`] if `args` cannot be hashed,
    /// or any error of the initial build evaluation.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn query<A>(
        &self,
        query: &Query<C, A>,
        args: &A,
        overrides: CacheOptions,
    ) -> Result<EntryRef>
    where
        A: Serialize + Clone + Send + Sync + 'static,
    {
        let key = query.key(&self.shared.hasher, args)?;
        let options = query.options().merge(&overrides);
        self.get_or_create(key, query.bind(args), options)
    }

    /// Create `query(args)` if needed, then fetch it and arm refetching
    /// without subscribing.
    pub fn prefetch<A>(&self, query: &Query<C, A>, args: &A) -> Result<EntryRef>
    where
        A: Serialize + Clone + Send + Sync + 'static,
    {
        let entry = self.query(query, args, CacheOptions::default())?;
        let flush = {
            let mut state = self.lock();
            let mut outbox = Outbox::default();
            if let Some(e) = state.entries.get_mut(&entry.id) {
                e.begin_fetch(false, &mut outbox);
                self.ensure_refetch(e, false, false, &mut outbox);
            }
            state.seal(outbox)
        };
        self.flush(flush);
        Ok(entry)
    }

    /// Return the entry for `key`, constructing it from `build` if absent.
    ///
    /// A new entry evaluates `build` once. A request makes it dynamic and
    /// starts fetching and refetching; a dependent computation is evaluated
    /// with a fresh [`Getter`] and either promotes the entry the same way or
    /// stores its derived result. If that evaluation fails the entry is
    /// removed again and the error returned.
    ///
    /// `options` layers over the cache's defaults.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn get_or_create(
        &self,
        key: impl Into<String>,
        build: BuildFn<C>,
        options: CacheOptions,
    ) -> Result<EntryRef> {
        self.insert(key.into(), build, options).map(|(entry, _)| entry)
    }

    /// Like [`get_or_create`](Self::get_or_create), but fails with
    /// [`CacheError::DuplicateEntry`] if `key` is live.
    pub fn create(
        &self,
        key: impl Into<String>,
        build: BuildFn<C>,
        options: CacheOptions,
    ) -> Result<EntryRef> {
        match self.insert(key.into(), build, options)? {
            (entry, true) => Ok(entry),
            (entry, false) => Err(CacheError::DuplicateEntry(entry.key)),
        }
    }

    fn insert(
        &self,
        key: String,
        build: BuildFn<C>,
        options: CacheOptions,
    ) -> Result<(EntryRef, bool)> {
        let id = {
            let mut state = self.lock();
            if let Some(&id) = state.keys.get(&key) {
                metrics::counter!(telemetry::ENTRY_HITS_TOTAL).increment(1);
                return Ok((EntryRef { id, key }, false));
            }
            let id = EntryId(self.shared.ids.next());
            let resolved = ResolvedOptions::resolve(&[&self.shared.defaults, &options]);
            state.keys.insert(key.clone(), id);
            state
                .entries
                .insert(id, Entry::new(id, key.clone(), build, resolved));
            self.arm_gc(&mut state, id);
            id
        };
        metrics::counter!(telemetry::ENTRIES_CREATED_TOTAL).increment(1);
        debug!(key = %key, "entry created");

        self.attach_external(id);
        if let Err(e) = self.recompute(id, true) {
            debug!(key = %key, error = %e, "initial evaluation failed, dropping entry");
            let flush = {
                let mut state = self.lock();
                let mut outbox = Outbox::default();
                self.remove_entry(&mut state, id, &mut outbox);
                state.seal(outbox)
            };
            self.flush(flush);
            return Err(e);
        }
        Ok((EntryRef { id, key }, true))
    }

    /// Current result of `key`.
    pub fn get(&self, key: &str) -> Result<QueryResult> {
        Ok(self.lock().entry(key)?.result.clone())
    }

    /// Current sync counter of `key`.
    pub fn sync(&self, key: &str) -> Result<u64> {
        Ok(self.lock().entry(key)?.sync)
    }

    pub(crate) fn snapshot(&self, id: EntryId) -> Option<(QueryResult, u64)> {
        let state = self.lock();
        let entry = state.entries.get(&id)?;
        Some((entry.result.clone(), entry.sync))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().keys.contains_key(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of all live entries, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Resolved options of `key`.
    pub fn options(&self, key: &str) -> Result<ResolvedOptions> {
        Ok(self.lock().entry(key)?.options.clone())
    }

    /// Keys `key` currently reads through its getter.
    pub fn dependencies(&self, key: &str) -> Result<Vec<String>> {
        let state = self.lock();
        let id = state.id_of(key)?;
        Ok(state
            .graph
            .upstreams_of(id)
            .into_iter()
            .map(|up| state.key_of(up))
            .collect())
    }

    /// Keys whose computations currently read `key`.
    pub fn dependents(&self, key: &str) -> Result<Vec<String>> {
        let state = self.lock();
        let id = state.id_of(key)?;
        Ok(state
            .graph
            .dependents_of(id)
            .into_iter()
            .map(|(down, _)| state.key_of(down))
            .collect())
    }

    /// Merge `options` into the entry's resolved options.
    ///
    /// A changed TTL re-arms the refetch timer, unless refetching was
    /// stopped for lack of observers.
    pub fn set_options(&self, key: &str, options: CacheOptions) -> Result<()> {
        let flush = {
            let mut state = self.lock();
            let entry = state.entry_mut(key)?;
            let mut outbox = Outbox::default();
            if entry.options.apply(&options) {
                debug!(key, ttl_ms = entry.options.ttl.as_millis() as u64, "ttl changed");
                if let Some(timer) = entry.timers.refetch.take() {
                    outbox.bury(timer);
                }
                if !entry.fetch_canceled {
                    self.ensure_refetch(entry, false, false, &mut outbox);
                }
            }
            state.seal(outbox)
        };
        self.flush(flush);
        Ok(())
    }

    /// Evict `key` now. Returns whether it was live.
    pub fn evict(&self, key: &str) -> bool {
        let flush = {
            let mut state = self.lock();
            let Ok(id) = state.id_of(key) else {
                return false;
            };
            let mut outbox = Outbox::default();
            self.remove_entry(&mut state, id, &mut outbox);
            state.seal(outbox)
        };
        self.flush(flush);
        true
    }

    /// Evict every entry: cancel all timers, drop dependency edges and
    /// external subscriptions, and clear the table.
    pub fn reset_all(&self) {
        let flush = {
            let mut state = self.lock();
            let mut outbox = Outbox::default();
            let count = state.entries.len();
            state.keys.clear();
            state.graph.clear();
            for (_, mut entry) in state.entries.drain() {
                entry.timers.cancel_all();
                outbox.bury(entry);
            }
            metrics::counter!(telemetry::EVICTIONS_TOTAL).increment(count as u64);
            debug!(count, "cache reset");
            state.seal(outbox)
        };
        self.flush(flush);
    }

    fn remove_entry(&self, state: &mut State<C>, id: EntryId, outbox: &mut Outbox) {
        let Some(mut entry) = state.entries.remove(&id) else {
            return;
        };
        if state.keys.get(&entry.key) == Some(&id) {
            state.keys.remove(&entry.key);
        }
        entry.timers.cancel_all();

        let detached = state.graph.remove(id);
        for up in detached.upstreams {
            if state.observers(up) == 0 {
                self.arm_gc(state, up);
            }
        }
        metrics::counter!(telemetry::EVICTIONS_TOTAL).increment(1);
        debug!(
            key = %entry.key,
            orphaned = detached.downstreams.len(),
            "entry evicted"
        );
        outbox.bury(entry);
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Register `callback` for visible writes to `key`.
    ///
    /// Cancels pending garbage collection and makes sure refetching is
    /// armed. If refetching had been stopped the entry also fetches now.
    /// Callbacks run in subscription order, never under the cache lock.
    ///
    /// # Errors
    ///
    /// [`CacheError::NoSuchEntry`] if `key` is not live.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&QueryResult) + Send + Sync + 'static,
    {
        let subscriber = SubscriberId(self.shared.ids.next());
        let (id, sync, result, flush) = {
            let mut state = self.lock();
            let entry = state.entry_mut(key)?;
            entry.timers.cancel_gc();
            entry.subscribers.insert(subscriber, Arc::new(callback));
            let mut outbox = Outbox::default();
            self.ensure_refetch(entry, false, false, &mut outbox);
            let (id, sync, result) = (entry.id, entry.sync, entry.result.clone());
            (id, sync, result, state.seal(outbox))
        };
        self.flush(flush);

        let weak = self.weak();
        Ok(Subscription::new(key.to_string(), sync, result, move || {
            if let Some(cache) = Cache::upgrade(&weak) {
                cache.unsubscribe(id, subscriber);
            }
        }))
    }

    fn unsubscribe(&self, id: EntryId, subscriber: SubscriberId) {
        let flush = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            let mut outbox = Outbox::default();
            if let Some(callback) = entry.subscribers.remove(&subscriber) {
                outbox.bury(callback);
            }
            if state.observers(id) == 0 {
                self.arm_gc(&mut state, id);
            }
            state.seal(outbox)
        };
        self.flush(flush);
    }

    /// Stream the visible results of `key`, starting with the current one.
    pub fn watch(&self, key: &str) -> Result<ResultStream> {
        let (feed, receiver) = Feed::channel();
        let subscription = {
            let feed = feed.clone();
            self.subscribe(key, move |result| feed.push(result))?
        };
        feed.seed(subscription.result());
        Ok(ResultStream::new(receiver, subscription))
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Fetch `key` now and wait for the outcome.
    ///
    /// Returns immediately if the entry is static, or if a fetch is already
    /// in flight and `force` is false.
    ///
    /// # Errors
    ///
    /// [`CacheError::NoSuchEntry`] for unknown keys and
    /// [`CacheError::Transport`] if the transport faulted. After a fault the
    /// entry stays `Loading` until the next TTL tick fetches again.
    pub async fn fetch(&self, key: &str, force: bool) -> Result<()> {
        let (ticket, flush) = {
            let mut state = self.lock();
            let entry = state.entry_mut(key)?;
            let mut outbox = Outbox::default();
            entry.begin_fetch(force, &mut outbox);
            let ticket = outbox.tickets.pop();
            (ticket, state.seal(outbox))
        };
        self.flush(flush);

        let Some(ticket) = ticket else {
            return Ok(());
        };
        let outcome = fetch::execute(&ticket).await;
        self.complete_fetch(&ticket, outcome)
    }

    /// Arm the refetch timer of `key`.
    ///
    /// An armed timer is kept unless `force`; `immediate` fetches before
    /// arming.
    pub fn refetch(&self, key: &str, force: bool, immediate: bool) -> Result<()> {
        let flush = {
            let mut state = self.lock();
            let entry = state.entry_mut(key)?;
            let mut outbox = Outbox::default();
            self.ensure_refetch(entry, force, immediate, &mut outbox);
            state.seal(outbox)
        };
        self.flush(flush);
        Ok(())
    }

    /// Clear `key` to `Stale`, notifying regardless of background fetching,
    /// and re-evaluate its build.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        let id = self.lock().id_of(key)?;
        self.invalidate_entry(id)
    }

    fn invalidate_entry(&self, id: EntryId) -> Result<()> {
        let flush = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return Ok(());
            };
            let mut outbox = Outbox::default();
            outbox.notice(entry.write(QueryResult::Stale, Notify::Always));
            state.seal(outbox)
        };
        self.flush(flush);
        self.recompute(id, true).inspect_err(|e| self.record_failure(id, e))
    }

    fn spawn_fetch(&self, ticket: FetchTicket) {
        let weak = self.weak();
        tokio::spawn(async move {
            let outcome = fetch::execute(&ticket).await;
            if let Some(cache) = Cache::upgrade(&weak)
                && let Err(e) = cache.complete_fetch(&ticket, outcome)
            {
                warn!(key = %ticket.key, error = %e, "fetch abandoned");
            }
        });
    }

    fn complete_fetch(&self, ticket: &FetchTicket, outcome: Result<QueryResult>) -> Result<()> {
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                if let Some(entry) = self.lock().entries.get_mut(&ticket.entry) {
                    entry.abandon_fetch(ticket.generation);
                }
                return Err(e);
            }
        };

        let flush = {
            let mut state = self.lock();
            let mut outbox = Outbox::default();
            let applied = state
                .entries
                .get_mut(&ticket.entry)
                .is_some_and(|entry| entry.finish_fetch(ticket.generation, result, &mut outbox));
            if !applied {
                metrics::counter!(telemetry::STALE_RESULTS_TOTAL).increment(1);
                debug!(
                    key = %ticket.key,
                    generation = ticket.generation,
                    "discarding superseded fetch result"
                );
            }
            state.seal(outbox)
        };
        self.flush(flush);
        Ok(())
    }

    /// Arm the repeating refetch timer of a dynamic entry.
    fn ensure_refetch(
        &self,
        entry: &mut Entry<C>,
        force: bool,
        immediate: bool,
        outbox: &mut Outbox,
    ) {
        if !entry.is_dynamic() {
            return;
        }
        let immediate = std::mem::take(&mut entry.fetch_canceled) || immediate;
        if entry.timers.refetch.is_some() && !force {
            return;
        }
        if immediate {
            entry.begin_fetch(false, outbox);
        }
        if let Some(old) = entry.timers.refetch.take() {
            outbox.bury(old);
        }
        if entry.options.ttl.is_zero() {
            return;
        }
        entry.timers.refetch = Some(self.refetch_timer(entry.id, entry.options.ttl));
    }

    fn refetch_timer(&self, id: EntryId, period: Duration) -> Timer {
        let token = self.shared.ids.next();
        let weak = self.weak();
        Timer::repeating(token, period, move || match Cache::upgrade(&weak) {
            Some(cache) => cache.refetch_tick(id, token),
            None => false,
        })
    }

    /// One TTL period elapsed: expire a terminal result, then fetch if
    /// nothing else has moved the entry on. Returns whether to keep ticking.
    fn refetch_tick(&self, id: EntryId, token: u64) -> bool {
        let flush = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return false;
            };
            if !entry.timers.is_refetch(token) {
                return false;
            }
            let mut outbox = Outbox::default();
            if entry.result.is_terminal() {
                outbox.notice(entry.write(QueryResult::Stale, Notify::Background));
            }
            state.seal(outbox)
        };
        self.flush(flush);

        let flush = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return false;
            };
            if !entry.timers.is_refetch(token) {
                return false;
            }
            let mut outbox = Outbox::default();
            let stuck = entry.result == QueryResult::Loading && !entry.in_flight();
            if entry.result == QueryResult::Stale || stuck {
                entry.begin_fetch(false, &mut outbox);
            }
            state.seal(outbox)
        };
        self.flush(flush);
        true
    }

    // ========================================================================
    // Garbage collection
    // ========================================================================

    /// Arm whichever garbage-collection timers are not armed yet.
    fn arm_gc(&self, state: &mut State<C>, id: EntryId) {
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        if entry.timers.stop_refetch.is_none() {
            let delay = entry.options.stop_refetch_delay;
            entry.timers.stop_refetch = Some(self.gc_timer(id, delay, GcStage::StopRefetch));
        }
        if entry.timers.evict.is_none() {
            let delay = entry.options.evict_delay;
            entry.timers.evict = Some(self.gc_timer(id, delay, GcStage::Evict));
        }
    }

    fn gc_timer(&self, id: EntryId, delay: Duration, stage: GcStage) -> Timer {
        let token = self.shared.ids.next();
        let weak = self.weak();
        Timer::once(token, delay, move || {
            if let Some(cache) = Cache::upgrade(&weak) {
                cache.collect(id, token, stage);
            }
        })
    }

    fn collect(&self, id: EntryId, token: u64, stage: GcStage) {
        let flush = {
            let mut state = self.lock();
            let observers = state.observers(id);
            let mut outbox = Outbox::default();
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            match stage {
                GcStage::StopRefetch => {
                    if !entry.timers.is_stop_refetch(token) {
                        return;
                    }
                    outbox.bury(entry.timers.stop_refetch.take());
                    if observers == 0 {
                        outbox.bury(entry.timers.refetch.take());
                        entry.fetch_canceled = true;
                        debug!(key = %entry.key, "refetching stopped, no observers");
                    }
                }
                GcStage::Evict => {
                    if !entry.timers.is_evict(token) {
                        return;
                    }
                    if observers == 0 {
                        self.remove_entry(&mut state, id, &mut outbox);
                    } else {
                        outbox.bury(entry.timers.evict.take());
                    }
                }
            }
            state.seal(outbox)
        };
        self.flush(flush);
    }

    // ========================================================================
    // Re-evaluation
    // ========================================================================

    /// Evaluate the entry's build and install the outcome.
    ///
    /// With `fetch`, a request outcome is fetched right away (unless
    /// refetching was stopped for lack of observers); without, the new
    /// request is only recorded.
    fn recompute(&self, id: EntryId, fetch: bool) -> Result<()> {
        let (build, key) = {
            let state = self.lock();
            match state.entries.get(&id) {
                Some(entry) => (entry.build.clone(), entry.key.clone()),
                None => return Ok(()),
            }
        };
        metrics::counter!(telemetry::RECOMPUTES_TOTAL).increment(1);
        debug!(key = %key, fetch, "evaluating build");

        let (resolved, edges) = match build(&self.shared.client) {
            Build::Request(request) => (Resolved::Request(request), Vec::new()),
            Build::Dependent(compute) => {
                let getter = Getter::new(self, &key);
                let resolved = compute(&getter, &key)?;
                (resolved, getter.into_edges())
            }
        };

        let (flush, moved) = {
            let mut state = self.lock();
            if !state.entries.contains_key(&id) {
                return Ok(());
            }
            let change = match state.graph.replace_dependencies(id, edges.clone()) {
                Ok(change) => change,
                Err(cycle) => {
                    let upstream = state.key_of(cycle.upstream);
                    return Err(CacheError::CyclicDependency { key, upstream });
                }
            };
            // A new dependent observes its upstream like a subscriber does.
            let mut outbox = Outbox::default();
            for up in &change.added {
                if let Some(upstream) = state.entries.get_mut(up) {
                    upstream.timers.cancel_gc();
                    self.ensure_refetch(upstream, false, false, &mut outbox);
                }
            }
            for up in &change.removed {
                if state.observers(*up) == 0 {
                    self.arm_gc(&mut state, *up);
                }
            }

            // Upstreams written between our read and the edge install.
            let moved: Vec<(RecalculatePredicate, QueryResult)> = edges
                .iter()
                .filter_map(|edge| {
                    let upstream = state.entries.get(&edge.upstream)?;
                    (upstream.sync != edge.seen_sync)
                        .then(|| (edge.predicate.clone(), upstream.result.clone()))
                })
                .collect();

            let Some(entry) = state.entries.get_mut(&id) else {
                return Ok(());
            };
            match resolved {
                Resolved::Request(request) => {
                    let in_flight = match &entry.kind {
                        EntryKind::Dynamic { in_flight, .. } => *in_flight,
                        EntryKind::Static => None,
                    };
                    entry.kind = EntryKind::Dynamic { request, in_flight };
                    if fetch && !entry.fetch_canceled {
                        entry.begin_fetch(true, &mut outbox);
                        self.ensure_refetch(entry, false, false, &mut outbox);
                    }
                }
                Resolved::Value(result) => {
                    entry.kind = EntryKind::Static;
                    outbox.bury(entry.timers.refetch.take());
                    outbox.notice(entry.write(result, Notify::Always));
                }
            }
            (state.seal(outbox), moved)
        };
        self.flush(flush);

        if moved.iter().any(|(predicate, result)| predicate(result)) {
            debug!(key = %key, "upstream moved during evaluation, re-evaluating");
            return self.recompute(id, fetch);
        }
        Ok(())
    }

    /// Re-evaluate a dependent after an upstream write.
    fn propagate(&self, id: EntryId) {
        if let Err(e) = self.recompute(id, true) {
            self.record_failure(id, &e);
        }
    }

    /// Store a failed re-evaluation as the entry's result.
    fn record_failure(&self, id: EntryId, err: &CacheError) {
        let flush = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(&id) else {
                return;
            };
            error!(key = %entry.key, error = %err, "re-evaluation failed");
            let failure = QueryResult::failure(json!({ "message": err.to_string() }));
            let mut outbox = Outbox::default();
            outbox.notice(entry.write(failure, Notify::Always));
            state.seal(outbox)
        };
        self.flush(flush);
    }

    // ========================================================================
    // External events
    // ========================================================================

    fn attach_external(&self, id: EntryId) {
        let Some(source) = &self.shared.events else {
            return;
        };
        let weak = self.weak();
        let subscription = source.on_event(Arc::new(move |event: &ExternalEvent| {
            if let Some(cache) = Cache::upgrade(&weak) {
                cache.handle_event(id, event);
            }
        }));
        let leftover = {
            let mut state = self.lock();
            match state.entries.get_mut(&id) {
                Some(entry) => entry.external.replace(subscription),
                None => Some(subscription),
            }
        };
        drop(leftover);
    }

    fn handle_event(&self, id: EntryId, event: &ExternalEvent) {
        let policy = match self.lock().entries.get(&id) {
            Some(entry) => entry.options.invalidation.clone(),
            None => return,
        };
        if policy.should_invalidate(event) {
            metrics::counter!(telemetry::EXTERNAL_EVENTS_TOTAL, "decision" => "invalidate")
                .increment(1);
            debug!(kind = %event.kind, "external event invalidates entry");
            // Failures are already recorded on the entry.
            let _ = self.invalidate_entry(id);
        } else {
            metrics::counter!(telemetry::EXTERNAL_EVENTS_TOTAL, "decision" => "recompute")
                .increment(1);
            debug!(kind = %event.kind, "external event recomputes entry silently");
            if let Err(e) = self.recompute(id, false) {
                self.record_failure(id, &e);
            }
        }
    }

    /// Run everything collected under the lock.
    fn flush(&self, flush: Flush) {
        if flush.is_empty() {
            return;
        }
        let Flush {
            deliveries,
            tickets,
            graveyard,
        } = flush;
        drop(graveyard);
        for delivery in deliveries {
            for downstream in delivery.notify() {
                self.propagate(downstream);
            }
        }
        for ticket in tickets {
            self.spawn_fetch(ticket);
        }
    }
}

impl<C> fmt::Debug for Cache<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len();
        f.debug_struct("Cache")
            .field("entries", &entries)
            .field("defaults", &self.shared.defaults)
            .finish_non_exhaustive()
    }
}
