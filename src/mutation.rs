//! Write operations.
//!
//! The mutation registry mirrors the entry registry for writes: one entry
//! per (mutation, bind-time arguments) key, holding a result and a set of
//! subscribers. There is no TTL, no refetch and no garbage collection. Each
//! trigger performs its write exactly once (writes are not assumed to be
//! idempotent, so failures are not retried) and concurrent triggers are not
//! deduplicated: the last write to complete wins.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::Subscription;
use crate::hash::KeyHasher;
use crate::key::{IdSource, OperationId, SubscriberId};
use crate::telemetry;
use crate::types::{MutationOptions, QueryResult, Request};
use crate::{CacheError, Result};

type Callback = Arc<dyn Fn(&QueryResult) + Send + Sync>;

/// Write builder bound to its bind-time arguments.
pub type WriteFn<C, S> = Arc<dyn Fn(&C, &S) -> Arc<dyn Request> + Send + Sync>;

type MutationWrite<C, A, S> = Arc<dyn Fn(&C, &A, &S) -> Arc<dyn Request> + Send + Sync>;

/// A write operation over client `C`, bound with `A` and triggered with `S`.
///
/// ```rust
/// # use huginn::{Mutation, MutationOptions, request_fn, Response};
/// # use serde_json::json;
/// let rename: Mutation<(), u32, String> = Mutation::new(|_client, id, name| {
///     let body = json!({"id": *id, "name": name});
///     request_fn(move || {
///         let body = body.clone();
///         async move { Ok(Response::success(body)) }
///     })
/// })
/// .with_options(MutationOptions::new().background_fetch(false));
/// # let _ = rename;
/// ```
pub struct Mutation<C, A, S> {
    id: OperationId,
    write: MutationWrite<C, A, S>,
    options: MutationOptions,
}

impl<C, A, S> Mutation<C, A, S>
where
    C: 'static,
    A: 'static,
    S: 'static,
{
    pub fn new<F>(write: F) -> Self
    where
        F: Fn(&C, &A, &S) -> Arc<dyn Request> + Send + Sync + 'static,
    {
        Self {
            id: OperationId::next(),
            write: Arc::new(write),
            options: MutationOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MutationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn options(&self) -> MutationOptions {
        self.options
    }

    /// Key of the mutation entry for `bind_args`.
    pub fn key(&self, hasher: &KeyHasher, bind_args: &A) -> Result<String>
    where
        A: Serialize,
    {
        hasher.compute_key(self.id, bind_args)
    }
}

impl<C, A, S> Clone for Mutation<C, A, S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            write: self.write.clone(),
            options: self.options,
        }
    }
}

impl<C, A, S> fmt::Debug for Mutation<C, A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

struct MutationEntry {
    result: QueryResult,
    sync: u64,
    subscribers: BTreeMap<SubscriberId, Callback>,
    background_fetch: bool,
    /// A `WriteFn<C, S>`; the set-argument type is only known to handles.
    write: Arc<dyn Any + Send + Sync>,
}

struct MutationShared<C> {
    client: C,
    hasher: KeyHasher,
    entries: Mutex<HashMap<String, MutationEntry>>,
    ids: IdSource,
}

/// Registry of mutation entries.
///
/// Cheap to clone; clones share the same entries.
pub struct MutationCache<C> {
    shared: Arc<MutationShared<C>>,
}

impl<C> Clone for MutationCache<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C> MutationCache<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(client: C) -> Self {
        Self::with_hasher(client, KeyHasher::default())
    }

    /// A registry deriving keys with `hasher`.
    pub fn with_hasher(client: C, hasher: KeyHasher) -> Self {
        Self {
            shared: Arc::new(MutationShared {
                client,
                hasher,
                entries: Mutex::new(HashMap::new()),
                ids: IdSource::default(),
            }),
        }
    }

    pub fn client(&self) -> &C {
        &self.shared.client
    }

    pub fn hasher(&self) -> &KeyHasher {
        &self.shared.hasher
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MutationEntry>> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle for `mutation` bound to `bind_args`, creating its entry if
    /// needed.
    pub fn mutation<A, S>(
        &self,
        mutation: &Mutation<C, A, S>,
        bind_args: &A,
    ) -> Result<MutationHandle<C, S>>
    where
        A: Serialize + Clone + Send + Sync + 'static,
        S: Send + 'static,
    {
        let key = mutation.key(&self.shared.hasher, bind_args)?;
        let write = mutation.write.clone();
        let bind_args = bind_args.clone();
        let bound: WriteFn<C, S> =
            Arc::new(move |client: &C, set_args: &S| write(client, &bind_args, set_args));
        self.get_or_create(key, bound, mutation.options)
    }

    /// Handle for the entry at `key`, creating it with `write` if absent.
    ///
    /// An existing entry keeps its own write builder and options.
    ///
    /// # Errors
    ///
    /// [`CacheError::TypeMismatch`] if the existing entry was created with a
    /// different set-argument type.
    pub fn get_or_create<S>(
        &self,
        key: impl Into<String>,
        write: WriteFn<C, S>,
        options: MutationOptions,
    ) -> Result<MutationHandle<C, S>>
    where
        S: Send + 'static,
    {
        let key = key.into();
        let mut entries = self.lock();
        let stored = entries.entry(key.clone()).or_insert_with(|| {
            debug!(key = %key, "mutation entry created");
            MutationEntry {
                result: QueryResult::Stale,
                sync: 0,
                subscribers: BTreeMap::new(),
                background_fetch: options.background_fetch,
                write: Arc::new(write),
            }
        });
        let write = stored
            .write
            .downcast_ref::<WriteFn<C, S>>()
            .cloned()
            .ok_or_else(|| CacheError::TypeMismatch(key.clone()))?;
        drop(entries);
        Ok(MutationHandle {
            cache: self.clone(),
            key,
            write,
        })
    }

    /// Current result of the mutation at `key`.
    pub fn get(&self, key: &str) -> Result<QueryResult> {
        self.lock()
            .get(key)
            .map(|entry| entry.result.clone())
            .ok_or_else(|| CacheError::NoSuchEntry(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register `callback` for visible writes to `key`.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&QueryResult) + Send + Sync + 'static,
    {
        let subscriber = SubscriberId(self.shared.ids.next());
        let (sync, result) = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(key)
                .ok_or_else(|| CacheError::NoSuchEntry(key.to_string()))?;
            entry.subscribers.insert(subscriber, Arc::new(callback));
            (entry.sync, entry.result.clone())
        };

        let weak: Weak<MutationShared<C>> = Arc::downgrade(&self.shared);
        let owned = key.to_string();
        Ok(Subscription::new(key.to_string(), sync, result, move || {
            if let Some(shared) = weak.upgrade() {
                let removed = shared
                    .entries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_mut(&owned)
                    .and_then(|entry| entry.subscribers.remove(&subscriber));
                drop(removed);
            }
        }))
    }

    /// Drop the entry at `key`. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.lock().remove(key);
        removed.is_some()
    }

    /// Drop every mutation entry.
    pub fn clear(&self) {
        let drained: Vec<MutationEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        debug!(count = drained.len(), "mutation cache cleared");
        drop(drained);
    }

    /// Store `next` and notify per the entry's background rule.
    ///
    /// Returns `false` if the entry no longer exists.
    fn write(&self, key: &str, next: QueryResult) -> bool {
        let callbacks: Vec<Callback> = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(key) else {
                return false;
            };
            entry.result = next.clone();
            entry.sync += 1;
            if entry.background_fetch && !next.is_terminal() {
                return true;
            }
            entry.subscribers.values().cloned().collect()
        };
        for callback in &callbacks {
            callback(&next);
        }
        true
    }

    /// Send a write request once and store its outcome.
    async fn perform(&self, key: &str, request: Arc<dyn Request>) -> Result<QueryResult> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                metrics::counter!(telemetry::TRANSPORT_FAULTS_TOTAL).increment(1);
                return Err(e);
            }
        };
        let result = response.into_result();
        let status = result.status();
        metrics::counter!(telemetry::MUTATIONS_TOTAL, "status" => status.as_str()).increment(1);
        debug!(key, %status, "mutation finished");
        if !self.write(key, result.clone()) {
            debug!(key, "mutation entry removed before the write finished");
        }
        Ok(result)
    }
}

impl<C> fmt::Debug for MutationCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("MutationCache")
            .field("entries", &entries)
            .finish_non_exhaustive()
    }
}

/// Typed trigger for one mutation entry.
pub struct MutationHandle<C, S> {
    cache: MutationCache<C>,
    key: String,
    write: WriteFn<C, S>,
}

impl<C, S> MutationHandle<C, S>
where
    C: Send + Sync + 'static,
    S: Send + 'static,
{
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current result of the entry.
    pub fn result(&self) -> Result<QueryResult> {
        self.cache.get(&self.key)
    }

    /// Start the write in the background.
    ///
    /// The entry moves to `Stale` then `Loading` before this returns. A
    /// transport fault is logged and leaves the entry `Loading`.
    ///
    /// # Panics
    ///
    /// Requires a tokio runtime context.
    pub fn trigger(&self, set_args: S) {
        let request = match self.start(&set_args) {
            Ok(request) => request,
            Err(e) => {
                warn!(key = %self.key, error = %e, "mutation not started");
                return;
            }
        };
        let cache = self.cache.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.perform(&key, request).await {
                warn!(key = %key, error = %e, "mutation abandoned");
            }
        });
    }

    /// Perform the write and wait for its outcome.
    ///
    /// # Errors
    ///
    /// [`CacheError::NoSuchEntry`] if the entry was removed and
    /// [`CacheError::Transport`] if the transport faulted.
    pub async fn run(&self, set_args: S) -> Result<QueryResult> {
        let request = self.start(&set_args)?;
        drop(set_args);
        self.cache.perform(&self.key, request).await
    }

    fn start(&self, set_args: &S) -> Result<Arc<dyn Request>> {
        if !self.cache.write(&self.key, QueryResult::Stale) {
            return Err(CacheError::NoSuchEntry(self.key.clone()));
        }
        self.cache.write(&self.key, QueryResult::Loading);
        Ok((self.write)(self.cache.client(), set_args))
    }
}

impl<C, S> Clone for MutationHandle<C, S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            key: self.key.clone(),
            write: self.write.clone(),
        }
    }
}

impl<C, S> fmt::Debug for MutationHandle<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}
