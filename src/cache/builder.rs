//! Builder for configuring cache instances

use std::sync::{Arc, Mutex};

use super::{Cache, Shared, State};
use crate::events::EventSource;
use crate::hash::KeyHasher;
use crate::key::IdSource;
use crate::types::CacheOptions;

/// Builder for configuring cache instances.
///
/// ```rust
/// # use huginn::{Cache, CacheOptions, EventHub};
/// # use std::time::Duration;
/// let hub = EventHub::new();
/// let cache = Cache::builder(())
///     .defaults(CacheOptions::new().ttl(Duration::from_secs(60)))
///     .event_source(hub.clone())
///     .build();
/// # let _ = cache;
/// ```
pub struct CacheBuilder<C> {
    client: C,
    defaults: CacheOptions,
    events: Option<Arc<dyn EventSource>>,
    hasher: KeyHasher,
}

impl<C> CacheBuilder<C>
where
    C: Send + Sync + 'static,
{
    pub fn new(client: C) -> Self {
        Self {
            client,
            defaults: CacheOptions::default(),
            events: None,
            hasher: KeyHasher::default(),
        }
    }

    /// Ambient defaults, layered over the built-in defaults and under
    /// per-operation options.
    pub fn defaults(mut self, defaults: CacheOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Source of external invalidation events. Every entry registers with it.
    pub fn event_source(mut self, source: impl EventSource + 'static) -> Self {
        self.events = Some(Arc::new(source));
        self
    }

    /// Share a key hasher (and its installed hash function).
    pub fn hasher(mut self, hasher: KeyHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn build(self) -> Cache<C> {
        Cache {
            shared: Arc::new(Shared {
                client: self.client,
                hasher: self.hasher,
                defaults: self.defaults,
                events: self.events,
                state: Mutex::new(State::default()),
                ids: IdSource::default(),
            }),
        }
    }
}
