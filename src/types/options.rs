//! Entry options and their precedence resolution

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::response::QueryResult;
use crate::events::ExternalEvent;

/// Default refetch period: 3 minutes.
pub const DEFAULT_TTL: Duration = Duration::from_millis(180_000);
/// Default number of extra attempts after the first failed one.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
/// Default delay before an unobserved entry stops refetching: 3 minutes.
pub const DEFAULT_STOP_REFETCH_DELAY: Duration = Duration::from_millis(180_000);
/// Default delay before an unobserved entry is evicted: 30 minutes.
pub const DEFAULT_EVICT_DELAY: Duration = Duration::from_millis(1_800_000);

/// Decides whether subscribers hear about a `curr -> next` change.
pub type ShouldNotify = Arc<dyn Fn(&QueryResult, &QueryResult) -> bool + Send + Sync>;

/// Decides whether an external event invalidates an entry.
pub type InvalidationPredicate = Arc<dyn Fn(&ExternalEvent) -> bool + Send + Sync>;

/// Per-entry reaction to external events.
///
/// Invalidating clears the visible result to `Stale` and re-evaluates the
/// build (refetching dynamic entries). Not invalidating still re-evaluates
/// the build, silently, keeping the visible result.
#[derive(Clone, Default)]
pub enum InvalidationPolicy {
    #[default]
    Always,
    Never,
    If(InvalidationPredicate),
}

impl InvalidationPolicy {
    /// Invalidate only when `predicate` returns true for the event.
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&ExternalEvent) -> bool + Send + Sync + 'static,
    {
        InvalidationPolicy::If(Arc::new(predicate))
    }

    pub fn should_invalidate(&self, event: &ExternalEvent) -> bool {
        match self {
            InvalidationPolicy::Always => true,
            InvalidationPolicy::Never => false,
            InvalidationPolicy::If(predicate) => predicate(event),
        }
    }
}

impl fmt::Debug for InvalidationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationPolicy::Always => f.write_str("Always"),
            InvalidationPolicy::Never => f.write_str("Never"),
            InvalidationPolicy::If(_) => f.write_str("If(<predicate>)"),
        }
    }
}

impl From<bool> for InvalidationPolicy {
    fn from(invalidate: bool) -> Self {
        if invalidate {
            InvalidationPolicy::Always
        } else {
            InvalidationPolicy::Never
        }
    }
}

/// A partial set of entry options.
///
/// Used at every precedence level: ambient cache defaults, per-operation
/// defaults and per-call overrides. Unset fields fall through to the next
/// lower level, down to the built-in defaults.
///
/// ```rust
/// # use huginn::CacheOptions;
/// # use std::time::Duration;
/// let options = CacheOptions::new()
///     .ttl(Duration::from_secs(30))
///     .retry_limit(0)
///     .background_fetch(false);
/// ```
#[derive(Clone, Default)]
pub struct CacheOptions {
    pub ttl: Option<Duration>,
    pub background_fetch: Option<bool>,
    pub retry_limit: Option<u32>,
    pub stop_refetch_delay: Option<Duration>,
    pub evict_delay: Option<Duration>,
    pub should_notify: Option<ShouldNotify>,
    pub invalidation: Option<InvalidationPolicy>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the refetch period.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Hide `Stale`/`Loading` churn of refetches from subscribers.
    pub fn background_fetch(mut self, enabled: bool) -> Self {
        self.background_fetch = Some(enabled);
        self
    }

    /// Set the number of extra attempts after a failed one. 0 = no retry.
    pub fn retry_limit(mut self, n: u32) -> Self {
        self.retry_limit = Some(n);
        self
    }

    /// Set how long an unobserved entry keeps refetching.
    pub fn stop_refetch_delay(mut self, delay: Duration) -> Self {
        self.stop_refetch_delay = Some(delay);
        self
    }

    /// Set how long an unobserved entry stays in the registry.
    pub fn evict_delay(mut self, delay: Duration) -> Self {
        self.evict_delay = Some(delay);
        self
    }

    pub fn should_notify<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&QueryResult, &QueryResult) -> bool + Send + Sync + 'static,
    {
        self.should_notify = Some(Arc::new(predicate));
        self
    }

    pub fn invalidation(mut self, policy: impl Into<InvalidationPolicy>) -> Self {
        self.invalidation = Some(policy.into());
        self
    }

    /// Overlay `higher` on top of `self`; fields set in `higher` win.
    pub fn merge(&self, higher: &CacheOptions) -> CacheOptions {
        CacheOptions {
            ttl: higher.ttl.or(self.ttl),
            background_fetch: higher.background_fetch.or(self.background_fetch),
            retry_limit: higher.retry_limit.or(self.retry_limit),
            stop_refetch_delay: higher.stop_refetch_delay.or(self.stop_refetch_delay),
            evict_delay: higher.evict_delay.or(self.evict_delay),
            should_notify: higher
                .should_notify
                .clone()
                .or_else(|| self.should_notify.clone()),
            invalidation: higher
                .invalidation
                .clone()
                .or_else(|| self.invalidation.clone()),
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("ttl", &self.ttl)
            .field("background_fetch", &self.background_fetch)
            .field("retry_limit", &self.retry_limit)
            .field("stop_refetch_delay", &self.stop_refetch_delay)
            .field("evict_delay", &self.evict_delay)
            .field("should_notify", &self.should_notify.as_ref().map(|_| "<fn>"))
            .field("invalidation", &self.invalidation)
            .finish()
    }
}

/// Fully resolved options of one entry.
#[derive(Clone)]
pub struct ResolvedOptions {
    pub ttl: Duration,
    pub background_fetch: bool,
    pub retry_limit: u32,
    pub stop_refetch_delay: Duration,
    pub evict_delay: Duration,
    pub should_notify: ShouldNotify,
    pub invalidation: InvalidationPolicy,
}

impl Default for ResolvedOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            background_fetch: true,
            retry_limit: DEFAULT_RETRY_LIMIT,
            stop_refetch_delay: DEFAULT_STOP_REFETCH_DELAY,
            evict_delay: DEFAULT_EVICT_DELAY,
            should_notify: Arc::new(|_, _| true),
            invalidation: InvalidationPolicy::Always,
        }
    }
}

impl ResolvedOptions {
    /// Resolve layers given lowest precedence first over the built-in defaults.
    pub fn resolve(layers: &[&CacheOptions]) -> Self {
        let mut resolved = Self::default();
        for layer in layers {
            resolved.apply(layer);
        }
        resolved
    }

    /// Merge a partial update in place. Returns `true` if the TTL changed.
    pub fn apply(&mut self, partial: &CacheOptions) -> bool {
        let old_ttl = self.ttl;
        if let Some(ttl) = partial.ttl {
            self.ttl = ttl;
        }
        if let Some(background_fetch) = partial.background_fetch {
            self.background_fetch = background_fetch;
        }
        if let Some(retry_limit) = partial.retry_limit {
            self.retry_limit = retry_limit;
        }
        if let Some(delay) = partial.stop_refetch_delay {
            self.stop_refetch_delay = delay;
        }
        if let Some(delay) = partial.evict_delay {
            self.evict_delay = delay;
        }
        if let Some(should_notify) = &partial.should_notify {
            self.should_notify = should_notify.clone();
        }
        if let Some(invalidation) = &partial.invalidation {
            self.invalidation = invalidation.clone();
        }
        self.ttl != old_ttl
    }
}

impl fmt::Debug for ResolvedOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedOptions")
            .field("ttl", &self.ttl)
            .field("background_fetch", &self.background_fetch)
            .field("retry_limit", &self.retry_limit)
            .field("stop_refetch_delay", &self.stop_refetch_delay)
            .field("evict_delay", &self.evict_delay)
            .field("invalidation", &self.invalidation)
            .finish_non_exhaustive()
    }
}

/// Options of a mutation entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct MutationOptions {
    /// Hide `Stale`/`Loading` transitions of a write from subscribers.
    /// Default: false.
    pub background_fetch: bool,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn background_fetch(mut self, enabled: bool) -> Self {
        self.background_fetch = enabled;
        self
    }
}
