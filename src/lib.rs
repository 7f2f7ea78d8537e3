//! Huginn - keyed, self-refreshing data-fetching cache
//!
//! Huginn keeps one entry per (operation, arguments) key. Each entry fetches
//! its result through a binding-supplied [`Request`], retries application
//! failures, refetches on a TTL, notifies subscribers and is garbage
//! collected once nobody observes it. Entries may also be computed from
//! other entries, in which case they are re-evaluated whenever an upstream
//! reaches a new result.
//!
//! # Example
//!
//! ```rust,no_run
//! use huginn::{Cache, CacheOptions, Query, Response, request_fn};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! struct Client;
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let cache = Cache::builder(Client)
//!         .defaults(CacheOptions::new().ttl(Duration::from_secs(60)))
//!         .build();
//!
//!     let todos: Query<Client, String> = Query::new(|_client, owner: &String| {
//!         let owner = owner.clone();
//!         request_fn(move || {
//!             let owner = owner.clone();
//!             async move { Ok(Response::success(json!([{"owner": owner, "title": "x"}]))) }
//!         })
//!     });
//!
//!     let entry = cache.query(&todos, &"ada".to_string(), CacheOptions::default())?;
//!     let subscription = cache.subscribe(&entry.key, |result| {
//!         println!("todos: {:?}", result.data());
//!     })?;
//!
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     subscription.unsubscribe();
//!     Ok(())
//! }
//! ```
//!
//! # Mutations
//!
//! Writes go through a [`MutationCache`]: one entry per (mutation, bind-time
//! arguments), triggered with set-time arguments, performed once.

pub mod cache;
#[cfg(feature = "config")]
pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod key;
pub mod mutation;
pub mod query;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use cache::{
    Cache, CacheBuilder, EntryRef, Getter, GetterOptions, RecalculatePredicate, ResultStream,
    Subscription,
};
pub use error::{CacheError, Result};
pub use events::{EventHandler, EventHub, EventSource, EventSubscription, ExternalEvent};
pub use hash::{HashFn, KeyHasher, Opaque, stable_stringify};
pub use key::{EntryId, OperationId, SubscriberId};
pub use mutation::{Mutation, MutationCache, MutationHandle, WriteFn};
pub use query::{Build, BuildFn, DependentFn, Query, Resolved};

#[cfg(feature = "config")]
pub use config::Config;

// Re-export all types
pub use types::{
    CacheOptions, DEFAULT_EVICT_DELAY, DEFAULT_RETRY_LIMIT, DEFAULT_STOP_REFETCH_DELAY,
    DEFAULT_TTL, FnRequest, InvalidationPolicy, InvalidationPredicate, MutationOptions,
    QueryResult, QueryStatus, Request, ResolvedOptions, Response, ResponseMeta, ShouldNotify,
    request_fn,
};
