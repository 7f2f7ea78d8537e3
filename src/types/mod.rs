//! Public types for the Huginn API.

mod options;
mod request;
mod response;

pub use options::{
    CacheOptions, DEFAULT_EVICT_DELAY, DEFAULT_RETRY_LIMIT, DEFAULT_STOP_REFETCH_DELAY,
    DEFAULT_TTL, InvalidationPolicy, InvalidationPredicate, MutationOptions, ResolvedOptions,
    ShouldNotify,
};
pub use request::{FnRequest, Request, request_fn};
pub use response::{QueryResult, QueryStatus, Response, ResponseMeta};
