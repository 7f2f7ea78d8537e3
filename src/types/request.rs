//! The transport boundary.
//!
//! The cache never talks to a network itself. Binding code hands it request
//! descriptors implementing [`Request`]; the fetch executor awaits
//! [`Request::send`] and interprets the [`Response`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::response::Response;
use crate::Result;

/// An opaque, re-sendable read or write against the remote store.
///
/// `send` may be called more than once for the same descriptor (retries,
/// TTL refetches). Return `Ok(Response::Failure)` for application-level
/// failures and `Err(CacheError::Transport)` only when the transport itself
/// broke.
#[async_trait]
pub trait Request: Send + Sync {
    async fn send(&self) -> Result<Response>;
}

/// Request backed by an async closure.
pub struct FnRequest<F> {
    send: F,
}

#[async_trait]
impl<F, Fut> Request for FnRequest<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response>> + Send,
{
    async fn send(&self) -> Result<Response> {
        (self.send)().await
    }
}

/// Wrap an async closure as a shareable request descriptor.
///
/// ```rust
/// # use huginn::{request_fn, Response};
/// let request = request_fn(|| async { Ok(Response::success(serde_json::json!(["x"]))) });
/// ```
pub fn request_fn<F, Fut>(send: F) -> Arc<dyn Request>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(FnRequest { send })
}
