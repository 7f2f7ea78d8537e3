//! Operation definitions.
//!
//! A [`Query`] pairs a process-unique [`OperationId`] with a build closure
//! and per-operation default options. Calling it with arguments yields the
//! entry key and a [`BuildFn`] the cache can re-evaluate at any time.
//!
//! A build either names a request right away or is a dependent computation
//! that reads other entries through a [`Getter`] first:
//!
//! ```rust
//! # use huginn::{Query, Resolved, QueryResult, request_fn, Response};
//! # use serde_json::json;
//! struct Client;
//!
//! let user: Query<Client, u32> = Query::new(|_client, id| {
//!     let id = *id;
//!     request_fn(move || async move { Ok(Response::success(json!({"id": id, "team": 7}))) })
//! });
//!
//! let team = {
//!     let user = user.clone();
//!     Query::<Client, u32>::dependent(move |get, id| {
//!         let user = get.get(&user, id)?;
//!         Ok(match user.data().and_then(|u| u.get("team")).cloned() {
//!             Some(team) => Resolved::Request(request_fn(move || {
//!                 let team = team.clone();
//!                 async move { Ok(Response::success(json!({"team": team}))) }
//!             })),
//!             None => Resolved::Value(QueryResult::Loading),
//!         })
//!     })
//! };
//! # let _ = team;
//! ```

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::cache::Getter;
use crate::hash::KeyHasher;
use crate::key::OperationId;
use crate::types::{CacheOptions, QueryResult, Request};
use crate::Result;

/// Evaluated form of a build: a request, or a computation over other entries.
pub enum Build<C> {
    Request(Arc<dyn Request>),
    Dependent(DependentFn<C>),
}

/// What a dependent computation currently resolves to.
pub enum Resolved {
    /// Fetch this request; the entry becomes dynamic.
    Request(Arc<dyn Request>),
    /// Store this result directly; the entry stays static.
    Value(QueryResult),
}

/// Build closure bound to its arguments.
pub type BuildFn<C> = Arc<dyn Fn(&C) -> Build<C> + Send + Sync>;

/// A dependent computation. Receives a getter and the entry's own key.
pub type DependentFn<C> = Arc<dyn Fn(&Getter<'_, C>, &str) -> Result<Resolved> + Send + Sync>;

type QueryBuild<C, A> = Arc<dyn Fn(&C, &A) -> Build<C> + Send + Sync>;

/// A read operation over client `C` with arguments `A`.
pub struct Query<C, A> {
    id: OperationId,
    build: QueryBuild<C, A>,
    options: CacheOptions,
}

impl<C, A> Query<C, A>
where
    C: 'static,
    A: 'static,
{
    /// A query whose build always produces a request.
    pub fn new<F>(request: F) -> Self
    where
        F: Fn(&C, &A) -> Arc<dyn Request> + Send + Sync + 'static,
    {
        Self::from_build(move |client, args| Build::Request(request(client, args)))
    }

    /// A query whose build reads other entries before deciding.
    pub fn dependent<F>(compute: F) -> Self
    where
        F: Fn(&Getter<'_, C>, &A) -> Result<Resolved> + Send + Sync + 'static,
        A: Clone + Send + Sync,
    {
        let compute = Arc::new(compute);
        Self::from_build(move |_client, args: &A| {
            let compute = compute.clone();
            let args = args.clone();
            Build::Dependent(Arc::new(move |get: &Getter<'_, C>, _key: &str| {
                compute(get, &args)
            }))
        })
    }

    /// A query from a raw build closure.
    pub fn from_build<F>(build: F) -> Self
    where
        F: Fn(&C, &A) -> Build<C> + Send + Sync + 'static,
    {
        Self {
            id: OperationId::next(),
            build: Arc::new(build),
            options: CacheOptions::default(),
        }
    }

    /// Set per-operation default options.
    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Key of the entry this query uses for `args`.
    pub fn key(&self, hasher: &KeyHasher, args: &A) -> Result<String>
    where
        A: Serialize,
    {
        hasher.compute_key(self.id, args)
    }

    /// Capture `args` into a re-evaluable build closure.
    pub fn bind(&self, args: &A) -> BuildFn<C>
    where
        A: Clone + Send + Sync,
    {
        let build = self.build.clone();
        let args = args.clone();
        Arc::new(move |client| build(client, &args))
    }
}

impl<C, A> Clone for Query<C, A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            build: self.build.clone(),
            options: self.options.clone(),
        }
    }
}

impl<C, A> fmt::Debug for Query<C, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
