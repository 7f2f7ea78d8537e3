//! Reads of upstream entries from inside a dependent computation.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::graph::Edge;
use super::Cache;
use crate::query::Query;
use crate::types::{CacheOptions, QueryResult};
use crate::{CacheError, Result};

/// Decides whether an upstream's new result re-runs the dependent.
pub type RecalculatePredicate = Arc<dyn Fn(&QueryResult) -> bool + Send + Sync>;

/// Options of one getter read.
#[derive(Clone)]
pub struct GetterOptions {
    pub should_recalculate: RecalculatePredicate,
}

impl Default for GetterOptions {
    /// Recalculate only when the upstream reaches `Success` or `Error`.
    fn default() -> Self {
        Self {
            should_recalculate: Arc::new(QueryResult::is_terminal),
        }
    }
}

impl GetterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_recalculate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&QueryResult) -> bool + Send + Sync + 'static,
    {
        self.should_recalculate = Arc::new(predicate);
        self
    }
}

impl fmt::Debug for GetterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetterOptions").finish_non_exhaustive()
    }
}

/// Handed to a dependent computation for the duration of one evaluation.
///
/// Every [`get`](Getter::get) creates the upstream entry if needed (which
/// starts it fetching), records a dependency edge and returns the upstream's
/// current result without waiting. The recorded edges replace the entry's
/// previous edges once the evaluation returns.
pub struct Getter<'a, C> {
    cache: &'a Cache<C>,
    key: &'a str,
    edges: RefCell<Vec<Edge>>,
}

impl<'a, C> Getter<'a, C>
where
    C: Send + Sync + 'static,
{
    pub(crate) fn new(cache: &'a Cache<C>, key: &'a str) -> Self {
        Self {
            cache,
            key,
            edges: RefCell::new(Vec::new()),
        }
    }

    /// Read `query(args)` with the default recalculation predicate.
    pub fn get<A>(&self, query: &Query<C, A>, args: &A) -> Result<QueryResult>
    where
        A: Serialize + Clone + Send + Sync + 'static,
    {
        self.get_with(query, args, GetterOptions::default())
    }

    /// Read `query(args)`, recalculating when `options.should_recalculate`
    /// accepts the upstream's next visible result.
    pub fn get_with<A>(
        &self,
        query: &Query<C, A>,
        args: &A,
        options: GetterOptions,
    ) -> Result<QueryResult>
    where
        A: Serialize + Clone + Send + Sync + 'static,
    {
        let upstream = self.cache.query(query, args, CacheOptions::default())?;
        let (result, sync) = self
            .cache
            .snapshot(upstream.id)
            .ok_or_else(|| CacheError::NoSuchEntry(upstream.key.clone()))?;
        self.edges.borrow_mut().push(Edge {
            upstream: upstream.id,
            predicate: options.should_recalculate,
            seen_sync: sync,
        });
        Ok(result)
    }

    pub fn client(&self) -> &C {
        self.cache.client()
    }

    /// Key of the entry being computed.
    pub fn key(&self) -> &str {
        self.key
    }

    pub(crate) fn into_edges(self) -> Vec<Edge> {
        self.edges.into_inner()
    }
}
