//! Dependency edges between entries.
//!
//! Edges are stored by [`EntryId`] in both directions. A re-evaluation
//! replaces the whole outgoing set of its entry in one step, after checking
//! that none of the new upstreams can already reach the entry.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::cache::getter::RecalculatePredicate;
use crate::key::EntryId;

/// `downstream` reads `upstream` and recomputes when `predicate` passes.
#[derive(Clone)]
pub(crate) struct Edge {
    pub(crate) upstream: EntryId,
    pub(crate) predicate: RecalculatePredicate,
    /// Upstream sync counter at the time of the read.
    pub(crate) seen_sync: u64,
}

/// Installing an edge to `upstream` would close a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cycle {
    pub(crate) upstream: EntryId,
}

/// Upstreams gained and lost by one replacement.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct EdgeChange {
    pub(crate) added: Vec<EntryId>,
    pub(crate) removed: Vec<EntryId>,
}

/// Edges touching an entry that was removed from the graph.
#[derive(Debug, Default)]
pub(crate) struct Detached {
    /// Entries that lost `id` as a dependent.
    pub(crate) upstreams: Vec<EntryId>,
    /// Entries that lost `id` as an upstream.
    pub(crate) downstreams: Vec<EntryId>,
}

#[derive(Default)]
pub(crate) struct DependencyGraph {
    dependencies: HashMap<EntryId, Vec<Edge>>,
    dependents: HashMap<EntryId, BTreeSet<EntryId>>,
}

impl DependencyGraph {
    /// Atomically swap the outgoing edges of `downstream`.
    ///
    /// Duplicate upstreams keep their first edge. On a cycle nothing changes.
    pub(crate) fn replace_dependencies(
        &mut self,
        downstream: EntryId,
        edges: Vec<Edge>,
    ) -> Result<EdgeChange, Cycle> {
        let mut seen = HashSet::new();
        let edges: Vec<Edge> = edges
            .into_iter()
            .filter(|edge| seen.insert(edge.upstream))
            .collect();

        for edge in &edges {
            if edge.upstream == downstream || self.reaches(edge.upstream, downstream) {
                return Err(Cycle {
                    upstream: edge.upstream,
                });
            }
        }

        let old: Vec<EntryId> = self
            .dependencies
            .remove(&downstream)
            .unwrap_or_default()
            .into_iter()
            .map(|edge| edge.upstream)
            .collect();

        let mut change = EdgeChange::default();
        for up in &old {
            if !seen.contains(up) {
                self.unlink(*up, downstream);
                change.removed.push(*up);
            }
        }
        for edge in &edges {
            if !old.contains(&edge.upstream) {
                self.dependents
                    .entry(edge.upstream)
                    .or_default()
                    .insert(downstream);
                change.added.push(edge.upstream);
            }
        }
        if !edges.is_empty() {
            self.dependencies.insert(downstream, edges);
        }
        Ok(change)
    }

    /// Whether `from` depends on `to`, directly or transitively.
    fn reaches(&self, from: EntryId, to: EntryId) -> bool {
        let mut stack = vec![from];
        let mut visited = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(edges) = self.dependencies.get(&id) {
                stack.extend(edges.iter().map(|edge| edge.upstream));
            }
        }
        false
    }

    fn unlink(&mut self, upstream: EntryId, downstream: EntryId) {
        if let Some(set) = self.dependents.get_mut(&upstream) {
            set.remove(&downstream);
            if set.is_empty() {
                self.dependents.remove(&upstream);
            }
        }
    }

    /// Dependents of `upstream` with the predicate of their edge, in id order.
    pub(crate) fn dependents_of(&self, upstream: EntryId) -> Vec<(EntryId, RecalculatePredicate)> {
        let Some(downstreams) = self.dependents.get(&upstream) else {
            return Vec::new();
        };
        downstreams
            .iter()
            .filter_map(|down| {
                self.dependencies
                    .get(down)?
                    .iter()
                    .find(|edge| edge.upstream == upstream)
                    .map(|edge| (*down, edge.predicate.clone()))
            })
            .collect()
    }

    pub(crate) fn dependent_count(&self, upstream: EntryId) -> usize {
        self.dependents.get(&upstream).map_or(0, BTreeSet::len)
    }

    pub(crate) fn upstreams_of(&self, downstream: EntryId) -> Vec<EntryId> {
        self.dependencies
            .get(&downstream)
            .map(|edges| edges.iter().map(|edge| edge.upstream).collect())
            .unwrap_or_default()
    }

    /// Drop every edge touching `id`.
    pub(crate) fn remove(&mut self, id: EntryId) -> Detached {
        let mut detached = Detached::default();
        if let Some(edges) = self.dependencies.remove(&id) {
            for edge in edges {
                self.unlink(edge.upstream, id);
                detached.upstreams.push(edge.upstream);
            }
        }
        if let Some(downstreams) = self.dependents.remove(&id) {
            for down in downstreams {
                if let Some(edges) = self.dependencies.get_mut(&down) {
                    edges.retain(|edge| edge.upstream != id);
                    if edges.is_empty() {
                        self.dependencies.remove(&down);
                    }
                }
                detached.downstreams.push(down);
            }
        }
        detached
    }

    pub(crate) fn clear(&mut self) {
        self.dependencies.clear();
        self.dependents.clear();
    }
}
