//! Inverted indexes from client filter property values to client ids
//!
//! The dispatcher can address "every client whose property `name` equals
//! `value`". Each property name gets its own [`FilterTree`], so the cost of a
//! lookup is bounded by that property's value space rather than by the number
//! of connected clients. [`FilterIndex`] owns the trees and creates them the
//! first time a name is used.
//!
//! Neither type does any locking. The gate service keeps the whole
//! [`FilterIndex`] behind one mutex so that a value change (remove old, insert
//! new) is never observed half-applied by a concurrent visit.

use shared::ClientId;
use std::collections::{HashMap, HashSet};

/// Value buckets for a single filter property name
#[derive(Debug, Default)]
pub struct FilterTree {
    buckets: HashMap<String, HashSet<ClientId>>,
}

impl FilterTree {
    /// Creates an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id` under `value`. Returns false if it was already there.
    pub fn insert(&mut self, id: ClientId, value: &str) -> bool {
        self.buckets.entry(value.to_owned()).or_default().insert(id)
    }

    /// Removes `id` from the `value` bucket
    ///
    /// Removing an absent entry is a no-op. Buckets left empty are dropped.
    pub fn remove(&mut self, id: ClientId, value: &str) -> bool {
        let Some(bucket) = self.buckets.get_mut(value) else {
            return false;
        };
        let removed = bucket.remove(&id);
        if bucket.is_empty() {
            self.buckets.remove(value);
        }
        removed
    }

    /// Calls `f` once for every id currently stored under `value`
    pub fn visit<F>(&self, value: &str, mut f: F)
    where
        F: FnMut(ClientId),
    {
        if let Some(bucket) = self.buckets.get(value) {
            for id in bucket {
                f(*id);
            }
        }
    }

    /// Whether `id` is stored under `value`
    pub fn contains(&self, id: ClientId, value: &str) -> bool {
        self.buckets
            .get(value)
            .map_or(false, |bucket| bucket.contains(&id))
    }

    /// Number of distinct values with at least one client
    pub fn value_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total number of (value, client) entries
    pub fn len(&self) -> usize {
        self.buckets.values().map(HashSet::len).sum()
    }

    /// Whether the tree holds no entries at all
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// One [`FilterTree`] per filter property name
#[derive(Debug, Default)]
pub struct FilterIndex {
    trees: HashMap<String, FilterTree>,
}

impl FilterIndex {
    /// Creates an index with no trees
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes `id` under `name == value`, creating the tree for `name` on
    /// first use. Returns false if the entry was already there.
    pub fn insert(&mut self, name: &str, value: &str, id: ClientId) -> bool {
        self.trees
            .entry(name.to_owned())
            .or_insert_with(FilterTree::new)
            .insert(id, value)
    }

    /// Removes the entry for `id` under `name == value`
    ///
    /// Removing an absent entry is a no-op and returns false.
    pub fn remove(&mut self, name: &str, value: &str, id: ClientId) -> bool {
        self.trees
            .get_mut(name)
            .map_or(false, |tree| tree.remove(id, value))
    }

    /// Calls `f` once for every id stored under `name == value`, in no
    /// particular order. `f` cannot reach the index.
    pub fn visit<F>(&self, name: &str, value: &str, f: F)
    where
        F: FnMut(ClientId),
    {
        if let Some(tree) = self.trees.get(name) {
            tree.visit(value, f);
        }
    }

    /// Snapshot of the ids stored under `name == value`
    pub fn matching(&self, name: &str, value: &str) -> Vec<ClientId> {
        let mut ids = Vec::new();
        self.visit(name, value, |id| ids.push(id));
        ids
    }

    /// Whether `id` is indexed under `name == value`
    pub fn contains(&self, name: &str, value: &str, id: ClientId) -> bool {
        self.trees
            .get(name)
            .map_or(false, |tree| tree.contains(id, value))
    }

    /// The tree for property `name`, if any client ever had it set
    pub fn tree(&self, name: &str) -> Option<&FilterTree> {
        self.trees.get(name)
    }

    /// Number of property names seen so far
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }
}
