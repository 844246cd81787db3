//! Process-wide record of which resources include which others.
//!
//! Edges are learned from rendered output and only ever used as a hint for
//! what to validate or prefetch on the next request. They may be stale or
//! cyclic; nothing here treats them as authoritative.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::RwLock;

use crate::{error::TranscludeError, resource::ResourceKey};

#[derive(Debug, Clone)]
struct Edge {
    deps: Vec<ResourceKey>,
    stamp: u64,
}

#[derive(Debug, Default)]
struct Edges {
    by_key: HashMap<ResourceKey, Edge>,
    // Write order, oldest first. Only consulted when a capacity is set.
    by_stamp: BTreeMap<u64, ResourceKey>,
    next_stamp: u64,
}

impl Edges {
    fn insert(&mut self, resource: ResourceKey, deps: Vec<ResourceKey>) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        if let Some(old) = self.by_key.insert(resource.clone(), Edge { deps, stamp }) {
            self.by_stamp.remove(&old.stamp);
        }
        self.by_stamp.insert(stamp, resource);
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.by_key.len() > capacity {
            let Some((_, oldest)) = self.by_stamp.pop_first() else {
                break;
            };
            tracing::debug!("[DependencyTracker] evicting {oldest}");
            self.by_key.remove(&oldest);
        }
    }
}

#[derive(Debug, Default)]
pub struct DependencyTracker {
    edges: RwLock<Edges>,
    capacity: Option<usize>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        DependencyTracker::default()
    }

    /// A tracker holding at most `capacity` resources; writing a new one
    /// beyond that drops the least recently written.
    pub fn with_capacity(capacity: usize) -> Result<Self, TranscludeError> {
        if capacity == 0 {
            return Err(TranscludeError::Config(
                "tracker capacity must be at least 1".to_string(),
            ));
        }
        Ok(DependencyTracker {
            edges: RwLock::new(Edges::default()),
            capacity: Some(capacity),
        })
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Replaces everything known about `resource`'s direct dependencies.
    pub fn set_direct_deps(&self, resource: ResourceKey, deps: Vec<ResourceKey>) {
        let mut edges = self.edges.write();
        edges.insert(resource, deps);
        if let Some(capacity) = self.capacity {
            edges.evict_to(capacity);
        }
    }

    /// Bulk form of [`set_direct_deps`](Self::set_direct_deps).
    pub fn update(&self, dep_map: impl IntoIterator<Item = (ResourceKey, Vec<ResourceKey>)>) {
        let mut edges = self.edges.write();
        for (resource, deps) in dep_map {
            edges.insert(resource, deps);
        }
        if let Some(capacity) = self.capacity {
            edges.evict_to(capacity);
        }
    }

    pub fn is_tracked(&self, resource: &ResourceKey) -> bool {
        self.edges.read().by_key.contains_key(resource)
    }

    pub fn get_direct_deps(&self, resource: &ResourceKey) -> Vec<ResourceKey> {
        self.edges
            .read()
            .by_key
            .get(resource)
            .map(|edge| edge.deps.clone())
            .unwrap_or_default()
    }

    /// Breadth-first closure of `resource`'s dependencies. Each reachable
    /// resource appears once; `resource` itself never does.
    pub fn get_all_deps(&self, resource: &ResourceKey) -> Vec<ResourceKey> {
        let edges = self.edges.read();
        let mut seen: HashSet<&ResourceKey> = HashSet::new();
        seen.insert(resource);
        let mut frontier: Vec<&ResourceKey> = Vec::new();

        let direct = edges.by_key.get(resource).map(|e| e.deps.as_slice()).unwrap_or(&[]);
        for dep in direct {
            if seen.insert(dep) {
                frontier.push(dep);
            }
        }

        let mut index = 0;
        while index < frontier.len() {
            if let Some(edge) = edges.by_key.get(frontier[index]) {
                for dep in &edge.deps {
                    if seen.insert(dep) {
                        frontier.push(dep);
                    }
                }
            }
            index += 1;
        }
        frontier.into_iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.edges.read().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut edges = self.edges.write();
        edges.by_key.clear();
        edges.by_stamp.clear();
    }
}
