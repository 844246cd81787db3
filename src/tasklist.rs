//! Global scheduler shared by every in-flight request.
//!
//! Each request registers its work queue here while it has work for the pool.
//! Workers always rescan from the oldest registered queue, which keeps one
//! request's backlog from starving another's as long as both have ready work.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{Condvar, Mutex};

/// A unit of work handed to a pool worker.
pub trait Job: Send {
    fn run(self: Box<Self>);
}

/// Something the scheduler can pull jobs from.
pub trait WorkSource: Send + Sync {
    /// Registration index; lower indexes are scanned first.
    fn index(&self) -> u64;
    /// Takes the next runnable job, if any. Must not block or call back into
    /// the scheduler.
    fn next_job(&self) -> Option<Box<dyn Job>>;
}

struct Registry {
    alive: bool,
    lists: BTreeMap<u64, Arc<dyn WorkSource>>,
}

pub struct TaskList {
    registry: Mutex<Registry>,
    cv: Condvar,
    next_index: AtomicU64,
}

impl Default for TaskList {
    fn default() -> Self {
        TaskList::new()
    }
}

impl TaskList {
    pub fn new() -> Self {
        TaskList {
            registry: Mutex::new(Registry {
                alive: true,
                lists: BTreeMap::new(),
            }),
            cv: Condvar::new(),
            next_index: AtomicU64::new(0),
        }
    }

    /// Hands out the position a new work source will occupy for its whole
    /// life, however often it is registered and removed.
    pub fn next_index(&self) -> u64 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Blocks until some registered source yields a job. Returns `None` once
    /// the scheduler has been killed.
    pub fn get(&self) -> Option<Box<dyn Job>> {
        let mut registry = self.registry.lock();
        loop {
            if !registry.alive {
                return None;
            }
            for list in registry.lists.values() {
                if let Some(job) = list.next_job() {
                    return Some(job);
                }
            }
            self.cv.wait(&mut registry);
        }
    }

    pub fn put_list(&self, list: Arc<dyn WorkSource>) {
        let index = list.index();
        let mut registry = self.registry.lock();
        if registry.lists.insert(index, list).is_none() {
            tracing::debug!("[TaskList] registered list {index}");
        }
        self.cv.notify_all();
    }

    pub fn remove_list(&self, index: u64) -> bool {
        let removed = self.registry.lock().lists.remove(&index).is_some();
        if removed {
            tracing::debug!("[TaskList] removed list {index}");
        }
        removed
    }

    pub fn is_registered(&self, index: u64) -> bool {
        self.registry.lock().lists.contains_key(&index)
    }

    pub fn active_lists(&self) -> usize {
        self.registry.lock().lists.len()
    }

    /// Wakes one waiting worker.
    pub fn notify(&self) {
        let _registry = self.registry.lock();
        self.cv.notify_one();
    }

    pub fn notify_all(&self) {
        let _registry = self.registry.lock();
        self.cv.notify_all();
    }

    /// Stops the scheduler: every blocked and future `get` returns `None`.
    pub fn kill(&self) {
        let mut registry = self.registry.lock();
        registry.alive = false;
        registry.lists.clear();
        self.cv.notify_all();
        tracing::debug!("[TaskList] killed");
    }

    pub fn is_alive(&self) -> bool {
        self.registry.lock().alive
    }
}
