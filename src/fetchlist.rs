//! Request-scoped work queue with single-owner claims.
//!
//! A URL is at any time either pending (queued, nobody owns it), in progress
//! (exactly one owner is fetching it), or unknown to the list. Pool workers
//! take ownership through [`FetchList::pop`]; a request thread that needs a
//! URL right now takes it through [`FetchList::claim`], jumping the queue.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use crate::{
    page::PageShared,
    resource::FetchKind,
    source::Document,
    tasklist::{Job, TaskList, WorkSource},
};

/// One fetch attempt for one URL on behalf of one page.
pub struct FetchTask<D> {
    pub url: String,
    pub kind: FetchKind,
    pub(crate) page: Weak<PageShared<D>>,
}

impl<D> FetchTask<D> {
    pub(crate) fn new(url: impl Into<String>, kind: FetchKind, page: Weak<PageShared<D>>) -> Self {
        FetchTask {
            url: url.into(),
            kind,
            page,
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.kind == FetchKind::ConditionalGet
    }
}

impl<D> fmt::Debug for FetchTask<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchTask")
            .field("url", &self.url)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<D: Document> Job for FetchTask<D> {
    fn run(self: Box<Self>) {
        match self.page.upgrade() {
            Some(page) => page.run_task(*self),
            None => tracing::debug!("[FetchList] dropping {} for a finished page", self.url),
        }
    }
}

struct Queue<D> {
    // Head is the most recently pushed task.
    tasks: VecDeque<FetchTask<D>>,
    pending: HashSet<String>,
    in_progress: HashSet<String>,
    closed: bool,
}

pub struct FetchList<D> {
    index: u64,
    scheduler: Arc<TaskList>,
    inner: Mutex<Queue<D>>,
}

impl<D> FetchList<D> {
    pub fn new(scheduler: Arc<TaskList>) -> Self {
        FetchList {
            index: scheduler.next_index(),
            scheduler,
            inner: Mutex::new(Queue {
                tasks: VecDeque::new(),
                pending: HashSet::new(),
                in_progress: HashSet::new(),
                closed: false,
            }),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Queues `task` at the head unless its URL is already pending or in
    /// progress, then wakes the scheduler.
    pub fn push(&self, task: FetchTask<D>) -> bool {
        let pushed = self.enqueue(task);
        if pushed {
            self.scheduler.notify();
        }
        pushed
    }

    /// [`push`](Self::push) without the wake-up, for callers holding a lock
    /// the scheduler must not be entered under.
    pub(crate) fn enqueue(&self, task: FetchTask<D>) -> bool {
        let mut queue = self.inner.lock();
        if queue.closed || queue.pending.contains(&task.url) || queue.in_progress.contains(&task.url)
        {
            return false;
        }
        queue.pending.insert(task.url.clone());
        queue.tasks.push_front(task);
        true
    }

    pub fn pop(&self) -> Option<FetchTask<D>> {
        let mut queue = self.inner.lock();
        if queue.closed {
            return None;
        }
        let task = queue.tasks.pop_front()?;
        queue.pending.remove(&task.url);
        queue.in_progress.insert(task.url.clone());
        Some(task)
    }

    /// Releases ownership of `url` after its fetch has been recorded.
    pub fn completed(&self, url: &str) -> bool {
        let released = self.inner.lock().in_progress.remove(url);
        if !released {
            tracing::warn!("[FetchList] completed {url} which was not in progress");
        }
        released
    }

    /// Takes ownership of `url` for the caller. Fails only when someone else
    /// already owns it; a queued task for `url` is discarded in favour of the
    /// caller.
    pub fn claim(&self, url: &str) -> bool {
        let mut queue = self.inner.lock();
        if queue.in_progress.contains(url) {
            return false;
        }
        if queue.pending.remove(url) {
            queue.tasks.retain(|t| t.url != url);
        }
        queue.in_progress.insert(url.to_string());
        true
    }

    /// Drops every queued conditional task. Returns how many were dropped.
    pub fn remove_if_conditional(&self) -> usize {
        let mut queue = self.inner.lock();
        let Queue { tasks, pending, .. } = &mut *queue;
        let before = tasks.len();
        tasks.retain(|t| {
            if t.is_conditional() {
                pending.remove(&t.url);
                false
            } else {
                true
            }
        });
        before - tasks.len()
    }

    /// Refuses all further queueing and discards whatever is still queued.
    /// Fetches already in progress are unaffected.
    pub fn close(&self) {
        let mut queue = self.inner.lock();
        queue.closed = true;
        queue.tasks.clear();
        queue.pending.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_pending(&self, url: &str) -> bool {
        self.inner.lock().pending.contains(url)
    }

    pub fn is_in_progress(&self, url: &str) -> bool {
        self.inner.lock().in_progress.contains(url)
    }

    /// Number of queued, unclaimed tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: Document> WorkSource for FetchList<D> {
    fn index(&self) -> u64 {
        self.index
    }

    fn next_job(&self) -> Option<Box<dyn Job>> {
        self.pop().map(|task| Box::new(task) as Box<dyn Job>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    type Doc = String;

    fn list() -> FetchList<Doc> {
        FetchList::new(Arc::new(TaskList::new()))
    }

    fn get(url: &str) -> FetchTask<Doc> {
        FetchTask::new(url, FetchKind::Get, Weak::new())
    }

    fn conditional(url: &str) -> FetchTask<Doc> {
        FetchTask::new(url, FetchKind::ConditionalGet, Weak::new())
    }

    #[test]
    fn test_push_deduplication() {
        let list = list();
        assert!(list.push(get("a")));
        assert!(!list.push(get("a")));
        assert!(!list.push(conditional("a")));
        assert_eq!(list.len(), 1);

        let task = list.pop().unwrap();
        assert_eq!(task.url, "a");
        assert!(!list.push(get("a")), "in-progress URL must not be queued again");

        assert!(list.completed("a"));
        assert!(list.push(get("a")));
    }

    #[test]
    fn test_pop_is_lifo() {
        let list = list();
        list.push(get("a"));
        list.push(get("b"));
        list.push(get("c"));
        let order: Vec<_> = std::iter::from_fn(|| list.pop()).map(|t| t.url).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert!(list.pop().is_none());
    }

    #[test]
    fn test_pending_and_in_progress_are_disjoint() {
        let list = list();
        list.push(get("a"));
        assert!(list.is_pending("a"));
        assert!(!list.is_in_progress("a"));
        list.pop();
        assert!(!list.is_pending("a"));
        assert!(list.is_in_progress("a"));
    }

    #[test]
    fn test_claim() {
        let list = list();
        // Unknown URL: fresh claim.
        assert!(list.claim("a"));
        assert!(!list.claim("a"));
        assert!(list.is_in_progress("a"));

        // Pending URL: the queued task is discarded in favour of the caller.
        list.push(get("b"));
        list.push(get("c"));
        assert!(list.claim("b"));
        assert_eq!(list.len(), 1);
        assert_eq!(list.pop().unwrap().url, "c");
        assert!(!list.claim("c"));
    }

    #[test]
    fn test_remove_if_conditional() {
        let list = list();
        list.push(conditional("a"));
        list.push(get("b"));
        list.push(conditional("c"));
        assert_eq!(list.remove_if_conditional(), 2);
        assert_eq!(list.len(), 1);
        assert!(!list.is_pending("a"));
        assert!(list.push(get("a")));
    }

    #[test]
    fn test_close() {
        let list = list();
        list.push(get("a"));
        list.pop();
        list.push(get("b"));
        list.close();
        assert!(list.pop().is_none());
        assert!(!list.push(get("c")));
        assert!(list.is_in_progress("a"));
        assert!(list.completed("a"));
        assert!(list.claim("b"));
    }

    #[test]
    fn test_concurrent_claims_single_owner() {
        let list = Arc::new(list());
        list.push(get("shared"));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let list = list.clone();
                thread::spawn(move || {
                    if i % 2 == 0 {
                        list.claim("shared")
                    } else {
                        list.pop().is_some()
                    }
                })
            })
            .collect();
        let owners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|owned| *owned)
            .count();
        assert_eq!(owners, 1);
    }
}
