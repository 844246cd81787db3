//! Per-request orchestration of validation and fetching.
//!
//! A [`PageManager`] owns the work queue for one incoming request. It first
//! tries to answer "not modified" by revalidating the root and every resource
//! the root was last known to include. Failing that, it prefetches those same
//! resources while the renderer asks for what it actually needs, and grows the
//! set of needed resources as real includes are discovered. Once everything
//! needed is archived the page is `Done` and its merged validators can be
//! written to the outbound response.
//!
//! Locking: every state change for one page happens under that page's mutex.
//! The page mutex may be held while taking the work queue's mutex, but never
//! while calling the dependency tracker, the scheduler, the fetcher or the
//! dependency finder. Scheduler calls produced by a state change are collected
//! in a `Deferred` and applied after the page mutex is released.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use http::{HeaderMap, StatusCode};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::{
    cache_headers::{HeaderMerger, ResponseInfo, ValidatorMerge},
    deptracker::DependencyTracker,
    error::TranscludeError,
    fetchlist::{FetchList, FetchTask},
    resource::{FetchKind, RequestContext, ResourceKey, Response},
    source::{DependencyFinder, Document, ResourceFetcher},
    tasklist::TaskList,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PmState {
    Initial,
    CheckModification,
    NotModified,
    Modified,
    GetPages,
    Done,
}

impl PmState {
    pub fn can_transition_to(self, next: PmState) -> bool {
        use PmState::*;
        match (self, next) {
            (Initial, CheckModification) | (Initial, Modified) => true,
            (CheckModification, NotModified) | (CheckModification, Modified) => true,
            (Modified, GetPages) | (Modified, Done) => true,
            (GetPages, Done) => true,
            (Initial | CheckModification | NotModified | Modified | GetPages | Done, _) => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PmState::NotModified | PmState::Done)
    }
}

impl fmt::Display for PmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

enum Archived<D> {
    Content(Response<D>),
    /// Answered 304; validators only.
    Unchanged(Response<D>),
    Failed(String),
}

impl<D> Archived<D> {
    /// Content and failures both settle a URL for this request.
    fn is_resolved(&self) -> bool {
        !matches!(self, Archived::Unchanged(_))
    }

    fn response_info(&self) -> ResponseInfo {
        match self {
            Archived::Content(r) | Archived::Unchanged(r) => {
                ResponseInfo::new(r.status, r.headers.clone())
            }
            Archived::Failed(_) => ResponseInfo::new(StatusCode::BAD_GATEWAY, HeaderMap::new()),
        }
    }
}

struct PageState<D> {
    phase: PmState,
    archive: HashMap<String, Archived<D>>,
    needed: HashSet<String>,
    actual: BTreeSet<String>,
    // Direct includes discovered during this request.
    speculative: HashMap<String, Vec<String>>,
    // Tracked closure of the root, fixed when the page leaves `Initial`.
    predicted: Vec<String>,
    expected_responses: usize,
}

impl<D> PageState<D> {
    fn is_resolved(&self, url: &str) -> bool {
        self.archive.get(url).is_some_and(Archived::is_resolved)
    }
}

/// What the tracker knows about the root.
struct Prediction {
    tracked: bool,
    urls: Vec<String>,
}

#[derive(Default)]
struct Deferred {
    register: bool,
    deregister: bool,
    wake: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageStats {
    pub archived: usize,
    pub failed: usize,
    pub needed: usize,
    pub actual: usize,
    pub queued: usize,
}

pub(crate) struct PageShared<D> {
    root_url: String,
    context: RequestContext,
    tracker: Arc<DependencyTracker>,
    finder: Arc<dyn DependencyFinder<D>>,
    fetcher: Arc<dyn ResourceFetcher<D>>,
    merger: Arc<dyn HeaderMerger>,
    scheduler: Arc<TaskList>,
    fetchlist: Arc<FetchList<D>>,
    state: Mutex<PageState<D>>,
    cv: Condvar,
}

impl<D: Document> PageShared<D> {
    fn advance(&self, state: &mut PageState<D>, next: PmState) {
        assert!(
            state.phase.can_transition_to(next),
            "illegal page transition {} -> {} for {}",
            state.phase,
            next,
            self.root_url
        );
        tracing::debug!("[PageManager] {} {} -> {}", self.root_url, state.phase, next);
        state.phase = next;
    }

    fn apply(&self, deferred: Deferred) {
        if deferred.register {
            self.scheduler.put_list(self.fetchlist.clone());
            if self.fetchlist.is_closed() {
                self.scheduler.remove_list(self.fetchlist.index());
            }
        }
        if deferred.deregister {
            self.scheduler.remove_list(self.fetchlist.index());
        }
        if deferred.wake {
            self.scheduler.notify_all();
        }
    }

    /// Reads the root's tracked closure. Called without the page lock held.
    fn predict(&self) -> Prediction {
        let root_key = ResourceKey::for_request(&self.root_url, &self.context);
        let tracked = self.tracker.is_tracked(&root_key);
        let mut seen = HashSet::from([self.root_url.clone()]);
        let urls = self
            .tracker
            .get_all_deps(&root_key)
            .into_iter()
            .map(|key| key.url)
            .filter(|url| seen.insert(url.clone()))
            .collect();
        Prediction { tracked, urls }
    }

    fn task(self: &Arc<Self>, url: &str, kind: FetchKind) -> FetchTask<D> {
        FetchTask::new(url, kind, Arc::downgrade(self))
    }

    fn add_get(self: &Arc<Self>, state: &PageState<D>, url: &str, deferred: &mut Deferred) {
        if !state.is_resolved(url) && self.fetchlist.enqueue(self.task(url, FetchKind::Get)) {
            deferred.wake = true;
        }
    }

    fn lookup(&self, state: &PageState<D>, url: &str) -> Option<Result<Response<D>, TranscludeError>> {
        match state.archive.get(url)? {
            Archived::Content(response) => Some(Ok(response.clone())),
            Archived::Failed(reason) if url == self.root_url => {
                Some(Err(TranscludeError::RootUnavailable {
                    url: url.to_string(),
                    reason: reason.clone(),
                }))
            }
            Archived::Failed(_) => Some(Ok(Response::unavailable())),
            Archived::Unchanged(_) => None,
        }
    }

    pub(crate) fn is_modified(self: &Arc<Self>) -> bool {
        let prediction = self.predict();
        let mut state = self.state.lock();
        match state.phase {
            PmState::Modified | PmState::GetPages | PmState::Done => return true,
            PmState::NotModified => return false,
            PmState::CheckModification => {}
            PmState::Initial => {
                state.predicted = prediction.urls;
                if !self.context.is_conditional() || !prediction.tracked {
                    tracing::debug!(
                        "[PageManager] {} has nothing to validate against",
                        self.root_url
                    );
                    let mut deferred = Deferred::default();
                    self.init_speculative(&mut state, &mut deferred);
                    drop(state);
                    self.apply(deferred);
                    return true;
                }
                self.advance(&mut state, PmState::CheckModification);
                let mut urls = vec![self.root_url.clone()];
                urls.extend(state.predicted.iter().cloned());
                state.expected_responses = urls.len();
                for url in &urls {
                    self.fetchlist.enqueue(self.task(url, FetchKind::ConditionalGet));
                }
                tracing::debug!(
                    "[PageManager] validating {} resources for {}",
                    urls.len(),
                    self.root_url
                );
                MutexGuard::unlocked(&mut state, || {
                    self.scheduler.put_list(self.fetchlist.clone());
                });
            }
        }

        while state.phase == PmState::CheckModification {
            match self.fetchlist.pop() {
                Some(task) => MutexGuard::unlocked(&mut state, || self.run_task(task)),
                None => self.cv.wait(&mut state),
            }
        }
        state.phase != PmState::NotModified
    }

    pub(crate) fn begin_speculative_gets(self: &Arc<Self>) -> Result<(), TranscludeError> {
        let prediction = self.predict();
        let mut state = self.state.lock();
        let mut deferred = Deferred::default();
        match state.phase {
            PmState::GetPages | PmState::Done => return Ok(()),
            PmState::CheckModification | PmState::NotModified => {
                tracing::warn!(
                    "[PageManager] begin_speculative_gets called for {} while {}",
                    self.root_url,
                    state.phase
                );
                return Err(TranscludeError::invalid_state(
                    "begin_speculative_gets",
                    state.phase,
                ));
            }
            PmState::Initial => {
                state.predicted = prediction.urls;
                self.init_speculative(&mut state, &mut deferred);
            }
            PmState::Modified => {}
        }
        if state.phase == PmState::Modified {
            self.advance(&mut state, PmState::GetPages);
            deferred.register = true;
        }
        drop(state);
        self.apply(deferred);
        Ok(())
    }

    pub(crate) fn fetch(self: &Arc<Self>, url: &str) -> Result<Response<D>, TranscludeError> {
        let needs_start = {
            let state = self.state.lock();
            if let Some(found) = self.lookup(&state, url) {
                return found;
            }
            matches!(state.phase, PmState::Initial | PmState::Modified)
        };
        if needs_start {
            self.begin_speculative_gets()?;
        }

        let mut state = self.state.lock();
        loop {
            if let Some(found) = self.lookup(&state, url) {
                return found;
            }
            if self.fetchlist.claim(url) {
                if matches!(state.phase, PmState::Modified | PmState::GetPages) {
                    state.needed.insert(url.to_string());
                }
                break;
            }
            self.cv.wait(&mut state);
        }
        drop(state);

        self.run_task(self.task(url, FetchKind::Get));

        let state = self.state.lock();
        self.lookup(&state, url).unwrap_or_else(|| {
            Err(TranscludeError::Fetch {
                url: url.to_string(),
                reason: "no content was archived".to_string(),
            })
        })
    }

    pub(crate) fn wait_until_complete(self: &Arc<Self>) -> Result<PmState, TranscludeError> {
        let mut state = self.state.lock();
        if state.phase == PmState::Initial {
            return Err(TranscludeError::invalid_state(
                "wait_until_complete",
                state.phase,
            ));
        }
        while !state.phase.is_terminal() {
            match self.fetchlist.pop() {
                Some(task) => MutexGuard::unlocked(&mut state, || self.run_task(task)),
                None => self.cv.wait(&mut state),
            }
        }
        Ok(state.phase)
    }

    pub(crate) fn merge_headers_into(&self, headers: &mut HeaderMap) -> Result<(), TranscludeError> {
        let contributors: BTreeMap<String, ResponseInfo> = {
            let state = self.state.lock();
            if !state.phase.is_terminal() {
                tracing::warn!(
                    "[PageManager] merge_headers_into called for {} while {}",
                    self.root_url,
                    state.phase
                );
                return Err(TranscludeError::invalid_state("merge_headers_into", state.phase));
            }
            state
                .actual
                .iter()
                .map(|url| {
                    let info = state
                        .archive
                        .get(url)
                        .map(Archived::response_info)
                        .unwrap_or_else(|| ResponseInfo::new(StatusCode::BAD_GATEWAY, HeaderMap::new()));
                    (url.clone(), info)
                })
                .collect()
        };
        self.merger.merge_cache_headers(&contributors, headers)
    }

    /// Executes one fetch on the calling thread and records the outcome.
    pub(crate) fn run_task(self: &Arc<Self>, task: FetchTask<D>) {
        let outcome = self.perform(&task.url, task.kind);
        let not_modified = matches!(&outcome, Ok(r) if r.is_not_modified());
        if task.is_conditional() && !not_modified && self.abort_validation(&task.url) {
            return;
        }
        match outcome {
            Ok(response) if not_modified && task.is_conditional() => {
                self.got_304(&task.url, response)
            }
            Ok(response) => self.got_200(&task.url, response),
            Err(e) => self.got_failure(&task, e),
        }
    }

    fn perform(&self, url: &str, kind: FetchKind) -> Result<Response<D>, TranscludeError> {
        let context = self.context.for_fetch(url, kind)?;
        tracing::debug!("[PageManager] {kind:?} {url}");
        catch_unwind(AssertUnwindSafe(|| self.fetcher.fetch_resource(url, &context))).unwrap_or_else(
            |_| {
                Err(TranscludeError::Fetch {
                    url: url.to_string(),
                    reason: "fetcher panicked".to_string(),
                })
            },
        )
    }

    fn discover(&self, url: &str, response: &Response<D>) -> Vec<String> {
        let Some(document) = &response.parsed else {
            return Vec::new();
        };
        match catch_unwind(AssertUnwindSafe(|| self.finder.find_dependencies(document, url))) {
            Ok(found) => {
                let mut seen = HashSet::new();
                found.into_iter().filter(|dep| seen.insert(dep.clone())).collect()
            }
            Err(_) => {
                tracing::error!("[PageManager] dependency finder panicked on {url}");
                Vec::new()
            }
        }
    }

    /// A conditional request came back with something other than 304 while
    /// validating: the page is modified.
    fn abort_validation(self: &Arc<Self>, url: &str) -> bool {
        let mut state = self.state.lock();
        if state.phase != PmState::CheckModification {
            return false;
        }
        tracing::debug!("[PageManager] {url} changed, abandoning validation of {}", self.root_url);
        let mut deferred = Deferred::default();
        self.fetchlist.completed(url);
        self.init_speculative(&mut state, &mut deferred);
        self.cv.notify_all();
        drop(state);
        self.apply(deferred);
        true
    }

    fn init_speculative(self: &Arc<Self>, state: &mut PageState<D>, deferred: &mut Deferred) {
        self.advance(state, PmState::Modified);
        let dropped = self.fetchlist.remove_if_conditional();
        if dropped > 0 {
            tracing::debug!("[PageManager] dropped {dropped} queued validations");
        }
        state.speculative.clear();
        state.needed.clear();
        state.needed.insert(self.root_url.clone());

        self.add_get(state, &self.root_url, deferred);
        for url in &state.predicted {
            self.add_get(state, url, deferred);
        }

        if state.is_resolved(&self.root_url) {
            let root = self.root_url.clone();
            self.got_needed(state, &root, deferred);
        }
    }

    fn got_200(self: &Arc<Self>, url: &str, response: Response<D>) {
        let deps = self.discover(url, &response);
        self.tracker.set_direct_deps(
            ResourceKey::for_request(url, &self.context),
            deps.iter()
                .map(|dep| ResourceKey::for_request(dep, &self.context))
                .collect(),
        );

        let mut state = self.state.lock();
        let mut deferred = Deferred::default();
        if state.phase == PmState::CheckModification {
            self.init_speculative(&mut state, &mut deferred);
        }
        state.archive.insert(url.to_string(), Archived::Content(response));
        for dep in &deps {
            self.add_get(&state, dep, &mut deferred);
        }
        state.speculative.insert(url.to_string(), deps);
        self.fetchlist.completed(url);
        if state.needed.contains(url) {
            self.got_needed(&mut state, url, &mut deferred);
        }
        self.cv.notify_all();
        drop(state);
        self.apply(deferred);
    }

    fn got_304(self: &Arc<Self>, url: &str, response: Response<D>) {
        let mut state = self.state.lock();
        let mut deferred = Deferred::default();
        if !state.is_resolved(url) {
            state.archive.insert(url.to_string(), Archived::Unchanged(response));
        }
        self.fetchlist.completed(url);
        match state.phase {
            PmState::CheckModification => {
                state.expected_responses = state.expected_responses.saturating_sub(1);
                if state.expected_responses == 0 {
                    self.advance(&mut state, PmState::NotModified);
                    state.actual = state.archive.keys().cloned().collect();
                    self.fetchlist.close();
                    deferred.deregister = true;
                    tracing::info!(
                        "[PageManager] {} not modified ({} resources validated)",
                        self.root_url,
                        state.actual.len()
                    );
                }
            }
            PmState::Modified | PmState::GetPages => self.add_get(&state, url, &mut deferred),
            PmState::Initial | PmState::NotModified | PmState::Done => {
                tracing::debug!("[PageManager] ignoring late 304 for {url}");
            }
        }
        self.cv.notify_all();
        drop(state);
        self.apply(deferred);
    }

    fn got_failure(self: &Arc<Self>, task: &FetchTask<D>, error: TranscludeError) {
        let url = task.url.as_str();
        let mut state = self.state.lock();
        let mut deferred = Deferred::default();
        self.fetchlist.completed(url);

        if task.is_conditional() && matches!(state.phase, PmState::Modified | PmState::GetPages) {
            // The validation pass is over; the content still has to be fetched.
            self.add_get(&state, url, &mut deferred);
        } else {
            tracing::warn!("[PageManager] {url} unavailable: {error}");
            if !state.is_resolved(url) {
                state
                    .archive
                    .insert(url.to_string(), Archived::Failed(error.to_string()));
            }
            state.speculative.insert(url.to_string(), Vec::new());
            if state.needed.contains(url) {
                self.got_needed(&mut state, url, &mut deferred);
            }
        }
        self.cv.notify_all();
        drop(state);
        self.apply(deferred);
    }

    fn got_needed(self: &Arc<Self>, state: &mut PageState<D>, url: &str, deferred: &mut Deferred) {
        state.needed.remove(url);
        state.actual.insert(url.to_string());

        for dep in closure(&state.speculative, url) {
            if state.is_resolved(&dep) {
                state.actual.insert(dep);
            } else {
                self.add_get(state, &dep, deferred);
                state.needed.insert(dep);
            }
        }

        if state.needed.is_empty() && matches!(state.phase, PmState::Modified | PmState::GetPages) {
            self.advance(state, PmState::Done);
            self.fetchlist.close();
            deferred.deregister = true;
            tracing::info!(
                "[PageManager] {} done ({} resources contributed)",
                self.root_url,
                state.actual.len()
            );
        }
    }
}

/// Breadth-first closure over this request's discovered includes, excluding
/// `url` itself.
fn closure(speculative: &HashMap<String, Vec<String>>, url: &str) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::from([url]);
    let mut deps: Vec<&str> = Vec::new();
    let mut index = 0;
    let mut next: Option<&str> = Some(url);
    while let Some(current) = next {
        for dep in speculative.get(current).into_iter().flatten() {
            if seen.insert(dep.as_str()) {
                deps.push(dep.as_str());
            }
        }
        next = deps.get(index).copied();
        index += 1;
    }
    deps.into_iter().map(str::to_string).collect()
}

/// Request-scoped coordinator for validating and assembling one page.
pub struct PageManager<D: Document> {
    shared: Arc<PageShared<D>>,
}

impl<D: Document> PageManager<D> {
    pub fn new<F, R>(
        root_url: impl Into<String>,
        context: RequestContext,
        tracker: Arc<DependencyTracker>,
        finder: F,
        scheduler: Arc<TaskList>,
        fetcher: R,
    ) -> Self
    where
        F: DependencyFinder<D> + 'static,
        R: ResourceFetcher<D> + 'static,
    {
        Self::with_header_merger(
            root_url,
            context,
            tracker,
            Arc::new(finder),
            scheduler,
            Arc::new(fetcher),
            Arc::new(ValidatorMerge),
        )
    }

    /// Like [`new`](Self::new), with shared collaborators and a custom
    /// validator merge.
    pub fn with_header_merger(
        root_url: impl Into<String>,
        context: RequestContext,
        tracker: Arc<DependencyTracker>,
        finder: Arc<dyn DependencyFinder<D>>,
        scheduler: Arc<TaskList>,
        fetcher: Arc<dyn ResourceFetcher<D>>,
        merger: Arc<dyn HeaderMerger>,
    ) -> Self {
        let fetchlist = Arc::new(FetchList::new(scheduler.clone()));
        PageManager {
            shared: Arc::new(PageShared {
                root_url: root_url.into(),
                context,
                tracker,
                finder,
                fetcher,
                merger,
                scheduler,
                fetchlist,
                state: Mutex::new(PageState {
                    phase: PmState::Initial,
                    archive: HashMap::new(),
                    needed: HashSet::new(),
                    actual: BTreeSet::new(),
                    speculative: HashMap::new(),
                    predicted: Vec::new(),
                    expected_responses: 0,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    /// Whether the page must be served in full. Blocks while the root and
    /// its previously seen includes are revalidated; the calling thread
    /// helps run that work. Returns `false` only when every one of them
    /// answered 304.
    pub fn is_modified(&self) -> bool {
        self.shared.is_modified()
    }

    /// Starts prefetching the root and its previously seen includes without
    /// waiting for them.
    pub fn begin_speculative_gets(&self) -> Result<(), TranscludeError> {
        self.shared.begin_speculative_gets()
    }

    /// Returns an independent copy of `url`'s response, fetching it on this
    /// thread unless another thread already is, in which case this waits for
    /// that fetch.
    ///
    /// A failed include comes back as an empty `502`; a failed root is an
    /// error.
    pub fn fetch(&self, url: &str) -> Result<Response<D>, TranscludeError> {
        self.shared.fetch(url)
    }

    /// Blocks until the page is `Done` or `NotModified`, running queued
    /// fetches on this thread meanwhile.
    pub fn wait_until_complete(&self) -> Result<PmState, TranscludeError> {
        self.shared.wait_until_complete()
    }

    /// Writes validators for every resource that contributed to the page.
    pub fn merge_headers_into(&self, headers: &mut HeaderMap) -> Result<(), TranscludeError> {
        self.shared.merge_headers_into(headers)
    }

    pub fn state(&self) -> PmState {
        self.shared.state.lock().phase
    }

    pub fn root_url(&self) -> &str {
        &self.shared.root_url
    }

    pub fn context(&self) -> &RequestContext {
        &self.shared.context
    }

    /// URLs the assembled page is made of, available once terminal.
    pub fn actual_dependencies(&self) -> Vec<String> {
        self.shared.state.lock().actual.iter().cloned().collect()
    }

    pub fn stats(&self) -> PageStats {
        let state = self.shared.state.lock();
        PageStats {
            archived: state.archive.len(),
            failed: state
                .archive
                .values()
                .filter(|a| matches!(a, Archived::Failed(_)))
                .count(),
            needed: state.needed.len(),
            actual: state.actual.len(),
            queued: self.shared.fetchlist.len(),
        }
    }

    pub fn fetchlist(&self) -> &FetchList<D> {
        &self.shared.fetchlist
    }
}

impl<D: Document> Drop for PageManager<D> {
    fn drop(&mut self) {
        self.shared.fetchlist.close();
        self.shared.scheduler.remove_list(self.shared.fetchlist.index());
    }
}
