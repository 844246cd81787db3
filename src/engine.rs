use std::sync::Arc;

use http::HeaderMap;

use crate::{
    cache_headers::{HeaderMerger, ValidatorMerge},
    config::EngineConfig,
    deptracker::DependencyTracker,
    error::TranscludeError,
    page::PageManager,
    pool::ThreadPool,
    resource::{RequestContext, Response},
    source::{DependencyFinder, Document, FilteredFinder, ResourceFetcher},
    tasklist::TaskList,
};

/// Outcome of handling one request.
#[derive(Debug)]
pub enum Assembly<D> {
    /// Nothing the page is made of has changed; answer 304 with these
    /// validators.
    NotModified { headers: HeaderMap },
    /// The assembled page, with merged validators in its headers.
    Modified(Response<D>),
}

/// Process-wide state shared by every request: the dependency tracker, the
/// scheduler and the worker pool draining it.
pub struct Transcluder {
    config: EngineConfig,
    tracker: Arc<DependencyTracker>,
    scheduler: Arc<TaskList>,
    merger: Arc<dyn HeaderMerger>,
    pool: ThreadPool,
}

impl Transcluder {
    pub fn new(config: EngineConfig) -> Result<Self, TranscludeError> {
        config.validate()?;
        let tracker = Arc::new(match config.tracker_capacity {
            Some(capacity) => DependencyTracker::with_capacity(capacity)?,
            None => DependencyTracker::new(),
        });
        let scheduler = Arc::new(TaskList::new());
        let pool = ThreadPool::with_name(config.pool_size, &config.worker_name, scheduler.clone())?;
        tracing::info!(
            "[Transcluder] ready with {} workers (tracker capacity: {:?})",
            config.pool_size,
            config.tracker_capacity
        );
        Ok(Transcluder {
            config,
            tracker,
            scheduler,
            merger: Arc::new(ValidatorMerge),
            pool,
        })
    }

    pub fn with_header_merger(mut self, merger: Arc<dyn HeaderMerger>) -> Self {
        self.merger = merger;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<DependencyTracker> {
        &self.tracker
    }

    pub fn scheduler(&self) -> &Arc<TaskList> {
        &self.scheduler
    }

    /// A page manager for `root_url` wired to the shared tracker and
    /// scheduler, with the configured include and recursion policies applied
    /// to `finder`.
    pub fn page<D, F, R>(
        &self,
        root_url: &str,
        context: RequestContext,
        finder: F,
        fetcher: R,
    ) -> PageManager<D>
    where
        D: Document,
        F: DependencyFinder<D> + 'static,
        R: ResourceFetcher<D> + 'static,
    {
        let finder = FilteredFinder::new(
            finder,
            self.config.include_policy.clone(),
            self.config.recurse_policy.clone(),
            root_url,
        );
        PageManager::with_header_merger(
            root_url,
            context,
            self.tracker.clone(),
            Arc::new(finder),
            self.scheduler.clone(),
            Arc::new(fetcher),
            self.merger.clone(),
        )
    }

    /// Handles one request end to end.
    ///
    /// A conditional request whose root and known includes all revalidate is
    /// answered without fetching any content. Otherwise the root is fetched,
    /// `render` splices includes into it (calling [`PageManager::fetch`] for
    /// each), and the result carries validators for everything it was built
    /// from.
    pub fn assemble<D, F, R, X>(
        &self,
        root_url: &str,
        context: RequestContext,
        finder: F,
        fetcher: R,
        render: X,
    ) -> Result<Assembly<D>, TranscludeError>
    where
        D: Document,
        F: DependencyFinder<D> + 'static,
        R: ResourceFetcher<D> + 'static,
        X: FnOnce(&PageManager<D>, Response<D>) -> Result<Response<D>, TranscludeError>,
    {
        let conditional = context.is_conditional();
        let page = self.page(root_url, context, finder, fetcher);

        if conditional && !page.is_modified() {
            let mut headers = HeaderMap::new();
            page.merge_headers_into(&mut headers)?;
            tracing::debug!("[Transcluder] {root_url} not modified");
            return Ok(Assembly::NotModified { headers });
        }

        page.begin_speculative_gets()?;
        let root = page.fetch(root_url)?;
        let mut response = render(&page, root)?;
        page.wait_until_complete()?;
        page.merge_headers_into(&mut response.headers)?;
        tracing::debug!(
            "[Transcluder] assembled {root_url} from {} resources",
            page.stats().actual
        );
        Ok(Assembly::Modified(response))
    }

    pub fn shutdown(&mut self) {
        self.pool.shutdown();
    }
}
