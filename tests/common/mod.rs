//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    thread,
    time::Duration,
};

use http::{
    header::{self, HeaderValue},
    HeaderMap, StatusCode,
};
use parking_lot::{Mutex, RwLock};
use transclude_core::{
    cache_headers::merged_etag,
    page::PageManager,
    resource::{RequestContext, Response, X_TRANSCLUDED},
    source::{DependencyFinder, ResourceFetcher},
    TranscludeError,
};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Parsed form of a mock page: its text and the URLs it includes.
#[derive(Debug, Clone, PartialEq)]
pub struct TestDoc {
    pub url: String,
    pub text: String,
    pub includes: Vec<String>,
}

#[derive(Debug, Clone)]
struct MockPage {
    etag: String,
    last_modified: String,
    text: String,
    includes: Vec<String>,
    failing: bool,
    delay: Option<Duration>,
}

/// One request received by the mock site.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Call {
    pub url: String,
    pub conditional: bool,
    pub headers: HeaderMap,
}

/// In-memory backend honouring `If-None-Match`.
#[derive(Default)]
pub struct MockSite {
    pages: RwLock<HashMap<String, MockPage>>,
    calls: Mutex<Vec<Call>>,
}

#[allow(dead_code)]
impl MockSite {
    pub fn new() -> Arc<Self> {
        Arc::new(MockSite::default())
    }

    pub fn page(&self, url: &str, etag: &str, includes: &[&str]) {
        self.pages.write().insert(
            url.to_string(),
            MockPage {
                etag: format!("\"{etag}\""),
                last_modified: "Tue, 15 Nov 1994 08:12:31 GMT".to_string(),
                text: format!("[{url}]"),
                includes: includes.iter().map(|s| s.to_string()).collect(),
                failing: false,
                delay: None,
            },
        );
    }

    /// Gives `url` a new ETag and, optionally, new includes.
    pub fn touch(&self, url: &str, etag: &str, includes: Option<&[&str]>) {
        let mut pages = self.pages.write();
        if let Some(page) = pages.get_mut(url) {
            page.etag = format!("\"{etag}\"");
            page.last_modified = "Wed, 16 Nov 1994 09:00:00 GMT".to_string();
            if let Some(includes) = includes {
                page.includes = includes.iter().map(|s| s.to_string()).collect();
            }
        }
    }

    pub fn set_failing(&self, url: &str, failing: bool) {
        if let Some(page) = self.pages.write().get_mut(url) {
            page.failing = failing;
        }
    }

    pub fn set_delay(&self, url: &str, delay: Duration) {
        if let Some(page) = self.pages.write().get_mut(url) {
            page.delay = Some(delay);
        }
    }

    pub fn etag(&self, url: &str) -> String {
        self.pages
            .read()
            .get(url)
            .map(|p| p.etag.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.url == url).count()
    }

    pub fn full_gets(&self) -> usize {
        self.calls.lock().iter().filter(|c| !c.conditional).count()
    }

    pub fn conditional_gets(&self) -> usize {
        self.calls.lock().iter().filter(|c| c.conditional).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn fetcher(self: &Arc<Self>) -> SiteFetcher {
        SiteFetcher(self.clone())
    }

    fn serve(&self, url: &str, context: &RequestContext) -> Result<Response<TestDoc>, TranscludeError> {
        let conditional = context.headers.contains_key(header::IF_NONE_MATCH)
            || context.headers.contains_key(header::IF_MODIFIED_SINCE);
        self.calls.lock().push(Call {
            url: url.to_string(),
            conditional,
            headers: context.headers.clone(),
        });

        let page = self.pages.read().get(url).cloned();
        let Some(page) = page else {
            return Ok(Response::new(
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Vec::new(),
                None,
            ));
        };
        if let Some(delay) = page.delay {
            thread::sleep(delay);
        }
        if page.failing {
            return Err(TranscludeError::Fetch {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, HeaderValue::from_str(&page.etag)?);
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&page.last_modified)?,
        );
        let unchanged = context
            .headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == page.etag);
        if unchanged {
            return Ok(Response::not_modified(headers));
        }
        Ok(Response::new(
            StatusCode::OK,
            headers,
            page.text.clone().into_bytes(),
            Some(TestDoc {
                url: url.to_string(),
                text: page.text,
                includes: page.includes,
            }),
        ))
    }
}

pub struct SiteFetcher(Arc<MockSite>);

impl ResourceFetcher<TestDoc> for SiteFetcher {
    fn fetch_resource(
        &self,
        url: &str,
        context: &RequestContext,
    ) -> Result<Response<TestDoc>, TranscludeError> {
        self.0.serve(url, context)
    }
}

pub struct IncludeFinder;

impl DependencyFinder<TestDoc> for IncludeFinder {
    fn find_dependencies(&self, document: &TestDoc, _url: &str) -> Vec<String> {
        document.includes.clone()
    }
}

/// Context for a plain (unconditional) request.
#[allow(dead_code)]
pub fn plain_context(url: &str) -> RequestContext {
    RequestContext::new(url, HeaderMap::new())
}

/// Context for a conditional request carrying the merged ETag for `etags`.
#[allow(dead_code)]
pub fn conditional_context(url: &str, etags: &[(&str, String)]) -> RequestContext {
    let map: BTreeMap<&str, &str> = etags.iter().map(|(u, e)| (*u, e.as_str())).collect();
    conditional_context_with(url, &merged_etag(&map))
}

#[allow(dead_code)]
pub fn conditional_context_with(url: &str, if_none_match: &str) -> RequestContext {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::IF_NONE_MATCH,
        HeaderValue::from_str(if_none_match).unwrap(),
    );
    RequestContext::new(url, headers)
}

/// Splices every include's text into the root, recursing up to `depth`.
#[allow(dead_code)]
pub fn render(
    page: &PageManager<TestDoc>,
    mut root: Response<TestDoc>,
) -> Result<Response<TestDoc>, TranscludeError> {
    let Some(doc) = root.parsed.take() else {
        return Ok(root);
    };
    let text = splice(page, &doc, 3)?;
    root.body = text.clone().into_bytes();
    root.parsed = Some(TestDoc { text, ..doc });
    Ok(root)
}

fn splice(page: &PageManager<TestDoc>, doc: &TestDoc, depth: usize) -> Result<String, TranscludeError> {
    let mut out = doc.text.clone();
    if depth == 0 {
        return Ok(out);
    }
    for include in &doc.includes {
        let response = page.fetch(include)?;
        match response.parsed {
            Some(child) => out.push_str(&splice(page, &child, depth - 1)?),
            None => out.push_str("[missing]"),
        }
    }
    Ok(out)
}

#[allow(dead_code)]
pub fn transcluded_header(call: &Call) -> Option<String> {
    call.headers
        .get(&X_TRANSCLUDED)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
