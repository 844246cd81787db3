//! Seams to the layers this engine does not own: the transport that fetches
//! resources and the renderer that knows which links are includes.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::TranscludeError,
    resource::{RequestContext, Response},
};

/// A parsed document. `clone` must yield a structurally independent copy;
/// callers of `PageManager::fetch` are free to mutate what they get back.
pub trait Document: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Document for T {}

pub trait ResourceFetcher<D>: Send + Sync {
    /// Performs one request. `context` already carries the sub-request's
    /// cookies and validators. An `Err` marks the resource unavailable.
    fn fetch_resource(&self, url: &str, context: &RequestContext)
        -> Result<Response<D>, TranscludeError>;
}

impl<D, F> ResourceFetcher<D> for F
where
    F: Fn(&str, &RequestContext) -> Result<Response<D>, TranscludeError> + Send + Sync,
{
    fn fetch_resource(
        &self,
        url: &str,
        context: &RequestContext,
    ) -> Result<Response<D>, TranscludeError> {
        self(url, context)
    }
}

pub trait DependencyFinder<D>: Send + Sync {
    /// Direct transclusion targets of `document`, which was fetched from `url`.
    fn find_dependencies(&self, document: &D, url: &str) -> Vec<String>;
}

impl<D, F> DependencyFinder<D> for F
where
    F: Fn(&D, &str) -> Vec<String> + Send + Sync,
{
    fn find_dependencies(&self, document: &D, url: &str) -> Vec<String> {
        self(document, url)
    }
}

/// Which URLs may be included (or recursed into).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "prefixes", rename_all = "snake_case")]
pub enum UrlPolicy {
    #[default]
    All,
    Never,
    LocalhostOnly,
    Prefixes(Vec<String>),
}

impl UrlPolicy {
    pub fn allows(&self, url: &str) -> bool {
        match self {
            UrlPolicy::All => true,
            UrlPolicy::Never => false,
            UrlPolicy::LocalhostOnly => Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h == "localhost"))
                .unwrap_or(false),
            UrlPolicy::Prefixes(prefixes) => prefixes.iter().any(|p| url.starts_with(p.as_str())),
        }
    }
}

/// Applies an include policy to the targets found by `inner`, and a
/// recursion policy to the documents it is asked to inspect.
pub struct FilteredFinder<F> {
    inner: F,
    include: UrlPolicy,
    recurse: UrlPolicy,
    root_url: String,
}

impl<F> FilteredFinder<F> {
    pub fn new(inner: F, include: UrlPolicy, recurse: UrlPolicy, root_url: impl Into<String>) -> Self {
        FilteredFinder {
            inner,
            include,
            recurse,
            root_url: root_url.into(),
        }
    }
}

impl<D, F: DependencyFinder<D>> DependencyFinder<D> for FilteredFinder<F> {
    fn find_dependencies(&self, document: &D, url: &str) -> Vec<String> {
        // The root document is always transcluded; the recursion policy only
        // governs what it pulls in.
        if url != self.root_url && !self.recurse.allows(url) {
            return Vec::new();
        }
        self.inner
            .find_dependencies(document, url)
            .into_iter()
            .filter(|dep| self.include.allows(dep))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::ptr_arg)]
    fn links(doc: &Vec<String>, _url: &str) -> Vec<String> {
        doc.clone()
    }

    #[test]
    fn test_url_policy() {
        assert!(UrlPolicy::All.allows("http://x.test/"));
        assert!(!UrlPolicy::Never.allows("http://x.test/"));
        assert!(UrlPolicy::LocalhostOnly.allows("http://localhost:8080/a"));
        assert!(!UrlPolicy::LocalhostOnly.allows("http://x.test/"));
        let prefixes = UrlPolicy::Prefixes(vec!["http://www.example.org/".to_string()]);
        assert!(prefixes.allows("http://www.example.org/a"));
        assert!(!prefixes.allows("https://www.example.org/a"));
    }

    #[test]
    fn test_filtered_finder() {
        let finder = FilteredFinder::new(
            links,
            UrlPolicy::Prefixes(vec!["http://a.test/".to_string()]),
            UrlPolicy::Never,
            "http://a.test/",
        );
        let doc = vec!["http://a.test/x".to_string(), "http://b.test/y".to_string()];
        assert_eq!(
            finder.find_dependencies(&doc, "http://a.test/"),
            vec!["http://a.test/x".to_string()]
        );
        assert!(finder.find_dependencies(&doc, "http://a.test/x").is_empty());
    }

    #[test]
    fn test_policy_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            policy: UrlPolicy,
        }
        let w: Wrapper =
            toml::from_str("policy = { kind = \"prefixes\", prefixes = [\"http://a/\"] }").unwrap();
        assert_eq!(w.policy, UrlPolicy::Prefixes(vec!["http://a/".to_string()]));
        let w: Wrapper = toml::from_str("policy = { kind = \"all\" }").unwrap();
        assert_eq!(w.policy, UrlPolicy::All);
    }
}
