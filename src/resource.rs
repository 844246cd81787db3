use std::{collections::BTreeMap, fmt};

use http::{
    header::{self, HeaderName, HeaderValue},
    HeaderMap, StatusCode,
};
use serde::{Deserialize, Serialize};

use crate::{
    cache_headers::parse_merged_etag,
    cookies::{cookie_fingerprint, cookie_string, parse_cookie_header, relevant_cookies, Cookie},
    error::TranscludeError,
};

/// Marks every sub-request with the root URL that triggered it, so a backend
/// can tell transcluded requests apart from direct ones.
pub const X_TRANSCLUDED: HeaderName = HeaderName::from_static("x-transcluded");

/// Identity of a fetchable entity: the URL plus a fingerprint of the cookies
/// visible to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub url: String,
    pub fingerprint: String,
}

impl ResourceKey {
    pub fn new(url: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        ResourceKey {
            url: url.into(),
            fingerprint: fingerprint.into(),
        }
    }

    pub fn for_request(url: &str, context: &RequestContext) -> Self {
        ResourceKey::new(url, cookie_fingerprint(&context.cookies, url))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fingerprint.is_empty() {
            write!(f, "{}", self.url)
        } else {
            let short = self.fingerprint.get(..8).unwrap_or(&self.fingerprint);
            write!(f, "{}#{}", self.url, short)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchKind {
    ConditionalGet,
    Get,
}

/// The incoming request as seen by the engine, and the source of every
/// sub-request's headers.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub url: String,
    pub headers: HeaderMap,
    pub cookies: Vec<Cookie>,
    /// Per-URL ETags recovered from a merged `If-None-Match`.
    pub etags: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn new(url: impl Into<String>, headers: HeaderMap) -> Self {
        let cookies = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(parse_cookie_header)
            .collect();
        let etags = headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(parse_merged_etag)
            .unwrap_or_default();
        RequestContext {
            url: url.into(),
            headers,
            cookies,
            etags,
        }
    }

    /// Replaces the cookie jar, e.g. with cookies carrying domain and path
    /// restrictions recovered by the caller.
    pub fn with_cookies(mut self, cookies: Vec<Cookie>) -> Self {
        self.cookies = cookies;
        self
    }

    /// Whether the request carries any cache validator.
    pub fn is_conditional(&self) -> bool {
        self.headers.contains_key(header::IF_NONE_MATCH)
            || self.headers.contains_key(header::IF_MODIFIED_SINCE)
    }

    /// Builds the context for one sub-request.
    pub fn for_fetch(&self, url: &str, kind: FetchKind) -> Result<RequestContext, TranscludeError> {
        let mut headers = self.headers.clone();

        let cookies = relevant_cookies(&self.cookies, url);
        if cookies.is_empty() {
            headers.remove(header::COOKIE);
        } else {
            headers.insert(
                header::COOKIE,
                HeaderValue::from_str(&cookie_string(cookies))?,
            );
        }

        match kind {
            FetchKind::ConditionalGet => {
                if headers.contains_key(header::IF_NONE_MATCH) {
                    match self.etags.get(url) {
                        Some(etag) => {
                            headers.insert(header::IF_NONE_MATCH, HeaderValue::from_str(etag)?);
                        }
                        None => {
                            headers.remove(header::IF_NONE_MATCH);
                        }
                    }
                }
            }
            FetchKind::Get => {
                headers.remove(header::IF_NONE_MATCH);
                headers.remove(header::IF_MODIFIED_SINCE);
            }
        }

        headers.insert(X_TRANSCLUDED.clone(), HeaderValue::from_str(&self.url)?);

        Ok(RequestContext {
            url: url.to_string(),
            headers,
            cookies: self.cookies.clone(),
            etags: self.etags.clone(),
        })
    }
}

/// One fetched resource. `parsed` is present only when the fetcher
/// recognised the body as a document it can transclude into.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<D> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub parsed: Option<D>,
}

impl<D> Response<D> {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>, parsed: Option<D>) -> Self {
        Response {
            status,
            headers,
            body,
            parsed,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>, parsed: Option<D>) -> Self {
        Response::new(StatusCode::OK, HeaderMap::new(), body.into(), parsed)
    }

    pub fn not_modified(headers: HeaderMap) -> Self {
        Response::new(StatusCode::NOT_MODIFIED, headers, Vec::new(), None)
    }

    /// Empty stand-in for a sub-resource that could not be included.
    pub fn unavailable() -> Self {
        Response::new(StatusCode::BAD_GATEWAY, HeaderMap::new(), Vec::new(), None)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == StatusCode::NOT_MODIFIED
    }
}
