//! Combining per-resource cache validators into the headers of the assembled
//! page, and recovering them from the next conditional request.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use http::{
    header::{self, HeaderValue},
    HeaderMap, StatusCode,
};
use url::form_urlencoded;

use crate::error::TranscludeError;

/// Status and headers of one contributing resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseInfo {
    pub fn new(status: StatusCode, headers: HeaderMap) -> Self {
        ResponseInfo { status, headers }
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get(header::ETAG).and_then(|v| v.to_str().ok())
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date)
    }
}

pub trait HeaderMerger: Send + Sync {
    /// Writes validators describing every resource in `contributors` into
    /// `out`, replacing whatever validators `out` already carries.
    fn merge_cache_headers(
        &self,
        contributors: &BTreeMap<String, ResponseInfo>,
        out: &mut HeaderMap,
    ) -> Result<(), TranscludeError>;
}

/// Default merge: one ETag encoding every contributor's ETag, and the latest
/// Last-Modified. Either validator is emitted only when every contributor
/// supplies one.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidatorMerge;

impl HeaderMerger for ValidatorMerge {
    fn merge_cache_headers(
        &self,
        contributors: &BTreeMap<String, ResponseInfo>,
        out: &mut HeaderMap,
    ) -> Result<(), TranscludeError> {
        out.remove(header::ETAG);
        out.remove(header::LAST_MODIFIED);
        if contributors.is_empty() {
            return Ok(());
        }

        let etags: Option<BTreeMap<&str, &str>> = contributors
            .iter()
            .map(|(url, info)| info.etag().map(|etag| (url.as_str(), etag)))
            .collect();
        if let Some(etags) = etags {
            out.insert(header::ETAG, HeaderValue::from_str(&merged_etag(&etags))?);
        }

        let dates: Option<Vec<DateTime<Utc>>> =
            contributors.values().map(ResponseInfo::last_modified).collect();
        if let Some(latest) = dates.and_then(|d| d.into_iter().max()) {
            out.insert(
                header::LAST_MODIFIED,
                HeaderValue::from_str(&format_http_date(&latest))?,
            );
        }
        Ok(())
    }
}

/// Encodes `url -> etag` pairs as a single strong ETag.
pub fn merged_etag<'a>(etags: &BTreeMap<&'a str, &'a str>) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (url, etag) in etags {
        serializer.append_pair(url, etag);
    }
    format!("\"{}\"", serializer.finish())
}

/// Inverse of [`merged_etag`]. ETags this engine did not produce decode to an
/// empty map.
pub fn parse_merged_etag(value: &str) -> BTreeMap<String, String> {
    let value = value.trim();
    let value = value.strip_prefix("W/").unwrap_or(value);
    let value = value.trim_matches('"');
    form_urlencoded::parse(value.as_bytes())
        .filter(|(url, etag)| !url.is_empty() && !etag.is_empty())
        .map(|(url, etag)| (url.into_owned(), etag.into_owned()))
        .collect()
}

pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn format_http_date(date: &DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
