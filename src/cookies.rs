//! Cookie visibility rules used when folding request cookies into resource
//! identity and when building sub-request `Cookie` headers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// A cookie as seen by the incoming request.
///
/// `domain` and `path` restrict which sub-resources the cookie is forwarded
/// to. A cookie without a domain is visible to every host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Whether this cookie would be sent to `url`.
    pub fn is_visible_to(&self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or_default();
        let domain_ok = match &self.domain {
            Some(domain) => domain_match(host, domain),
            None => true,
        };
        let path_ok = match &self.path {
            Some(path) => url.path().starts_with(path.as_str()),
            None => true,
        };
        domain_ok && path_ok
    }

    fn canonical(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(domain) = self.domain.as_ref().filter(|d| d.starts_with('.')) {
            out.push_str(";domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str(";path=");
            out.push_str(path);
        }
        out
    }
}

/// `host` equals `domain`, or `domain` is a dotted suffix of `host`.
pub fn domain_match(host: &str, domain: &str) -> bool {
    let host = host.to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();
    host == domain || (domain.starts_with('.') && host.ends_with(&domain))
}

/// Parses a `Cookie` request header value (`a=1; b=2`). Pairs without `=`
/// are skipped.
pub fn parse_cookie_header(value: &str) -> Vec<Cookie> {
    value
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(Cookie::new(name, value.trim().trim_matches('"')))
        })
        .collect()
}

pub fn relevant_cookies<'a>(jar: &'a [Cookie], url: &str) -> Vec<&'a Cookie> {
    match Url::parse(url) {
        Ok(parsed) => jar.iter().filter(|c| c.is_visible_to(&parsed)).collect(),
        Err(e) => {
            tracing::debug!("[Cookies] {url} is not an absolute URL ({e}), forwarding no cookies");
            Vec::new()
        }
    }
}

/// Flattens cookies into a `Cookie` header value.
pub fn cookie_string<'a>(cookies: impl IntoIterator<Item = &'a Cookie>) -> String {
    cookies
        .into_iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Stable digest of the cookies visible to `url`. Empty when none are.
pub fn cookie_fingerprint(jar: &[Cookie], url: &str) -> String {
    let relevant = relevant_cookies(jar, url);
    if relevant.is_empty() {
        return String::new();
    }
    let merged = relevant
        .iter()
        .map(|c| c.canonical())
        .collect::<Vec<_>>()
        .join(",");
    hex::encode(Sha256::digest(merged.as_bytes()))
}
