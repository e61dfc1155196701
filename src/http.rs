//! Request and response values exchanged between the host, the worker and the network.

use bytes::Bytes;
use reqwest::Url;

use crate::error::{Error, Result};

/// How the page issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation; eligible for the shell fallback.
    Navigate,
    /// Any other fetch (scripts, images, audio, media).
    #[default]
    Subresource,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    /// Absolute request URL.
    pub url: Url,
    /// HTTP method, upper case.
    pub method: String,
    /// Navigation or subresource.
    pub mode: RequestMode,
    /// Headers forwarded to the network.
    pub headers: Vec<(String, String)>,
    /// Request body; empty for `GET`.
    pub body: Bytes,
}

impl Request {
    /// Creates a subresource `GET` request.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            mode: RequestMode::Subresource,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a navigation `GET` request.
    #[must_use]
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Parses `url` into a subresource `GET` request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `url` is not an absolute URL.
    pub fn parse(url: &str) -> Result<Self> {
        Url::parse(url).map(Self::get).map_err(|e| Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_ascii_uppercase();
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Key under which this request is stored in a cache.
    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }

    /// Returns `true` for top-level navigations.
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Only network schemes with `GET` can be keyed reliably in cache storage.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https") && self.method == "GET"
    }
}

/// Normalizes a URL into its cache key (the full URL without fragment).
#[must_use]
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Fetched from the network during this request.
    Network,
    /// Served from cache storage.
    Cache,
    /// The cached shell page served because the network failed.
    ShellFallback,
}

impl ResponseSource {
    /// Short label used in diagnostics headers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cache => "cache",
            Self::ShellFallback => "shell-fallback",
        }
    }
}

/// A response returned to the page or persisted in a cache.
///
/// Not `Clone`: a body is handed out once. Call [`Response::duplicate`]
/// for the second copy before persisting one.
#[derive(Debug)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Origin of this response.
    pub source: ResponseSource,
    body: Bytes,
}

impl Response {
    /// Creates a network response.
    #[must_use]
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            source: ResponseSource::Network,
            body: body.into(),
        }
    }

    /// Creates a `200` response with no headers.
    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, Vec::new(), body)
    }

    /// Tags the response with its origin.
    #[must_use]
    pub fn with_source(mut self, source: ResponseSource) -> Self {
        self.source = source;
        self
    }

    /// Only an exact `200` counts as success for caching purposes.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Produces an independent copy so one can be returned and the other stored.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            status: self.status,
            headers: self.headers.clone(),
            source: self.source,
            body: self.body.clone(),
        }
    }

    /// Borrows the body.
    #[must_use]
    pub const fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consumes the response, yielding the body.
    #[must_use]
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Returns `true` if the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Looks up a header value, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
