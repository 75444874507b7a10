//! Transports for remote module sources.
//!
//! Remote sources never talk to the network directly; they go through a
//! [`Fetcher`]. The session installs [`HttpFetcher`]; tests install a
//! [`MemoryFetcher`] preloaded with the documents a source will ask for.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;

/// A fetched document.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no transport for {0}")]
    Unsupported(String),

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("nothing served at {0}")]
    Missing(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub trait Fetcher {
    /// Fetch `url`, giving up after `timeout`.
    fn fetch(&self, url: &str, timeout: Duration) -> Result<Fetched, FetchError>;
}

/// Blocking HTTP(S) transport.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<Fetched, FetchError> {
        let scheme = url.split_once("://").map(|(s, _)| s.to_ascii_lowercase());
        if !matches!(scheme.as_deref(), Some("http" | "https")) {
            return Err(FetchError::Unsupported(url.to_string()));
        }
        tracing::debug!(url, ?timeout, "fetching");
        let response = self.client.get(url).timeout(timeout).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes()?.to_vec();
        Ok(Fetched { content_type, body })
    }
}

/// In-memory transport keyed by exact URL.
#[derive(Default)]
pub struct MemoryFetcher {
    documents: RefCell<HashMap<String, Fetched>>,
    requests: RefCell<Vec<(String, Duration)>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, content_type: Option<&str>, body: impl Into<Vec<u8>>) {
        self.documents.borrow_mut().insert(
            url.to_string(),
            Fetched {
                content_type: content_type.map(str::to_string),
                body: body.into(),
            },
        );
    }

    /// Every URL requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().iter().map(|(url, _)| url.clone()).collect()
    }

    /// The timeout each request was made with, in request order.
    pub fn timeouts(&self) -> Vec<Duration> {
        self.requests.borrow().iter().map(|(_, t)| *t).collect()
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch(&self, url: &str, timeout: Duration) -> Result<Fetched, FetchError> {
        self.requests.borrow_mut().push((url.to_string(), timeout));
        self.documents
            .borrow()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Missing(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_fetcher_records_requests() {
        let fetcher = MemoryFetcher::new();
        fetcher.insert("http://h/a.py", Some("text/plain"), "x = 1\n");
        let doc = fetcher.fetch("http://h/a.py", Duration::from_secs(1)).unwrap();
        assert_eq!(doc.body, b"x = 1\n");
        assert!(matches!(
            fetcher.fetch("http://h/b.py", Duration::from_secs(1)),
            Err(FetchError::Missing(_))
        ));
        assert_eq!(fetcher.requests(), vec!["http://h/a.py", "http://h/b.py"]);
        assert_eq!(fetcher.timeouts(), vec![Duration::from_secs(1); 2]);
    }

    #[test]
    fn test_http_fetcher_refuses_other_schemes() {
        let fetcher = HttpFetcher::new("encap-test").unwrap();
        let err = fetcher.fetch("ftp://h/a.py", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, FetchError::Unsupported(_)));
    }
}
