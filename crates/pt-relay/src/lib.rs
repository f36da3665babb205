//! HTTP client for the piping relay.
//!
//! The relay pairs, per path, the next POST with the next GET and streams the
//! POST body into the GET response. This crate wraps everything the tunnel
//! needs from HTTP: the two relay operations (`send`, `get`), header
//! injection, insecure-TLS and custom-DNS construction options, and URL
//! joining for sub-paths.
//!
//! No default request timeout is installed — relay streams live for the
//! lifetime of a tunnel session. Callers that need a deadline (handshake and
//! rendezvous paths) wrap individual calls in [`with_deadline`].

mod dns;

use std::future::Future;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
pub use reqwest::{Body, Response, StatusCode, Url};

/// Default content type for relay uploads.
pub const OCTET_STREAM_MIME_TYPE: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// One HTTP header pair, applied verbatim to every relay request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderKeyValue {
    pub key: String,
    pub value: String,
}

/// Parse `name:value` strings (as passed with `-H`) into header pairs.
///
/// The name must be non-empty; the value is everything after the first `:`
/// and may itself contain colons.
pub fn parse_key_value_strings(raw: &[String]) -> Result<Vec<HeaderKeyValue>, RelayError> {
    let mut headers = Vec::with_capacity(raw.len());
    for s in raw {
        let Some((key, value)) = s.split_once(':') else {
            return Err(RelayError::InvalidHeader(s.clone()));
        };
        if key.is_empty() {
            return Err(RelayError::InvalidHeader(s.clone()));
        }
        headers.push(HeaderKeyValue {
            key: key.to_owned(),
            value: value.to_owned(),
        });
    }
    Ok(headers)
}

/// Return `headers` with `Content-Type: <mime>` prepended.
///
/// Used by the mux layers to tag their handshake and stream requests
/// (`application/pmux`, `application/yamux`) without touching the caller's
/// header set.
pub fn headers_with_content_type(headers: &[HeaderKeyValue], mime: &str) -> Vec<HeaderKeyValue> {
    let mut out = Vec::with_capacity(headers.len() + 1);
    out.push(HeaderKeyValue {
        key: "Content-Type".to_owned(),
        value: mime.to_owned(),
    });
    out.extend_from_slice(headers);
    out
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Thin wrapper around `reqwest::Client` with the relay's two operations.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    write_buf_size: usize,
    read_buf_size: usize,
}

/// Construction options for [`RelayClient`].
#[derive(Debug, Clone)]
pub struct RelayClientBuilder {
    insecure: bool,
    write_buf_size: usize,
    read_buf_size: usize,
    dns_server: Option<String>,
}

impl Default for RelayClientBuilder {
    fn default() -> Self {
        Self {
            insecure: false,
            write_buf_size: 4096,
            read_buf_size: 4096,
            dns_server: None,
        }
    }
}

impl RelayClientBuilder {
    /// Accept invalid TLS certificates (like `curl -k`).
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Upload-side buffer size: sizes the duplex's in-process pipe and the
    /// chunking of the streaming POST body.
    pub fn write_buf_size(mut self, size: usize) -> Self {
        self.write_buf_size = size.max(1);
        self
    }

    /// Download-side read-buffer size.
    pub fn read_buf_size(mut self, size: usize) -> Self {
        self.read_buf_size = size.max(1);
        self
    }

    /// Route name resolution through a custom UDP DNS server (`host:port`).
    pub fn dns_server(mut self, server: Option<String>) -> Self {
        self.dns_server = server;
        self
    }

    pub fn build(self) -> Result<RelayClient, RelayError> {
        let mut builder = reqwest::Client::builder();
        if self.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(server) = &self.dns_server {
            builder = builder.dns_resolver(std::sync::Arc::new(dns::UdpResolver::new(server)?));
        }
        let http = builder.build().map_err(RelayError::Http)?;
        Ok(RelayClient {
            http,
            write_buf_size: self.write_buf_size,
            read_buf_size: self.read_buf_size,
        })
    }
}

impl RelayClient {
    pub fn builder() -> RelayClientBuilder {
        RelayClientBuilder::default()
    }

    pub fn write_buf_size(&self) -> usize {
        self.write_buf_size
    }

    pub fn read_buf_size(&self) -> usize {
        self.read_buf_size
    }

    /// POST `body` to `url`, streaming.
    ///
    /// `Content-Type: application/octet-stream` is set unless `headers`
    /// carries its own content type.
    pub async fn send(
        &self,
        headers: &[HeaderKeyValue],
        url: Url,
        body: Body,
    ) -> Result<Response, RelayError> {
        let mut req = self.http.post(url).body(body);
        let has_content_type = headers
            .iter()
            .any(|kv| kv.key.eq_ignore_ascii_case("content-type"));
        if !has_content_type {
            req = req.header(CONTENT_TYPE, OCTET_STREAM_MIME_TYPE);
        }
        for kv in headers {
            req = req.header(&kv.key, &kv.value);
        }
        req.send().await.map_err(RelayError::Http)
    }

    /// GET `url`.
    pub async fn get(&self, headers: &[HeaderKeyValue], url: Url) -> Result<Response, RelayError> {
        let mut req = self.http.get(url);
        for kv in headers {
            req = req.header(&kv.key, &kv.value);
        }
        req.send().await.map_err(RelayError::Http)
    }
}

/// Reject non-2xx relay responses.
pub fn ensure_success(res: Response) -> Result<Response, RelayError> {
    let status = res.status();
    if status.is_success() {
        Ok(res)
    } else {
        Err(RelayError::Status {
            status,
            url: res.url().clone(),
        })
    }
}

/// Run `fut` under a deadline; expiry becomes [`RelayError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, RelayError>
where
    F: Future<Output = Result<T, RelayError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout(deadline)),
    }
}

/// Append path segments (separated by `/`) to `base`.
pub fn url_join(base: &Url, segments: &str) -> Result<Url, RelayError> {
    let mut url = base.clone();
    {
        let mut parts = url
            .path_segments_mut()
            .map_err(|()| RelayError::InvalidUrl(base.to_string()))?;
        parts.pop_if_empty();
        for segment in segments.split('/').filter(|s| !s.is_empty()) {
            parts.push(segment);
        }
    }
    Ok(url)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status} from {url}")]
    Status { status: StatusCode, url: Url },
    #[error("unexpected content type '{0}'")]
    UnexpectedContentType(String),
    #[error("invalid header format '{0}'")]
    InvalidHeader(String),
    #[error("invalid DNS server address '{0}'")]
    InvalidDnsServer(String),
    #[error("invalid url '{0}'")]
    InvalidUrl(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl RelayError {
    /// Timeout-class errors are expected on long-poll paths: the caller
    /// resets its backoff instead of advancing it.
    pub fn is_timeout(&self) -> bool {
        match self {
            RelayError::Timeout(_) => true,
            RelayError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}
