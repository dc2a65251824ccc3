//! HTTP(S) streaming GET.
//!
//! Everything that touches the network goes through the [`Transport`] trait.
//! [`HttpTransport`] is the production implementation on top of a blocking
//! `reqwest` client. Tests substitute an in-memory transport to count requests
//! and inject failures.
//!
//! Besides plain GET a transport may answer HEAD requests and byte-range
//! GETs, which enable parallel archive downloads. Both have defaults that
//! report "unsupported", so a minimal transport only implements `get`.

use std::io::Read;
use std::time::Duration;

use url::Url;

use crate::errors::{Result, ToolchainError};

/// Default request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// User-Agent header for HTTP requests.
pub const DEFAULT_USER_AGENT: &str = "inference-toolchain";

/// A response body being streamed.
pub type Body = Box<dyn Read + Send>;

/// Streaming GET capability.
///
/// Implementations return the response body as a reader so callers can hash
/// and write it in chunks. Errors must be classified: connection-level faults
/// as [`ToolchainError::Network`], non-success statuses as
/// [`ToolchainError::Http`], so the retry policy can tell transient from fatal.
pub trait Transport: Send + Sync {
    /// Starts a GET request for `url` and returns its body.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Network`] or [`ToolchainError::Http`].
    fn get(&self, url: &Url) -> Result<Body>;

    /// Fetches the headers of `url` without its body.
    ///
    /// `Ok(None)` means the transport cannot tell, and callers fall back to a
    /// plain GET.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Network`] if the request fails.
    fn head(&self, url: &Url) -> Result<Option<RemoteInfo>> {
        let _ = url;
        Ok(None)
    }

    /// Starts a GET request for bytes `start..=end` of `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::RangeUnsupported`] if the answer is not the
    /// requested range, otherwise as [`Transport::get`].
    fn get_range(&self, url: &Url, start: u64, end: u64) -> Result<Body> {
        let _ = (start, end);
        Err(ToolchainError::RangeUnsupported {
            url: url.to_string(),
        })
    }
}

/// What a HEAD request revealed about a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteInfo {
    /// `Content-Length`, if the server sent one.
    pub length: Option<u64>,
    /// Whether the server sent `Accept-Ranges: bytes`.
    pub accepts_ranges: bool,
}

/// Blocking `reqwest` transport with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Creates a transport with the given timeout and user agent.
    ///
    /// The timeout bounds each request as a whole, from connect to the last
    /// body byte.
    ///
    /// # Errors
    ///
    /// Returns [`ToolchainError::Network`] if the client cannot be built.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| ToolchainError::network_with_source("<client>", e))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &Url) -> Result<Body> {
        tracing::debug!(%url, "GET");

        let response = self
            .client
            .get(url.as_str())
            .send()
            .map_err(|e| ToolchainError::network_with_source(url.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolchainError::Http {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(len) = response.content_length() {
            tracing::debug!(%url, bytes = len, "response started");
        }
        Ok(Box::new(response))
    }

    fn head(&self, url: &Url) -> Result<Option<RemoteInfo>> {
        tracing::debug!(%url, "HEAD");

        let response = self
            .client
            .head(url.as_str())
            .send()
            .map_err(|e| ToolchainError::network_with_source(url.as_str(), e))?;
        if !response.status().is_success() {
            tracing::debug!(%url, status = response.status().as_u16(), "HEAD not answered");
            return Ok(None);
        }

        let headers = response.headers();
        let header = |name: reqwest::header::HeaderName| {
            headers.get(name).and_then(|v| v.to_str().ok())
        };
        let info = RemoteInfo {
            length: header(reqwest::header::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
            accepts_ranges: header(reqwest::header::ACCEPT_RANGES)
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("bytes")),
        };
        tracing::debug!(%url, length = ?info.length, ranges = info.accepts_ranges, "remote info");
        Ok(Some(info))
    }

    fn get_range(&self, url: &Url, start: u64, end: u64) -> Result<Body> {
        tracing::trace!(%url, start, end, "GET range");

        let response = self
            .client
            .get(url.as_str())
            .header(reqwest::header::RANGE, format!("bytes={start}-{end}"))
            .send()
            .map_err(|e| ToolchainError::network_with_source(url.as_str(), e))?;

        let status = response.status();
        if status == reqwest::StatusCode::PARTIAL_CONTENT {
            return Ok(Box::new(response));
        }
        if status.is_success() {
            // A 200 carries the whole file, not the range.
            return Err(ToolchainError::RangeUnsupported {
                url: url.to_string(),
            });
        }
        Err(ToolchainError::Http {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

/// Reads a whole (small) response body, e.g. a manifest.
///
/// Read failures mid-body are reported as [`ToolchainError::Network`] so they
/// are retried like connection failures.
///
/// # Errors
///
/// Propagates transport errors and mid-body read failures.
pub fn get_bytes(transport: &dyn Transport, url: &Url) -> Result<Vec<u8>> {
    let mut body = transport.get(url)?;
    let mut buf = Vec::new();
    body.read_to_end(&mut buf)
        .map_err(|e| ToolchainError::network_with_source(url.as_str(), e))?;
    Ok(buf)
}
