//! HTTP transport for streaming transfers.
//!
//! The client is built once and shared by every transfer so connections are
//! pooled. Transparent decompression stays off: byte offsets used for
//! `Range` requests must match the remote representation.

use std::time::Duration;

use reqwest::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_RANGE, LAST_MODIFIED, RANGE, RETRY_AFTER,
};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use super::TransferError;
use crate::config::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_READ_TIMEOUT_SECS};

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("offline-content/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

/// A range continuation for [`HttpTransport::get`].
#[derive(Debug, Clone, Copy)]
pub struct RangeRequest<'a> {
    /// First byte wanted.
    pub offset: u64,
    /// Sent as `If-Range`; the server answers 200 with the full body if it no longer matches.
    pub validator: &'a str,
}

impl HttpTransport {
    /// Creates a transport with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Client`] if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self, TransferError> {
        Self::with_timeouts(DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_READ_TIMEOUT_SECS)
    }

    /// Creates a transport with explicit timeouts.
    ///
    /// The read timeout bounds the gap between chunks, not the whole transfer,
    /// so long audio files are not cut off.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Client`] if the client cannot be built.
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .map_err(TransferError::Client)?;
        Ok(Self { client })
    }

    /// Sends a GET, optionally continuing from a byte offset.
    ///
    /// Success statuses and `416 Range Not Satisfiable` (for range requests)
    /// are returned as responses; every other status becomes
    /// [`TransferError::HttpStatus`].
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidUrl`], [`TransferError::Network`],
    /// [`TransferError::Timeout`] or [`TransferError::HttpStatus`].
    #[instrument(skip(self, range), fields(url = %url, offset = range.map(|r| r.offset)))]
    pub async fn get(
        &self,
        url: &str,
        range: Option<RangeRequest<'_>>,
    ) -> Result<Response, TransferError> {
        let parsed = Url::parse(url).map_err(|_| TransferError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransferError::invalid_url(url));
        }

        let mut request = self.client.get(parsed);
        if let Some(range) = range {
            request = request
                .header(RANGE, format!("bytes={}-", range.offset))
                .header(IF_RANGE, range.validator);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::network(url, e))?;

        let status = response.status();
        if status.is_success() || (range.is_some() && status == StatusCode::RANGE_NOT_SATISFIABLE) {
            debug!(status = status.as_u16(), "response received");
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Err(TransferError::http_status_with_retry_after(
            url,
            status.as_u16(),
            retry_after,
        ))
    }
}

/// Strong or weak validator for `If-Range`: `ETag` first, then `Last-Modified`.
pub(crate) fn validator_of(response: &Response) -> Option<String> {
    response
        .headers()
        .get(ETAG)
        .or_else(|| response.headers().get(LAST_MODIFIED))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub(crate) fn accepts_ranges(response: &Response) -> bool {
    response.status() == StatusCode::PARTIAL_CONTENT
        || response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
}

pub(crate) fn content_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

/// Parses `Content-Range: bytes <start>-<end>/<total|*>` into `(start, total)`.
pub(crate) fn content_range(response: &Response) -> Option<(u64, Option<u64>)> {
    let raw = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range(raw)
}

fn parse_content_range(raw: &str) -> Option<(u64, Option<u64>)> {
    let rest = raw.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, _end) = range.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let total = match total.trim() {
        "*" => None,
        value => Some(value.parse::<u64>().ok()?),
    };
    Some((start, total))
}
