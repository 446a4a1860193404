//! Outbound fetch facility used by the relay.
//!
//! Truncation and the raw (undecoded) body are part of the result type so
//! the handler never has to dig them out of a response object.

use std::error::Error as StdError;
use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use gtunnel_shared::{HeaderList, RequestHead};
use thiserror::Error;

/// Failure classes the relay reacts to differently. The display texts are
/// what the client-side classifier matches on.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch failed: RESPONSE_TOO_LARGE")]
    TooLarge,

    #[error("fetch failed: Over quota")]
    OverQuota,

    #[error("fetch failed: urlfetch: CLOSED")]
    Closed,

    #[error("fetch failed: DEADLINE_EXCEEDED ({0})")]
    DeadlineExceeded(String),

    #[error("fetch failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub deadline: Duration,
    /// Bodies longer than this are cut and flagged `truncated`.
    pub maxsize: usize,
    pub allow_invalid_certs: bool,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: u16,
    pub reason: String,
    pub headers: HeaderList,
    /// Body exactly as the origin sent it, content-encoding untouched.
    pub body: Bytes,
    pub truncated: bool,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        head: &RequestHead,
        body: Bytes,
        settings: &FetchSettings,
    ) -> Result<FetchResult, FetchError>;
}

/// Headers the HTTP client manages itself.
const CLIENT_MANAGED: &[&str] = &[
    "host",
    "connection",
    "proxy-connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
    "te",
    "upgrade",
];

/// [`Fetcher`] backed by reqwest. Redirects are returned to the caller, not
/// followed.
pub struct ReqwestFetcher {
    verifying: reqwest::Client,
    lenient: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let build = |accept_invalid: bool| {
            reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .danger_accept_invalid_certs(accept_invalid)
                .build()
                .map_err(|e| FetchError::Other(e.to_string()))
        };
        Ok(Self {
            verifying: build(false)?,
            lenient: build(true)?,
        })
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        head: &RequestHead,
        body: Bytes,
        settings: &FetchSettings,
    ) -> Result<FetchResult, FetchError> {
        let method = reqwest::Method::from_bytes(head.method.as_bytes())
            .map_err(|e| FetchError::Other(e.to_string()))?;
        let client = if settings.allow_invalid_certs {
            &self.lenient
        } else {
            &self.verifying
        };

        let mut builder = client.request(method, &head.target).timeout(settings.deadline);
        for (name, value) in head.headers.iter() {
            if CLIENT_MANAGED.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(classify)?;
        let status = resp.status();
        let headers: HeaderList = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v)))
            .collect();

        let cap = body_cap(head, settings.maxsize);
        let mut buf = BytesMut::new();
        let mut truncated = false;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            let room = cap - buf.len();
            if chunk.len() > room {
                buf.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(FetchResult {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: buf.freeze(),
            truncated,
        })
    }
}

/// Bytes kept before a body counts as truncated. Byte ranges are inclusive,
/// so the `bytes=S-(S+maxsize)` window the relay asks for is one byte longer.
fn body_cap(head: &RequestHead, maxsize: usize) -> usize {
    if head.headers.contains("Range") {
        maxsize.saturating_add(1)
    } else {
        maxsize
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::DeadlineExceeded(err.to_string())
    } else if channel_closed(&err) {
        FetchError::Closed
    } else {
        FetchError::Other(err.to_string())
    }
}

fn channel_closed(err: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = e.source();
    }
    false
}
