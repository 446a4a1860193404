//! Carrier HTTP transport
//!
//! Sends framed carrier requests to relays over a pooled reqwest client.
//! Relay host names resolve through the blacklist so excluded peers are
//! never dialed again until their entry expires.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::error::Error as StdError;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::blacklist::IpBlacklist;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierErrorKind {
    /// The exchange ran past its deadline.
    Timeout,
    /// The socket failed while reading.
    Read,
    /// The peer closed the connection mid-message.
    UnexpectedEof,
    Other,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct CarrierError {
    pub kind: CarrierErrorKind,
    /// Address of the relay peer, when known.
    pub peer: Option<SocketAddr>,
    pub message: String,
}

impl CarrierError {
    pub fn new(kind: CarrierErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            peer: None,
            message: message.into(),
        }
    }

    pub fn with_peer(mut self, peer: Option<SocketAddr>) -> Self {
        self.peer = peer;
        self
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, CarrierErrorKind::Timeout | CarrierErrorKind::Read)
    }
}

/// Remote address a carrier response was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Connection teardown every carrier must support.
pub trait ConnectionCloser: Send + Sync {
    fn close_all(&self);

    /// Returns false when nothing could be closed.
    fn close_by_remote_host(&self, host: &str) -> bool;
}

#[async_trait]
pub trait CarrierTransport: ConnectionCloser {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, CarrierError>;
}

#[derive(Debug, Clone)]
pub struct CarrierSettings {
    pub connect_timeout: Duration,
    /// Whole-exchange bound; the relay's own deadline plus slack.
    pub timeout: Duration,
    pub accept_invalid_certs: bool,
}

impl Default for CarrierSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            accept_invalid_certs: false,
        }
    }
}

pub struct HttpCarrier {
    client: RwLock<reqwest::Client>,
    settings: CarrierSettings,
    resolver: Arc<BlacklistResolver>,
}

impl HttpCarrier {
    pub fn new(settings: CarrierSettings, blacklist: Arc<IpBlacklist>) -> reqwest::Result<Self> {
        let resolver = Arc::new(BlacklistResolver { blacklist });
        let client = build_client(&settings, &resolver)?;
        Ok(Self {
            client: RwLock::new(client),
            settings,
            resolver,
        })
    }

    fn client(&self) -> reqwest::Client {
        match self.client.read() {
            Ok(client) => client.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swaps in a fresh client; the old pool drops with its last in-flight request.
    fn rebuild(&self) -> bool {
        let fresh = match build_client(&self.settings, &self.resolver) {
            Ok(client) => client,
            Err(e) => {
                error!("failed to rebuild carrier client: {}", e);
                return false;
            }
        };
        match self.client.write() {
            Ok(mut client) => *client = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        true
    }
}

impl ConnectionCloser for HttpCarrier {
    fn close_all(&self) {
        debug!("closing all carrier connections");
        self.rebuild();
    }

    // reqwest cannot evict a single host, so this drops the whole pool
    fn close_by_remote_host(&self, host: &str) -> bool {
        debug!("closing carrier connections to {}", host);
        self.rebuild()
    }
}

#[async_trait]
impl CarrierTransport for HttpCarrier {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, CarrierError> {
        let (parts, body) = req.into_parts();
        let hint = literal_peer(&parts.uri);

        let resp = self
            .client()
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .send()
            .await
            .map_err(|e| classify(&e).with_peer(hint))?;

        let peer = resp.remote_addr().or(hint);
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| classify(&e).with_peer(peer))?;

        let mut out = Response::new(body);
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        if let Some(peer) = peer {
            out.extensions_mut().insert(PeerAddr(peer));
        }
        Ok(out)
    }
}

fn build_client(settings: &CarrierSettings, resolver: &Arc<BlacklistResolver>) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.timeout)
        .danger_accept_invalid_certs(settings.accept_invalid_certs)
        .redirect(reqwest::redirect::Policy::none())
        .dns_resolver(resolver.clone())
        .build()
}

fn classify(err: &reqwest::Error) -> CarrierError {
    let kind = if err.is_timeout() {
        CarrierErrorKind::Timeout
    } else if err.is_connect() {
        CarrierErrorKind::Other
    } else {
        match io_error_kind(err) {
            Some(io::ErrorKind::UnexpectedEof) => CarrierErrorKind::UnexpectedEof,
            Some(io::ErrorKind::TimedOut) => CarrierErrorKind::Timeout,
            Some(_) => CarrierErrorKind::Read,
            None => CarrierErrorKind::Other,
        }
    };

    let message = match kind {
        CarrierErrorKind::UnexpectedEof => "unexpected EOF".to_string(),
        _ => err.to_string(),
    };
    CarrierError::new(kind, message)
}

fn io_error_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        source = cause.source();
    }
    None
}

/// Peer address when the relay URL names an IP literal.
fn literal_peer(uri: &http::Uri) -> Option<SocketAddr> {
    let host = uri.host()?.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = host.parse().ok()?;
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("http") => 80,
        _ => 443,
    });
    Some(SocketAddr::new(ip, port))
}

struct BlacklistResolver {
    blacklist: Arc<IpBlacklist>,
}

impl Resolve for BlacklistResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(resolve_allowed(self.blacklist.clone(), name.as_str().to_string()))
    }
}

async fn resolve_allowed(
    blacklist: Arc<IpBlacklist>,
    host: String,
) -> Result<Addrs, Box<dyn StdError + Send + Sync>> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0)).await?.collect();
    let allowed = filter_blacklisted(&blacklist, resolved);
    if allowed.is_empty() {
        warn!("every address of {} is blacklisted", host);
        return Err(format!("all addresses of {host} are blacklisted").into());
    }
    Ok(Box::new(allowed.into_iter()))
}

fn filter_blacklisted(blacklist: &IpBlacklist, addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
    addrs
        .into_iter()
        .filter(|addr| !blacklist.contains(&addr.ip()))
        .collect()
}
