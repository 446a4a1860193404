//! Relay pool
//!
//! Selects relay endpoints and translates between tunnel requests and
//! carrier exchanges.

use bytes::Bytes;
use dashmap::DashMap;
use gtunnel_shared::protocol::{CARRIER_CONTENT_TYPE, OPTIONS_HEADER};
use gtunnel_shared::{Envelope, Error, RequestHead, ResponseHead, Result, TunnelOptions};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::transport::{TunnelRequest, TunnelResponse};

/// One relay endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayServer {
    pub url: String,
    pub password: Option<String>,
}

impl RelayServer {
    pub fn new(url: impl Into<String>, password: Option<String>) -> Self {
        Self {
            url: url.into(),
            password,
        }
    }
}

pub trait RelayPool: Send + Sync {
    /// `attempt` lets the pool rotate away from the server of a prior attempt.
    fn pick_server(&self, req: &TunnelRequest, attempt: usize) -> RelayServer;

    fn encode_request(
        &self,
        req: &TunnelRequest,
        server: &RelayServer,
        deadline: Duration,
    ) -> Result<Request<Bytes>>;

    fn decode_response(&self, resp: Response<Bytes>) -> Result<TunnelResponse>;

    fn toggle_bad_server(&self, server: &RelayServer);
}

/// Round-robin over a fixed relay list. Each request starts at its own
/// offset and moves one server further per attempt.
pub struct StaticPool {
    servers: Vec<RelayServer>,
    options: TunnelOptions,
    cooldown: Duration,
    /// Servers marked bad, until when.
    bad: DashMap<String, Instant>,
}

impl StaticPool {
    /// `options` supplies maxsize, sslverify and debug for every request.
    pub fn new(servers: Vec<RelayServer>, options: TunnelOptions, cooldown: Duration) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::Protocol("relay pool needs at least one server".into()));
        }
        Ok(Self {
            servers,
            options,
            cooldown,
            bad: DashMap::new(),
        })
    }

    fn is_bad(&self, server: &RelayServer, now: Instant) -> bool {
        match self.bad.get(&server.url) {
            Some(until) => *until > now,
            None => false,
        }
    }
}

impl RelayPool for StaticPool {
    fn pick_server(&self, req: &TunnelRequest, attempt: usize) -> RelayServer {
        let n = self.servers.len();
        let start = request_offset(req).wrapping_add(attempt) % n;
        let now = Instant::now();

        // all bad: fall back to plain rotation
        let idx = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| !self.is_bad(&self.servers[i], now))
            .unwrap_or(start);

        let server = self.servers[idx].clone();
        debug!("attempt {} for {} goes to {}", attempt + 1, req.uri(), server.url);
        server
    }

    fn encode_request(
        &self,
        req: &TunnelRequest,
        server: &RelayServer,
        deadline: Duration,
    ) -> Result<Request<Bytes>> {
        let options = TunnelOptions {
            deadline,
            password: server.password.clone().unwrap_or_default(),
            ..self.options.clone()
        };
        encode_carrier_request(req, server, &options)
    }

    fn decode_response(&self, resp: Response<Bytes>) -> Result<TunnelResponse> {
        decode_carrier_response(resp)
    }

    fn toggle_bad_server(&self, server: &RelayServer) {
        let until = Instant::now() + self.cooldown;
        info!("{} marked bad for {:?}", server.url, self.cooldown);
        self.bad.insert(server.url.clone(), until);
    }
}

/// Stable per request, so a retry never depends on what other requests picked.
fn request_offset(req: &TunnelRequest) -> usize {
    let mut hasher = DefaultHasher::new();
    req.method().hash(&mut hasher);
    req.uri().hash(&mut hasher);
    hasher.finish() as usize
}

/// Frames a tunnel request into a carrier POST to `server`.
pub fn encode_carrier_request(
    req: &TunnelRequest,
    server: &RelayServer,
    options: &TunnelOptions,
) -> Result<Request<Bytes>> {
    let mut head = RequestHead::new(req.method().as_str(), req.uri().to_string());
    for (name, value) in req.headers() {
        match value.to_str() {
            Ok(value) => head.headers.append(name.as_str(), value),
            Err(_) => debug!("dropping non-ASCII header {}", name),
        }
    }
    head.headers.set(OPTIONS_HEADER, options.to_header_value());

    let frame = Envelope::new(head.to_block(), req.body().clone()).encode()?;
    Request::builder()
        .method(Method::POST)
        .uri(server.url.as_str())
        .header(CONTENT_TYPE, CARRIER_CONTENT_TYPE)
        .body(Bytes::from(frame))
        .map_err(|e| Error::Protocol(format!("bad relay url {}: {}", server.url, e)))
}

/// Unframes a carrier 200 body into the tunnelled response.
pub fn decode_carrier_response(resp: Response<Bytes>) -> Result<TunnelResponse> {
    let envelope = Envelope::decode(resp.into_body())?;
    let head = ResponseHead::parse(&envelope.head)?;

    let status = StatusCode::from_u16(head.status)
        .map_err(|_| Error::Protocol(format!("invalid status {}", head.status)))?;
    let mut out = Response::new(envelope.body);
    *out.status_mut() = status;

    let headers = out.headers_mut();
    for (name, value) in head.headers.iter() {
        let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) else {
            debug!("skipping malformed header {}", name);
            continue;
        };
        headers.append(name, value);
    }
    Ok(out)
}
