//! Tunnel transport
//!
//! Drives a bounded number of attempts against the relay pool for each
//! request, classifying every failure into retry, reroute or return.
//! Attempts for a single request are strictly sequential so that bad-server
//! marks and blacklist writes are visible to the next attempt.

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, Uri};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::blacklist::Blacklist;
use crate::carrier::{CarrierError, CarrierErrorKind, CarrierTransport, PeerAddr};
use crate::fault::{FaultClassifier, RelayFault, UrlFetchMarkers};
use crate::pool::{RelayPool, RelayServer};

pub type TunnelRequest = Request<Bytes>;
pub type TunnelResponse = Response<Bytes>;

/// Exclusion applied to a peer that timed out.
pub const TIMEOUT_BLACKLIST_TTL: Duration = Duration::from_secs(5 * 60);

/// Exclusion applied to a peer that answered like something other than a relay.
pub const REJECTED_BLACKLIST_TTL: Duration = Duration::from_secs(8 * 60 * 60);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("encode carrier request: {0}")]
    Encode(#[source] gtunnel_shared::Error),

    #[error("decode carrier response: {0}")]
    Decode(#[source] gtunnel_shared::Error),

    #[error(transparent)]
    Carrier(#[from] CarrierError),

    #[error("no outcome after {0} attempts")]
    Unreachable(usize),
}

/// Method and URI of the request a decoded response answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalRequest {
    pub method: Method,
    pub uri: Uri,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Attempts per request; the last attempt's outcome is always returned.
    pub retries: usize,
    /// Fixed delay after a saturation signal.
    pub retry_delay: Duration,
    /// Deadline handed to the relay, also slept after a deadline marker.
    pub deadline: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_delay: Duration::from_secs(1),
            deadline: gtunnel_shared::protocol::DEFAULT_DEADLINE,
        }
    }
}

pub struct TunnelTransport {
    carrier: Arc<dyn CarrierTransport>,
    pool: Arc<dyn RelayPool>,
    blacklist: Option<Arc<dyn Blacklist>>,
    classifier: Arc<dyn FaultClassifier>,
    config: TransportConfig,
}

impl TunnelTransport {
    pub fn new(
        carrier: Arc<dyn CarrierTransport>,
        pool: Arc<dyn RelayPool>,
        config: TransportConfig,
    ) -> Self {
        Self {
            carrier,
            pool,
            blacklist: None,
            classifier: Arc::new(UrlFetchMarkers),
            config,
        }
    }

    /// Enables peer blacklisting on timeouts and rejecting status codes.
    pub fn with_blacklist(mut self, blacklist: Arc<dyn Blacklist>) -> Self {
        self.blacklist = Some(blacklist);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FaultClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub async fn round_trip(&self, req: TunnelRequest) -> Result<TunnelResponse, TransportError> {
        let retries = self.config.retries;

        for attempt in 0..retries {
            let last = attempt + 1 == retries;
            let server = self.pool.pick_server(&req, attempt);
            debug!("{} {} via {} (attempt {})", req.method(), req.uri(), server.url, attempt + 1);

            let carrier_req = self
                .pool
                .encode_request(&req, &server, self.config.deadline)
                .map_err(TransportError::Encode)?;

            let resp = match self.carrier.round_trip(carrier_req).await {
                Ok(resp) => resp,
                Err(err) => {
                    if err.is_timeout() {
                        self.drop_timed_out_peer(&err);
                        return Err(err.into());
                    }
                    if last {
                        return Err(err.into());
                    }
                    if err.kind == CarrierErrorKind::UnexpectedEof {
                        warn!("{} closed the carrier mid-exchange, closing connections", server.url);
                        self.carrier.close_all();
                        return Err(err.into());
                    }
                    warn!("carrier request to {} failed: {}, retrying", server.url, err);
                    continue;
                }
            };

            if resp.status() != StatusCode::OK {
                if last {
                    return Ok(resp);
                }
                match resp.status() {
                    StatusCode::SERVICE_UNAVAILABLE => {
                        warn!("{} is saturated, marking bad", server.url);
                        self.pool.toggle_bad_server(&server);
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                    StatusCode::FOUND
                    | StatusCode::BAD_GATEWAY
                    | StatusCode::NOT_FOUND
                    | StatusCode::METHOD_NOT_ALLOWED => {
                        self.reject_peer(&server, &resp);
                    }
                    _ => return Ok(resp),
                }
                continue;
            }

            let mut decoded = self.pool.decode_response(resp).map_err(TransportError::Decode)?;
            decoded.extensions_mut().insert(OriginalRequest {
                method: req.method().clone(),
                uri: req.uri().clone(),
            });

            if last || decoded.status() != StatusCode::BAD_GATEWAY {
                return Ok(decoded);
            }

            match self.classifier.classify(decoded.body()) {
                Some(RelayFault::DeadlineExceeded) => {
                    warn!("{} hit its fetch deadline, waiting {:?}", server.url, self.config.deadline);
                    tokio::time::sleep(self.config.deadline).await;
                }
                Some(RelayFault::OverQuota) => {
                    warn!("{} is over quota, marking bad", server.url);
                    self.pool.toggle_bad_server(&server);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Some(RelayFault::FetchClosed) => {
                    warn!("{} lost its fetch channel, retrying", server.url);
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                // a genuine origin 502
                None => return Ok(decoded),
            }
        }

        Err(TransportError::Unreachable(retries))
    }

    fn drop_timed_out_peer(&self, err: &CarrierError) {
        self.carrier.close_all();
        if let (Some(blacklist), Some(peer)) = (&self.blacklist, err.peer) {
            warn!("{} timed out, blacklisting for {:?}", peer.ip(), TIMEOUT_BLACKLIST_TTL);
            blacklist.blacklist(peer.ip(), TIMEOUT_BLACKLIST_TTL);
        }
    }

    fn reject_peer(&self, server: &RelayServer, resp: &Response<Bytes>) {
        let Some(blacklist) = &self.blacklist else {
            return;
        };
        let Some(PeerAddr(peer)) = resp.extensions().get::<PeerAddr>().copied() else {
            debug!("{} answered {} with no known peer", server.url, resp.status());
            return;
        };

        let ip = peer.ip();
        warn!("{} answered {} from {}, blacklisting for {:?}", server.url, resp.status(), ip, REJECTED_BLACKLIST_TTL);
        blacklist.blacklist(ip, REJECTED_BLACKLIST_TTL);
        if !self.carrier.close_by_remote_host(&ip.to_string()) {
            warn!("no pooled connections to {} were closed", ip);
        }
    }
}
