//! Relay request handling.
//!
//! One carrier request goes through: unwrap the envelope, pull the tunnel
//! options, fetch with bounded retry, rewrite and maybe recompress the
//! response, then wrap it back into an image-typed carrier response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, Response, StatusCode, Uri};
use axum::response::IntoResponse;
use bytes::Bytes;
use gtunnel_shared::protocol::{CARRIER_CONTENT_TYPE, OPTIONS_HEADER};
use gtunnel_shared::{encode_header_block, Envelope, HeaderList, RequestHead, ResponseHead, TunnelOptions};
use tracing::{error, info, warn};

use crate::config::{RelayConfig, FETCH_ATTEMPTS};
use crate::content::{self, Recompression, RECOMPRESS_THRESHOLD};
use crate::fetch::{FetchError, FetchResult, FetchSettings, Fetcher};
use crate::metrics::{Metrics, RetryCause};

/// What the relay knows about an incoming carrier request.
#[derive(Debug, Clone)]
pub struct CarrierRequest {
    pub remote_addr: Option<SocketAddr>,
    /// Carrier arrived over TLS, directly or through the platform front end.
    pub tls: bool,
    /// Host the carrier was addressed to, echoed in error envelopes.
    pub host: String,
    pub body: Bytes,
}

/// Request rebuilt from the envelope.
#[derive(Debug)]
struct InboundRequest {
    head: RequestHead,
    path: String,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
    tls: bool,
}

/// Failure answered with an error envelope.
#[derive(Debug)]
struct Rejection {
    status: StatusCode,
    error: String,
}

impl Rejection {
    fn new(status: StatusCode, error: impl ToString) -> Self {
        Self {
            status,
            error: error.to_string(),
        }
    }
}

pub struct RelayHandler<F> {
    fetcher: F,
    config: RelayConfig,
    metrics: Metrics,
}

impl<F: Fetcher> RelayHandler<F> {
    pub fn new(fetcher: F, config: RelayConfig, metrics: Metrics) -> Self {
        Self {
            fetcher,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Answer one carrier request. Always produces a carrier response; any
    /// failure is reported inside the envelope.
    pub async fn handle(&self, carrier: CarrierRequest) -> Response<Body> {
        let start = Instant::now();
        let host = carrier.host.clone();

        let (head, body) = match self.relay(carrier).await {
            Ok(relayed) => relayed,
            Err(rejection) => {
                warn!("Rejected carrier request: {} ({})", rejection.error, rejection.status);
                self.error_envelope(&host, &rejection)
            }
        };

        let latency_us = start.elapsed().as_micros() as u64;
        self.metrics
            .record_exchange(head.status, latency_us, body.len() as u64)
            .await;

        match wrap(&head, body) {
            Ok(resp) => resp,
            Err(e) => {
                error!("Failed to frame response: {}", e);
                let rejection = Rejection::new(StatusCode::BAD_GATEWAY, e);
                let (head, body) = self.error_envelope(&host, &rejection);
                wrap(&head, body).unwrap_or_else(|e| {
                    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
                })
            }
        }
    }

    async fn relay(&self, carrier: CarrierRequest) -> Result<(ResponseHead, Bytes), Rejection> {
        let mut req = unwrap_request(carrier)?;

        let options = req
            .head
            .headers
            .get(OPTIONS_HEADER)
            .map(TunnelOptions::parse)
            .unwrap_or_default();
        req.head.headers.remove(OPTIONS_HEADER);

        let accept_encoding = normalize_accept_encoding(&mut req.head.headers);

        if options.debug {
            info!(?req, "Parsed request");
        }

        self.authorize(&options)?;

        let settings = FetchSettings {
            deadline: options.deadline,
            maxsize: options.maxsize,
            allow_invalid_certs: !options.sslverify,
        };
        let fetched = self
            .fetch_with_retry(&mut req.head, req.body.clone(), &settings)
            .await
            .map_err(|e| Rejection::new(StatusCode::BAD_GATEWAY, e))?;

        let mut head = ResponseHead {
            status: fetched.status,
            reason: fetched.reason,
            headers: fetched.headers,
        };
        rewrite_response_headers(&mut head.headers, fetched.body.len());
        let body = self
            .reencode(&mut head.headers, fetched.body, &req.path, &accept_encoding)
            .map_err(|e| Rejection::new(StatusCode::BAD_GATEWAY, e))?;

        if options.debug {
            info!(?head, body_len = body.len(), "Write response");
        }

        info!(
            "{} \"{} {} HTTP/1.1\" {} {}{}",
            req.remote_addr.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
            req.head.method,
            req.head.target,
            head.status,
            head.headers.get("Content-Length").unwrap_or("-"),
            if req.tls { " tls" } else { "" },
        );

        Ok((head, body))
    }

    fn authorize(&self, options: &TunnelOptions) -> Result<(), Rejection> {
        if self.config.password.is_empty() {
            return Ok(());
        }
        if options.password.is_empty() {
            return Err(Rejection::new(StatusCode::FORBIDDEN, "relay password required"));
        }
        if options.password != self.config.password {
            return Err(Rejection::new(StatusCode::FORBIDDEN, "relay password is wrong"));
        }
        Ok(())
    }

    async fn fetch_with_retry(
        &self,
        head: &mut RequestHead,
        body: Bytes,
        settings: &FetchSettings,
    ) -> Result<FetchResult, FetchError> {
        let mut last_err = FetchError::Other("no fetch attempted".into());

        for _ in 0..FETCH_ATTEMPTS {
            let err = match self.fetcher.fetch(head, body.clone(), settings).await {
                Ok(result) if !result.truncated => return Ok(result),
                Ok(_) => FetchError::TooLarge,
                Err(e) => e,
            };

            match &err {
                FetchError::TooLarge => {
                    warn!(url = %head.target, deadline = ?settings.deadline, "{}", err);
                    self.metrics.record_retry(RetryCause::TooLarge);
                    let range = match head.headers.get("Range") {
                        Some(range) => content::clamp_range(range, settings.maxsize),
                        None => format!("bytes=0-{}", settings.maxsize),
                    };
                    head.headers.set("Range", range);
                }
                FetchError::OverQuota => {
                    warn!(url = %head.target, deadline = ?settings.deadline, "{}", err);
                    self.metrics.record_retry(RetryCause::OverQuota);
                    tokio::time::sleep(self.config.overquota_delay).await;
                }
                FetchError::Closed => {
                    warn!(url = %head.target, deadline = ?settings.deadline, "{}", err);
                    self.metrics.record_retry(RetryCause::Closed);
                    tokio::time::sleep(self.config.closed_delay).await;
                }
                _ => {
                    error!(url = %head.target, deadline = ?settings.deadline, "{}", err);
                    return Err(err);
                }
            }
            last_err = err;
        }

        Err(last_err)
    }

    /// Decide the final content encoding for a text-typed body.
    fn reencode(
        &self,
        headers: &mut HeaderList,
        body: Bytes,
        path: &str,
        accept_encoding: &str,
    ) -> std::io::Result<Bytes> {
        let is_text = content::is_text_content_type(headers.get("Content-Type").unwrap_or_default());
        if !is_text {
            return Ok(body);
        }

        if headers.get("Content-Encoding") == Some("br") && !content::is_binary(&body) {
            headers.remove("Content-Encoding");
        }
        if headers.get("Content-Encoding").is_some_and(|ce| !ce.is_empty()) {
            return Ok(body);
        }

        if content::is_binary(&body) {
            // deflate-compressed body that lost its encoding label on the way in
            if !content::extension_is_non_text(path) {
                headers.set("Content-Encoding", "deflate");
            }
            return Ok(body);
        }

        if body.len() <= RECOMPRESS_THRESHOLD {
            return Ok(body);
        }
        let Some(encoding) = Recompression::negotiate(accept_encoding) else {
            return Ok(body);
        };

        let compressed = encoding.compress(&body)?;
        if compressed.len() >= body.len() {
            return Ok(body);
        }

        self.metrics
            .record_recompression((body.len() - compressed.len()) as u64);
        headers.set("Content-Length", compressed.len().to_string());
        headers.set("Content-Encoding", encoding.token());
        Ok(Bytes::from(compressed))
    }

    fn error_envelope(&self, host: &str, rejection: &Rejection) -> (ResponseHead, Bytes) {
        let data = serde_json::json!({
            "type": format!("relay({}/{})", std::env::consts::OS, std::env::consts::ARCH),
            "host": host,
            "software": format!("gtunnel-relay/{}", self.config.version),
            "error": rejection.error,
        });
        let body = format!("{:#}\n", data);

        let mut head = ResponseHead::new(rejection.status.as_u16(), "");
        head.headers.append("Content-Type", "text/plain; charset=utf-8");
        head.headers.append("Content-Length", body.len().to_string());
        (head, Bytes::from(body))
    }
}

fn unwrap_request(carrier: CarrierRequest) -> Result<InboundRequest, Rejection> {
    let envelope = Envelope::decode(carrier.body).map_err(|e| Rejection::new(StatusCode::BAD_REQUEST, e))?;
    let head = RequestHead::parse(&envelope.head).map_err(|e| Rejection::new(StatusCode::BAD_REQUEST, e))?;

    let uri: Uri = head
        .target
        .parse()
        .map_err(|e| Rejection::new(StatusCode::BAD_REQUEST, format!("invalid request target: {e}")))?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(Rejection::new(
            StatusCode::BAD_REQUEST,
            format!("request target is not absolute: {}", head.target),
        ));
    }

    Ok(InboundRequest {
        path: uri.path().to_string(),
        head,
        body: envelope.body,
        remote_addr: carrier.remote_addr,
        tls: carrier.tls,
    })
}

/// Pin the fetch to gzip when the caller could take it and the request is
/// not an XHR, otherwise ask for identity. Returns the caller's original
/// value for the recompression decision.
fn normalize_accept_encoding(headers: &mut HeaderList) -> String {
    let original = headers.get("Accept-Encoding").unwrap_or_default().to_string();
    let is_xhr = headers.get("X-Requested-With").is_some_and(|v| !v.is_empty());

    if original.contains("gzip") && !is_xhr {
        headers.set("Accept-Encoding", "gzip");
    } else {
        headers.remove("Accept-Encoding");
    }
    original
}

fn rewrite_response_headers(headers: &mut HeaderList, content_length: usize) {
    headers.remove("Transfer-Encoding");
    if headers
        .get("Vary")
        .is_some_and(|v| v.eq_ignore_ascii_case("accept-encoding"))
    {
        headers.remove("Vary");
    }
    if content_length > 0 {
        headers.set("Content-Length", content_length.to_string());
    }
}

/// Frame `head` and stream it ahead of `body` in an image-typed response.
fn wrap(head: &ResponseHead, body: Bytes) -> gtunnel_shared::Result<Response<Body>> {
    let frame = Bytes::from(encode_header_block(&head.to_block())?);
    let total = frame.len() + body.len();

    let chunks = futures_util::stream::iter([Ok::<_, Infallible>(frame), Ok(body)]);
    let mut resp = Response::new(Body::from_stream(chunks));
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(CARRIER_CONTENT_TYPE));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(total));
    Ok(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::fetch::ReqwestFetcher;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Fetcher that replays canned outcomes and records what it was asked.
    #[derive(Default)]
    struct ScriptedFetcher {
        outcomes: Mutex<VecDeque<Result<FetchResult, FetchError>>>,
        seen: Mutex<Vec<(RequestHead, FetchSettings)>>,
    }

    impl ScriptedFetcher {
        fn new(outcomes: Vec<Result<FetchResult, FetchError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                seen: Mutex::default(),
            }
        }

        fn seen(&self) -> Vec<(RequestHead, FetchSettings)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            head: &RequestHead,
            _body: Bytes,
            settings: &FetchSettings,
        ) -> Result<FetchResult, FetchError> {
            self.seen.lock().unwrap().push((head.clone(), settings.clone()));
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Other("script exhausted".into())))
        }
    }

    fn origin(status: u16, headers: &[(&str, &str)], body: impl Into<Bytes>) -> Result<FetchResult, FetchError> {
        Ok(FetchResult {
            status,
            reason: "OK".into(),
            headers: headers.iter().copied().collect(),
            body: body.into(),
            truncated: false,
        })
    }

    fn handler(outcomes: Vec<Result<FetchResult, FetchError>>) -> RelayHandler<ScriptedFetcher> {
        handler_with(RelayConfig::default(), outcomes)
    }

    fn handler_with(
        config: RelayConfig,
        outcomes: Vec<Result<FetchResult, FetchError>>,
    ) -> RelayHandler<ScriptedFetcher> {
        RelayHandler::new(ScriptedFetcher::new(outcomes), config, Metrics::new())
    }

    fn carrier_for(head: &RequestHead) -> CarrierRequest {
        let wire = Envelope::new(head.to_block(), Bytes::new()).encode().unwrap();
        CarrierRequest {
            remote_addr: Some("10.0.0.9:5555".parse().unwrap()),
            tls: true,
            host: "relay.example.com".into(),
            body: Bytes::from(wire),
        }
    }

    fn get(target: &str, headers: &[(&str, &str)]) -> RequestHead {
        let mut head = RequestHead::new("GET", target);
        for (k, v) in headers {
            head.headers.append(*k, *v);
        }
        head
    }

    /// Check the carrier shape and open the envelope.
    async fn open(resp: Response<Body>) -> (ResponseHead, Bytes) {
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], CARRIER_CONTENT_TYPE);
        let declared: usize = resp.headers()[CONTENT_LENGTH].to_str().unwrap().parse().unwrap();

        let raw = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(raw.len(), declared);

        let envelope = Envelope::decode(raw).unwrap();
        (ResponseHead::parse(&envelope.head).unwrap(), envelope.body)
    }

    fn error_field(body: &Bytes) -> String {
        let value: serde_json::Value = serde_json::from_slice(body).unwrap();
        value["error"].as_str().unwrap().to_string()
    }

    /// A first line that passes the binary sniff, then noise.
    fn incompressible_text(len: usize) -> Vec<u8> {
        let mut data = b"abcde\n".to_vec();
        let mut state: u32 = 0x9e37_79b9;
        while data.len() < len {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            data.push(state as u8);
        }
        data
    }

    #[tokio::test]
    async fn test_success_is_wrapped_with_rewritten_headers() {
        let h = handler(vec![origin(
            200,
            &[
                ("Content-Type", "image/png"),
                ("Transfer-Encoding", "chunked"),
                ("Vary", "Accept-Encoding"),
            ],
            &b"\x89PNG body"[..],
        )]);

        let (head, body) = open(h.handle(carrier_for(&get("http://example.com/a.png", &[]))).await).await;
        assert_eq!(head.status, 200);
        assert_eq!(&body[..], b"\x89PNG body");
        assert!(!head.headers.contains("Transfer-Encoding"));
        assert!(!head.headers.contains("Vary"));
        assert_eq!(head.headers.get("Content-Length"), Some("9"));
        assert_eq!(h.metrics.exchanges(), 1);
    }

    #[tokio::test]
    async fn test_truncated_envelope_is_bad_request() {
        let h = handler(vec![]);
        let mut carrier = carrier_for(&get("http://example.com/", &[]));
        carrier.body = carrier.body.slice(..3);

        let (head, body) = open(h.handle(carrier).await).await;
        assert_eq!(head.status, 400);
        assert_eq!(head.headers.get("Content-Type"), Some("text/plain; charset=utf-8"));
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["host"], "relay.example.com");
        assert!(value["software"].as_str().unwrap().starts_with("gtunnel-relay/"));
        assert!(h.fetcher.seen().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_request_line_is_bad_request() {
        let h = handler(vec![]);
        let wire = Envelope::new("GET /relative\r\n\r\n", Bytes::new()).encode().unwrap();
        let carrier = CarrierRequest {
            remote_addr: None,
            tls: false,
            host: "relay".into(),
            body: Bytes::from(wire),
        };
        let (head, _) = open(h.handle(carrier).await).await;
        assert_eq!(head.status, 400);

        let (head, body) = open(h.handle(carrier_for(&get("/relative/only", &[]))).await).await;
        assert_eq!(head.status, 400);
        assert!(error_field(&body).contains("not absolute"));
    }

    #[tokio::test]
    async fn test_password_checked() {
        let config = RelayConfig {
            password: "s3cret".into(),
            ..RelayConfig::default()
        };
        let h = handler_with(config, vec![origin(204, &[], Bytes::new())]);

        let (head, body) = open(h.handle(carrier_for(&get("http://e.com/", &[]))).await).await;
        assert_eq!(head.status, 403);
        assert!(error_field(&body).contains("required"));

        let wrong = get("http://e.com/", &[(OPTIONS_HEADER, "password=nope")]);
        let (head, body) = open(h.handle(carrier_for(&wrong)).await).await;
        assert_eq!(head.status, 403);
        assert!(error_field(&body).contains("wrong"));

        let right = get("http://e.com/", &[(OPTIONS_HEADER, "password=s3cret")]);
        let (head, _) = open(h.handle(carrier_for(&right)).await).await;
        assert_eq!(head.status, 204);
    }

    #[tokio::test]
    async fn test_options_stripped_and_applied() {
        let h = handler(vec![origin(200, &[], Bytes::new())]);
        let req = get(
            "http://example.com/",
            &[
                (OPTIONS_HEADER, "deadline=5,maxsize=2048,sslverify"),
                ("Accept-Encoding", "gzip, deflate, br"),
            ],
        );
        open(h.handle(carrier_for(&req)).await).await;

        let seen = h.fetcher.seen();
        let (head, settings) = &seen[0];
        assert!(!head.headers.contains(OPTIONS_HEADER));
        assert_eq!(head.headers.get("Accept-Encoding"), Some("gzip"));
        assert_eq!(settings.deadline, Duration::from_secs(5));
        assert_eq!(settings.maxsize, 2048);
        assert!(!settings.allow_invalid_certs);
    }

    #[tokio::test]
    async fn test_accept_encoding_dropped_for_xhr() {
        let h = handler(vec![origin(200, &[], Bytes::new()), origin(200, &[], Bytes::new())]);
        let xhr = get(
            "http://example.com/",
            &[("Accept-Encoding", "gzip"), ("X-Requested-With", "XMLHttpRequest")],
        );
        open(h.handle(carrier_for(&xhr)).await).await;
        let plain = get("http://example.com/", &[("Accept-Encoding", "br")]);
        open(h.handle(carrier_for(&plain)).await).await;

        let seen = h.fetcher.seen();
        assert!(!seen[0].0.headers.contains("Accept-Encoding"));
        assert!(!seen[1].0.headers.contains("Accept-Encoding"));
        assert!(seen[1].1.allow_invalid_certs);
    }

    #[tokio::test]
    async fn test_too_large_injects_range() {
        let truncated = Ok(FetchResult {
            status: 200,
            reason: "OK".into(),
            headers: HeaderList::new(),
            body: Bytes::from_static(b"partial"),
            truncated: true,
        });
        let h = handler(vec![truncated, origin(206, &[], &b"0123"[..])]);
        let req = get("http://example.com/big", &[(OPTIONS_HEADER, "maxsize=1000")]);

        let (head, _) = open(h.handle(carrier_for(&req)).await).await;
        assert_eq!(head.status, 206);

        let seen = h.fetcher.seen();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].0.headers.contains("Range"));
        assert_eq!(seen[1].0.headers.get("Range"), Some("bytes=0-1000"));
        assert_eq!(h.metrics.retries(RetryCause::TooLarge), 1);
    }

    #[tokio::test]
    async fn test_too_large_clamps_existing_range() {
        let h = handler(vec![Err(FetchError::TooLarge), origin(206, &[], Bytes::new())]);
        let req = get(
            "http://example.com/big",
            &[(OPTIONS_HEADER, "maxsize=1000"), ("Range", "bytes=500-")],
        );
        open(h.handle(carrier_for(&req)).await).await;
        assert_eq!(h.fetcher.seen()[1].0.headers.get("Range"), Some("bytes=500-1500"));
    }

    /// Serves 5000 bytes and honours inclusive `bytes=S-E` ranges.
    async fn start_ranged_origin() -> (SocketAddr, Arc<Mutex<Vec<Option<String>>>>) {
        use axum::http::HeaderMap;
        use axum::routing::get as get_route;

        let ranges: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
        let log = ranges.clone();
        let app = axum::Router::new().route(
            "/big.bin",
            get_route(move |headers: HeaderMap| {
                let log = log.clone();
                async move {
                    let data: Vec<u8> = (0..5000u32).map(|i| b'a' + (i % 26) as u8).collect();
                    let range = headers.get("range").and_then(|v| v.to_str().ok()).map(str::to_string);
                    log.lock().unwrap().push(range.clone());

                    let window = range.as_deref().and_then(|r| r.strip_prefix("bytes=")).and_then(|r| {
                        let (start, end) = r.split_once('-')?;
                        Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?))
                    });
                    match window {
                        Some((start, end)) => {
                            let end = end.min(data.len() - 1);
                            Response::builder()
                                .status(StatusCode::PARTIAL_CONTENT)
                                .header(CONTENT_TYPE, "application/octet-stream")
                                .header("Content-Range", format!("bytes {}-{}/{}", start, end, data.len()))
                                .body(Body::from(data[start..=end].to_vec()))
                                .unwrap()
                        }
                        None => Response::builder()
                            .header(CONTENT_TYPE, "application/octet-stream")
                            .body(Body::from(data))
                            .unwrap(),
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, ranges)
    }

    #[tokio::test]
    async fn test_too_large_retry_succeeds_against_ranged_origin() {
        let (addr, ranges) = start_ranged_origin().await;
        let h = RelayHandler::new(ReqwestFetcher::new().unwrap(), RelayConfig::default(), Metrics::new());
        let req = get(&format!("http://{addr}/big.bin"), &[(OPTIONS_HEADER, "maxsize=1000")]);

        let (head, body) = open(h.handle(carrier_for(&req)).await).await;
        assert_eq!(head.status, 206);
        assert_eq!(body.len(), 1001);
        assert_eq!(h.metrics.retries(RetryCause::TooLarge), 1);

        let ranges = ranges.lock().unwrap().clone();
        assert_eq!(ranges, vec![None, Some("bytes=0-1000".to_string())]);
    }

    #[tokio::test]
    async fn test_client_range_at_window_size_is_not_truncated() {
        let (addr, _) = start_ranged_origin().await;
        let h = RelayHandler::new(ReqwestFetcher::new().unwrap(), RelayConfig::default(), Metrics::new());
        let req = get(
            &format!("http://{addr}/big.bin"),
            &[(OPTIONS_HEADER, "maxsize=1000"), ("Range", "bytes=2000-3000")],
        );

        let (head, body) = open(h.handle(carrier_for(&req)).await).await;
        assert_eq!(head.status, 206);
        assert_eq!(body.len(), 1001);
        assert_eq!(h.metrics.retries(RetryCause::TooLarge), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_over_quota_retries_then_gives_up() {
        let h = handler(vec![Err(FetchError::OverQuota), Err(FetchError::OverQuota)]);
        let start = tokio::time::Instant::now();

        let (head, body) = open(h.handle(carrier_for(&get("http://example.com/", &[]))).await).await;
        assert_eq!(head.status, 502);
        assert!(error_field(&body).contains("Over quota"));
        assert_eq!(h.fetcher.seen().len(), FETCH_ATTEMPTS);
        assert!(start.elapsed() >= 2 * h.config().overquota_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_retried() {
        let h = handler(vec![Err(FetchError::Closed), origin(200, &[], &b"ok"[..])]);
        let start = tokio::time::Instant::now();

        let (head, body) = open(h.handle(carrier_for(&get("http://example.com/", &[]))).await).await;
        assert_eq!(head.status, 200);
        assert_eq!(&body[..], b"ok");
        assert!(start.elapsed() >= h.config().closed_delay);
    }

    #[tokio::test]
    async fn test_generic_fetch_error_not_retried() {
        let h = handler(vec![
            Err(FetchError::DeadlineExceeded("timed out".into())),
            origin(200, &[], Bytes::new()),
        ]);
        let (head, body) = open(h.handle(carrier_for(&get("http://example.com/", &[]))).await).await;
        assert_eq!(head.status, 502);
        assert!(error_field(&body).contains("DEADLINE_EXCEEDED"));
        assert_eq!(h.fetcher.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_low_entropy_text_recompressed() {
        let text: Vec<u8> = b"hello world ".iter().copied().cycle().take(513).collect();
        let h = handler(vec![origin(200, &[("Content-Type", "text/plain")], text.clone())]);
        let req = get("http://example.com/readme", &[("Accept-Encoding", "gzip, deflate")]);

        let (head, body) = open(h.handle(carrier_for(&req)).await).await;
        assert_eq!(head.headers.get("Content-Encoding"), Some("deflate"));
        assert!(body.len() < text.len());
        assert_eq!(head.headers.get("Content-Length"), Some(body.len().to_string().as_str()));

        let mut inflated = Vec::new();
        std::io::Read::read_to_end(&mut flate2::read::DeflateDecoder::new(&body[..]), &mut inflated).unwrap();
        assert_eq!(inflated, text);
    }

    #[tokio::test]
    async fn test_high_entropy_text_left_alone() {
        let text = incompressible_text(513);
        assert!(!content::is_binary(&text));
        let h = handler(vec![origin(200, &[("Content-Type", "text/plain")], text.clone())]);
        let req = get("http://example.com/noise", &[("Accept-Encoding", "gzip, deflate")]);

        let (head, body) = open(h.handle(carrier_for(&req)).await).await;
        assert!(!head.headers.contains("Content-Encoding"));
        assert_eq!(head.headers.get("Content-Length"), Some("513"));
        assert_eq!(&body[..], &text[..]);
    }

    #[tokio::test]
    async fn test_gzip_chosen_when_only_gzip_offered() {
        let text: Vec<u8> = b"abc ".iter().copied().cycle().take(2048).collect();
        let h = handler(vec![origin(200, &[("Content-Type", "application/json")], text)]);
        let req = get("http://example.com/api", &[("Accept-Encoding", "gzip")]);

        let (head, body) = open(h.handle(carrier_for(&req)).await).await;
        assert_eq!(head.headers.get("Content-Encoding"), Some("gzip"));
        assert_eq!(&body[..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn test_brotli_label_dropped_for_plain_text() {
        let h = handler(vec![origin(
            200,
            &[("Content-Type", "text/html"), ("Content-Encoding", "br")],
            &b"<html>tiny</html>"[..],
        )]);
        let (head, _) = open(h.handle(carrier_for(&get("http://example.com/", &[]))).await).await;
        assert!(!head.headers.contains("Content-Encoding"));
    }

    #[tokio::test]
    async fn test_binary_text_body_relabelled_unless_extension_is_binary() {
        let deflated = &b"\xcb\x48\xcd\xc9\xc9\x07\x00"[..];
        let h = handler(vec![
            origin(200, &[("Content-Type", "application/javascript")], deflated),
            origin(200, &[("Content-Type", "text/plain")], deflated),
        ]);

        let (head, _) = open(h.handle(carrier_for(&get("http://example.com/app.js", &[]))).await).await;
        assert_eq!(head.headers.get("Content-Encoding"), Some("deflate"));

        let (head, _) = open(h.handle(carrier_for(&get("http://example.com/pic.png", &[]))).await).await;
        assert!(!head.headers.contains("Content-Encoding"));
    }
}
