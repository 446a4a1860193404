//! Local forward proxy
//!
//! Browsers send absolute-form requests here; each one becomes a tunnel
//! round trip.

use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::transport::{OriginalRequest, TunnelTransport};

/// Largest request body forwarded through the tunnel.
const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

pub fn router(transport: Arc<TunnelTransport>) -> Router {
    Router::new().fallback(forward).with_state(transport)
}

pub async fn serve(listen: SocketAddr, transport: Arc<TunnelTransport>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("Local proxy listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(transport)).await?;
    Ok(())
}

async fn forward(State(transport): State<Arc<TunnelTransport>>, req: Request) -> Response {
    if req.method() == Method::CONNECT {
        return (StatusCode::METHOD_NOT_ALLOWED, "CONNECT tunnelling is not supported\n").into_response();
    }
    if req.uri().scheme().is_none() || req.uri().host().is_none() {
        return (
            StatusCode::BAD_REQUEST,
            "gtunnel is a forward proxy; send absolute-form requests\n",
        )
            .into_response();
    }

    let (mut parts, body) = req.into_parts();
    parts.headers.remove("proxy-connection");
    parts.headers.remove("proxy-authorization");
    let body = match to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(body) => body,
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, format!("{e}\n")).into_response(),
    };
    let method = parts.method.clone();
    let uri = parts.uri.clone();
    let tunnel_req = http::Request::from_parts(parts, body);

    match transport.round_trip(tunnel_req).await {
        Ok(resp) => {
            let (method, uri) = match resp.extensions().get::<OriginalRequest>() {
                Some(original) => (&original.method, &original.uri),
                None => (&method, &uri),
            };
            info!("{} {} {}", method, uri, resp.status().as_u16());
            resp.map(Body::from)
        }
        Err(e) => {
            warn!("{} {} failed: {}", method, uri, e);
            (StatusCode::BAD_GATEWAY, format!("gtunnel: {e}\n")).into_response()
        }
    }
}
