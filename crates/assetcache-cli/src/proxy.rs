//! Cache-first reverse proxy.
//!
//! Every inbound request is rewritten onto the configured origin and
//! dispatched through the worker host, so pages loaded via the proxy get
//! the same offline behavior a controlled browser tab would.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use assetcache_core::{CacheWorker, Request, ResponseSource, WorkerHost};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tracing::{debug, info, warn};
use url::Url;

/// Largest request body the proxy will buffer
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Response header telling clients where the body came from
const SOURCE_HEADER: &str = "x-assetcache-source";

/// Connection-level headers that must not be forwarded (RFC 9110 §7.6.1)
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxyState {
    host: Arc<WorkerHost>,
    origin: Url,
}

pub fn router(host: Arc<WorkerHost>, origin: Url) -> Router {
    let state = Arc::new(ProxyState { host, origin });
    Router::new().fallback(proxy_request).with_state(state)
}

/// Serve until ctrl-c, then wait for in-flight cache writes.
pub async fn serve(host: Arc<WorkerHost>, worker: Arc<CacheWorker>, addr: SocketAddr) -> Result<()> {
    let app = router(host, worker.config().origin().clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Proxy listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    worker.settle().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutting down proxy");
}

async fn proxy_request(
    State(state): State<Arc<ProxyState>>,
    request: axum::extract::Request,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    match forward(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%method, %uri, error = %e, "Proxy request failed");
            (StatusCode::BAD_GATEWAY, format!("{}\n", e)).into_response()
        }
    }
}

async fn forward(state: &ProxyState, request: axum::extract::Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_BODY_BYTES).await?;

    let mut outbound = Request::new(parts.method, target_url(&state.origin, &parts.uri));
    for (name, value) in forwarded_headers(&parts.headers) {
        outbound = outbound.with_header(name, value);
    }
    if !body.is_empty() {
        outbound = outbound.with_body(body);
    }

    let intercepted = state.host.handle_fetch(outbound).await?;
    let source = match intercepted.source {
        ResponseSource::Cache => "cache",
        ResponseSource::Network => "network",
    };

    let response = intercepted.response;
    let mut builder = Response::builder()
        .status(response.status)
        .header(SOURCE_HEADER, source);
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case(header::CONTENT_LENGTH.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    Ok(builder.body(Body::from(response.body))?)
}

/// Inbound headers to pass on to the origin. Drops `Host`, hop-by-hop
/// headers and values that aren't visible ASCII.
fn forwarded_headers(headers: &HeaderMap) -> Vec<(&str, &str)> {
    headers
        .iter()
        .filter(|(name, _)| **name != header::HOST && !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| match value.to_str() {
            Ok(value) => Some((name.as_str(), value)),
            Err(_) => {
                debug!(header = %name, "Dropping non-ASCII request header");
                None
            }
        })
        .collect()
}

/// Put the inbound path and query onto the origin. The origin's own
/// scheme, host and port always win.
fn target_url(origin: &Url, uri: &Uri) -> Url {
    let mut url = origin.clone();
    url.set_path(uri.path());
    url.set_query(uri.query());
    url
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}
