//! The HTTP side of the data plane. Requests whose Host is
//! `<name>.<funnel-domain>` are forwarded over a freshly acquired reverse
//! sub-stream: plain requests through an HTTP/1.1 client handshake on the
//! sub-stream, WebSocket upgrades by hijacking the client connection and
//! bridging raw bytes once the backend answers 101.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode},
    response::IntoResponse,
};
use futures::StreamExt;
use hyper_util::rt::TokioIo;
use muxer::SubStream;
use portal_core::{
    bridge,
    gate::ConnGuard,
    lease::{Lease, TlsMode},
    metrics::{LIVE_BRIDGES, PROXIED_REQUESTS},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use crate::{models::ApiError, register::client_ip, ApiState};

/// cap on a backend response head
const MAX_RESPONSE_HEAD: usize = 16 * 1024;
/// deadline for the backend's response head on the upgrade path
const HEAD_DEADLINE: Duration = Duration::from_secs(10);

/// The label for `host` when it is a subdomain of the funnel domain.
pub(crate) fn subdomain<'a>(host: &'a str, funnel_domain: &str) -> Option<&'a str> {
    let host = host.split(':').next().unwrap_or(host);
    if host.eq_ignore_ascii_case(funnel_domain) {
        return None;
    }
    let label = host
        .strip_suffix(funnel_domain)?
        .strip_suffix('.')?;
    // exactly one label deep
    if label.is_empty() || label.contains('.') {
        return None;
    }
    Some(label)
}

fn request_host(req: &Request) -> Option<String> {
    if let Some(host) = req.headers().get(header::HOST) {
        return host.to_str().ok().map(str::to_owned);
    }
    req.uri().authority().map(|a| a.to_string())
}

fn is_ws_upgrade(req: &Request) -> bool {
    let upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade && connection
}

/// Is this request addressed to a lease subdomain (rather than the relay's
/// own control plane)?
pub(crate) fn is_lease_host(state: &ApiState, req: &Request) -> bool {
    request_host(req)
        .as_deref()
        .and_then(|host| subdomain(host, &state.cfg.funnel_domain))
        .is_some()
}

/// 404 for anything that is neither control plane nor a lease subdomain.
pub(crate) async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "no such endpoint")
}

#[instrument(name = "proxy", level = "debug", skip_all)]
pub(crate) async fn proxy(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response<Body> {
    match handle(state, addr, req).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn handle(
    state: Arc<ApiState>,
    addr: SocketAddr,
    req: Request,
) -> Result<Response<Body>, ApiError> {
    let host = request_host(&req)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "missing host"))?;
    let label = subdomain(&host, &state.cfg.funnel_domain)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "not a portal subdomain"))?;

    let lease = state
        .leases
        .lookup_by_name(label)
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "unknown service"))?;

    // TLS-terminating leases are served through the SNI front door
    if lease.tls_mode == TlsMode::Tls {
        let location = format!(
            "https://{host}{}",
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );
        return Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .map_err(|err| ApiError::bad_gateway(err.to_string()));
    }

    let ip = client_ip(req.headers(), addr);
    if state.gate.ip_banned(ip) {
        warn!(%ip, name = %lease.name, "banned ip refused at proxy");
        return Err(ApiError::new(StatusCode::FORBIDDEN, "source address banned"));
    }
    if !state.gate.allowed(&lease.id) {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "service not approved"));
    }
    let guard = state
        .gate
        .try_conn(&lease.id)
        .ok_or_else(|| ApiError::unavailable("service connection cap reached"))?;

    let sub = state
        .hub
        .acquire(&lease.id, state.acquire_timeout, &state.shutdown)
        .await
        .map_err(|err| {
            debug!(?err, name = %lease.name, "sub-stream acquisition failed");
            ApiError::unavailable("service backend unavailable")
        })?;

    PROXIED_REQUESTS.inc();
    if is_ws_upgrade(&req) {
        ws_bridge(state, req, lease, sub, guard).await
    } else {
        http_forward(state, req, sub, guard).await
    }
}

/// hop-by-hop headers never forwarded on the plain path
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

async fn http_forward(
    state: Arc<ApiState>,
    req: Request,
    sub: SubStream,
    guard: ConnGuard,
) -> Result<Response<Body>, ApiError> {
    let (mut parts, body) = req.into_parts();
    for name in &HOP_BY_HOP {
        parts.headers.remove(name);
    }
    parts.headers.remove("keep-alive");
    // origin-form target; Host stays so the backend sees its subdomain
    parts.uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "bad request target"))?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(sub))
        .await
        .map_err(|err| ApiError::bad_gateway(format!("backend handshake: {err}")))?;
    tokio::spawn(async move {
        // the guard rides along until the backend connection winds down
        let _guard = guard;
        if let Err(err) = conn.await {
            debug!(?err, "proxied connection ended");
        }
    });

    let resp = sender
        .send_request(Request::from_parts(parts, body))
        .await
        .map_err(|err| ApiError::bad_gateway(format!("backend request: {err}")))?;

    let (parts, incoming) = resp.into_parts();
    let mut resp = Response::from_parts(parts, Body::new(incoming));
    if state.cfg.noindex {
        resp.headers_mut()
            .insert("x-robots-tag", HeaderValue::from_static("noindex"));
    }
    Ok(resp)
}

async fn ws_bridge(
    state: Arc<ApiState>,
    mut req: Request,
    lease: Lease,
    mut sub: SubStream,
    guard: ConnGuard,
) -> Result<Response<Body>, ApiError> {
    let on_upgrade = req
        .extensions_mut()
        .remove::<hyper::upgrade::OnUpgrade>()
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "connection not upgradable"))?;

    // the backend gets the original request, bytes on the wire
    let head = serialize_request_head(&req);
    sub.write_all(&head)
        .await
        .map_err(|err| ApiError::bad_gateway(format!("backend write: {err}")))?;

    let (status, headers, leftover) =
        tokio::time::timeout(HEAD_DEADLINE, read_response_head(&mut sub))
            .await
            .map_err(|_| ApiError::bad_gateway("backend response deadline passed"))??;

    let mut builder = Response::builder().status(status);
    if let Some(dst) = builder.headers_mut() {
        *dst = headers;
    }

    if status == StatusCode::SWITCHING_PROTOCOLS {
        let bucket = state.gate.bucket(&lease.id);
        tokio::spawn(async move {
            let _guard = guard;
            let upgraded = match on_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    debug!(?err, "client upgrade failed");
                    return;
                }
            };
            let mut client = TokioIo::new(upgraded);
            if !leftover.is_empty() && client.write_all(&leftover).await.is_err() {
                return;
            }
            LIVE_BRIDGES.inc();
            let bridged = bridge::copy_bidirectional_limited(client, sub, bucket).await;
            LIVE_BRIDGES.dec();
            match bridged {
                Ok((up, down)) => debug!(name = %lease.name, up, down, "websocket bridge finished"),
                Err(err) => debug!(name = %lease.name, ?err, "websocket bridge errored"),
            }
        });
        builder
            .body(Body::empty())
            .map_err(|err| ApiError::bad_gateway(err.to_string()))
    } else {
        // backend refused the upgrade; forward its answer and close
        let reader = std::io::Cursor::new(leftover).chain(sub);
        let stream = ReaderStream::new(reader).inspect(move |_| {
            // keeps the connection slot held while the body streams
            let _ = &guard;
        });
        builder
            .body(Body::from_stream(stream))
            .map_err(|err| ApiError::bad_gateway(err.to_string()))
    }
}

fn serialize_request_head(req: &Request) -> Vec<u8> {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(req.method().as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in req.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Read and parse an HTTP/1.1 response head off the sub-stream, returning
/// the status, headers, and whatever bytes arrived past the head.
async fn read_response_head(
    sub: &mut SubStream,
) -> Result<(StatusCode, HeaderMap, Vec<u8>), ApiError> {
    let mut buf = Vec::with_capacity(1024);
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() >= MAX_RESPONSE_HEAD {
            return Err(ApiError::bad_gateway("backend response head too large"));
        }
        if sub
            .read_buf(&mut buf)
            .await
            .map_err(|err| ApiError::bad_gateway(format!("backend read: {err}")))?
            == 0
        {
            return Err(ApiError::bad_gateway("backend closed before responding"));
        }
    };
    let leftover = buf.split_off(head_end + 4);
    buf.truncate(head_end);

    let text = std::str::from_utf8(&buf)
        .map_err(|_| ApiError::bad_gateway("backend response head not utf-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| ApiError::bad_gateway("empty backend response"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ApiError::bad_gateway("bad backend status line"))?;

    let mut headers = HeaderMap::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if let (Ok(name), Ok(value)) = (
            name.trim().parse::<HeaderName>(),
            value.trim().parse::<HeaderValue>(),
        ) {
            headers.append(name, value);
        }
    }
    Ok((status, headers, leftover))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
