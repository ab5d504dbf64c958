//! # portal-tunnel
//!
//! The backend side of a portal relay. `expose` registers a lease, opens
//! the reverse WebSocket, and serves every sub-stream the relay opens by
//! forwarding it to a local service, terminating TLS with the certificate
//! the relay handed back when the lease runs in `tls` mode.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::{io, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use muxer::{FrameSink, FrameSource, FrameTransport, Role, Session};
use rustls_pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub mod config;

/// renew at a comfortable margin inside the relay's default 30 s TTL
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
/// reconnect backoff ceiling
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// One service to expose through the relay.
#[derive(Debug, Clone)]
pub struct ExposedService {
    /// requested lease name
    pub name: String,
    /// local `host:port` the traffic lands on
    pub host: String,
    /// terminate TLS here with the relay-issued certificate
    pub tls: bool,
    /// opaque metadata shown in the relay's admin surface
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    name: &'a str,
    metadata: &'a serde_json::Value,
    tls_mode: &'a str,
}

/// what the relay handed back for a registration
#[derive(Debug, Clone, Deserialize)]
pub struct Registration {
    /// opaque lease id
    pub lease_id: String,
    /// secret for renew/unregister/connect
    pub reverse_token: String,
    /// where the service is reachable
    pub public_url: String,
    /// PEM chain for the lease's subdomain
    pub tls_cert: String,
    /// PEM private key
    pub tls_key: String,
}

#[derive(Debug, Deserialize)]
struct RenewResponse {
    tls_cert: Option<String>,
    tls_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// REST client for the relay's registration API.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    relay_url: Url,
}

impl RelayClient {
    /// client for the relay at `relay_url` (e.g. `https://portal.example.com`)
    pub fn new(relay_url: &str) -> Result<Self> {
        let relay_url = Url::parse(relay_url).context("relay url")?;
        Ok(RelayClient {
            http: reqwest::Client::new(),
            relay_url,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.relay_url.join(path).context("building endpoint url")
    }

    /// the WebSocket endpoint for reverse sessions
    pub fn connect_url(&self) -> Result<Url> {
        let mut url = self.endpoint("/api/connect")?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow!("cannot derive websocket scheme"))?;
        Ok(url)
    }

    async fn error_message(resp: reqwest::Response) -> String {
        let status = resp.status();
        match resp.json::<ErrorBody>().await {
            Ok(ErrorBody {
                message: Some(message),
            }) => message,
            _ => format!("relay returned {status}"),
        }
    }

    /// `POST /api/register`
    pub async fn register(&self, svc: &ExposedService) -> Result<Registration> {
        let req = RegisterRequest {
            name: &svc.name,
            metadata: &svc.metadata,
            tls_mode: if svc.tls { "tls" } else { "no-tls" },
        };
        let resp = self
            .http
            .post(self.endpoint("/api/register")?)
            .json(&req)
            .send()
            .await
            .context("register request")?;
        if !resp.status().is_success() {
            bail!("register failed: {}", Self::error_message(resp).await);
        }
        resp.json().await.context("register response")
    }

    /// `POST /api/renew`; returns rotated PEMs when the relay sent them
    pub async fn renew(&self, reg: &Registration) -> Result<Option<(String, String)>> {
        let resp = self
            .http
            .post(self.endpoint("/api/renew")?)
            .json(&serde_json::json!({
                "lease_id": reg.lease_id,
                "reverse_token": reg.reverse_token,
            }))
            .send()
            .await
            .context("renew request")?;
        if !resp.status().is_success() {
            bail!("renew failed: {}", Self::error_message(resp).await);
        }
        let body: RenewResponse = resp.json().await.context("renew response")?;
        Ok(match (body.tls_cert, body.tls_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        })
    }

    /// `POST /api/unregister`; a 404 counts as done
    pub async fn unregister(&self, reg: &Registration) -> Result<()> {
        let resp = self
            .http
            .post(self.endpoint("/api/unregister")?)
            .json(&serde_json::json!({
                "lease_id": reg.lease_id,
                "reverse_token": reg.reverse_token,
            }))
            .send()
            .await
            .context("unregister request")?;
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            bail!("unregister failed: {}", Self::error_message(resp).await)
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`FrameTransport`] over a client WebSocket: one binary message per frame.
#[derive(Debug)]
pub struct WsClientTransport {
    ws: WsStream,
}

impl WsClientTransport {
    /// wrap a connected client socket
    pub fn new(ws: WsStream) -> Self {
        WsClientTransport { ws }
    }
}

/// sending half
pub struct WsClientSink(SplitSink<WsStream, Message>);

impl std::fmt::Debug for WsClientSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClientSink").finish()
    }
}

/// receiving half
pub struct WsClientSource(SplitStream<WsStream>);

impl std::fmt::Debug for WsClientSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsClientSource").finish()
    }
}

impl FrameTransport for WsClientTransport {
    type Sink = WsClientSink;
    type Source = WsClientSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, source) = self.ws.split();
        (WsClientSink(sink), WsClientSource(source))
    }
}

#[async_trait]
impl FrameSink for WsClientSink {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.0
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(io::Error::other)
    }

    async fn close(&mut self) -> io::Result<()> {
        let _ = self.0.send(Message::Close(None)).await;
        self.0.close().await.map_err(io::Error::other)
    }
}

#[async_trait]
impl FrameSource for WsClientSource {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Binary(raw))) => return Ok(Some(Bytes::from(raw))),
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => continue,
                Some(Ok(Message::Close(_) | Message::Frame(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(io::Error::other(err)),
            }
        }
    }
}

fn tls_acceptor(cert_pem: &str, key_pem: &str) -> Result<TlsAcceptor> {
    let certs: Vec<CertificateDer<'static>> =
        CertificateDer::pem_slice_iter(cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|err| anyhow!("parsing certificate pem: {err:?}"))?;
    let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
        .map_err(|err| anyhow!("parsing key pem: {err:?}"))?;
    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building tls config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Why a reverse session stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// the process is shutting down
    Shutdown,
    /// transport died; the lease is still alive, reconnect
    Lost,
    /// the relay no longer recognizes the lease; register again
    LeaseGone,
}

/// Open the reverse session and serve sub-streams until the session dies
/// or `shutdown` fires.
async fn serve_session(
    client: &RelayClient,
    svc: &ExposedService,
    reg: &Registration,
    shutdown: &CancellationToken,
) -> Result<SessionEnd> {
    let (mut ws, _) = connect_async(client.connect_url()?.as_str())
        .await
        .context("connecting reverse websocket")?;
    ws.send(Message::Text(serde_json::to_string(&serde_json::json!({
        "lease_id": reg.lease_id,
        "reverse_token": reg.reverse_token,
    }))?))
    .await
    .context("sending auth envelope")?;

    let session = Session::new(WsClientTransport::new(ws), Role::Initiator);
    info!(name = %svc.name, public_url = %reg.public_url, "reverse session up");

    let acceptor = if svc.tls {
        Some(tls_acceptor(&reg.tls_cert, &reg.tls_key)?)
    } else {
        None
    };

    // the first tick fires immediately, which doubles as an early check
    // that the lease is still honored
    let mut renew_ticker = tokio::time::interval(RENEW_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                session.close();
                return Ok(SessionEnd::Shutdown);
            }
            _ = renew_ticker.tick() => {
                if let Err(err) = client.renew(reg).await {
                    warn!(?err, name = %svc.name, "renew failed, re-registering");
                    session.close();
                    return Ok(SessionEnd::LeaseGone);
                }
            }
            accepted = session.accept_substream() => {
                let Some(sub) = accepted else {
                    warn!(name = %svc.name, "reverse session lost");
                    return Ok(SessionEnd::Lost);
                };
                let host = svc.host.clone();
                let acceptor = acceptor.clone();
                let name = svc.name.clone();
                tokio::spawn(async move {
                    if let Err(err) = forward(sub, &host, acceptor).await {
                        debug!(?err, name = %name, "forward ended");
                    }
                });
            }
        }
    }
}

async fn forward(
    sub: muxer::SubStream,
    host: &str,
    acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    let local = TcpStream::connect(host)
        .await
        .with_context(|| format!("connecting local service {host}"))?;
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor.accept(sub).await.context("tls handshake")?;
            bridge(tls, local).await
        }
        None => bridge(sub, local).await,
    }
}

async fn bridge<S>(mut a: S, mut local: TcpStream) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let _ = tokio::io::copy_bidirectional(&mut a, &mut local).await;
    Ok(())
}

async fn sleep_or_shutdown(backoff: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}

/// Register `svc` and keep it served until `shutdown` fires: reconnect the
/// session with backoff while the lease is alive, re-register when the
/// relay forgets us, and unregister on the way out.
pub async fn run_service(
    client: RelayClient,
    svc: ExposedService,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut backoff = Duration::from_secs(1);
    'register: loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        let reg = match client.register(&svc).await {
            Ok(reg) => reg,
            Err(err) => {
                warn!(?err, name = %svc.name, "registration failed, retrying");
                if sleep_or_shutdown(backoff, &shutdown).await {
                    return Ok(());
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        backoff = Duration::from_secs(1);
        info!(name = %svc.name, public_url = %reg.public_url, "exposed");

        loop {
            match serve_session(&client, &svc, &reg, &shutdown).await {
                Ok(SessionEnd::Shutdown) => {
                    if let Err(err) = client.unregister(&reg).await {
                        debug!(?err, name = %svc.name, "unregister");
                    }
                    return Ok(());
                }
                Ok(SessionEnd::Lost) | Err(_) => {
                    // the lease survives; renewals continue once the
                    // session is back
                    if sleep_or_shutdown(backoff, &shutdown).await {
                        let _ = client.unregister(&reg).await;
                        return Ok(());
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Ok(SessionEnd::LeaseGone) => {
                    if sleep_or_shutdown(backoff, &shutdown).await {
                        return Ok(());
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue 'register;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_url_schemes() {
        let client = RelayClient::new("http://127.0.0.1:4017").unwrap();
        assert_eq!(
            client.connect_url().unwrap().as_str(),
            "ws://127.0.0.1:4017/api/connect"
        );
        let client = RelayClient::new("https://portal.example.com").unwrap();
        assert_eq!(
            client.connect_url().unwrap().as_str(),
            "wss://portal.example.com/api/connect"
        );
    }
}
