//! `/api/connect`: the WebSocket a backend upgrades to establish its
//! reverse session. After the upgrade the first frame must be the JSON
//! envelope `{lease_id, reverse_token}`; a bad envelope gets a close frame
//! with the reason, success gets silence and the connection becomes the
//! framed byte-pipe under the multiplexer.

use std::{borrow::Cow, io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use muxer::{FrameSink, FrameSource, FrameTransport};
use portal_core::hub::AuthOutcome;
use tracing::{debug, info, warn};

use crate::{models::ConnectEnvelope, ApiState};

/// how long the backend has to send its auth envelope
const ENVELOPE_DEADLINE: Duration = Duration::from_secs(10);

pub(crate) async fn connect(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.gate.ip_banned(addr.ip()) {
        warn!(ip = %addr.ip(), "banned ip refused at /api/connect");
        return crate::models::ApiError::new(
            axum::http::StatusCode::FORBIDDEN,
            "source address banned",
        )
        .into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(state, socket, addr))
}

async fn handle_socket(state: Arc<ApiState>, mut socket: WebSocket, addr: SocketAddr) {
    let envelope = match read_envelope(&mut socket).await {
        Ok(env) => env,
        Err(reason) => {
            debug!(%addr, reason, "reverse session rejected before auth");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Cow::Borrowed(reason),
                })))
                .await;
            return;
        }
    };

    let verdict = portal_core::hub::Authorizer::authorize(
        state.leases.as_ref(),
        &envelope.lease_id,
        &envelope.reverse_token,
    );
    match verdict {
        AuthOutcome::Accepted => {}
        outcome => {
            warn!(%addr, lease_id = %envelope.lease_id, ?outcome, "reverse session unauthorized");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: Cow::Borrowed("unauthorized"),
                })))
                .await;
            return;
        }
    }

    match state.hub.attach(
        &envelope.lease_id,
        &envelope.reverse_token,
        WsTransport::new(socket),
    ) {
        Ok(()) => {
            info!(%addr, lease_id = %envelope.lease_id, "reverse session established");
        }
        Err(err) => {
            // lost a race with lease teardown; the socket is already gone
            debug!(%addr, lease_id = %envelope.lease_id, ?err, "attach failed");
        }
    }
}

async fn read_envelope(socket: &mut WebSocket) -> Result<ConnectEnvelope, &'static str> {
    let msg = tokio::time::timeout(ENVELOPE_DEADLINE, socket.recv())
        .await
        .map_err(|_| "auth envelope deadline passed")?
        .ok_or("connection closed before auth")?
        .map_err(|_| "websocket error before auth")?;
    let raw = match &msg {
        Message::Text(text) => text.as_bytes(),
        Message::Binary(raw) => raw.as_slice(),
        _ => return Err("expected auth envelope"),
    };
    serde_json::from_slice(raw).map_err(|_| "malformed auth envelope")
}

/// [`FrameTransport`] over an upgraded axum WebSocket: one binary message
/// per mux frame.
pub struct WsTransport {
    socket: WebSocket,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport").finish()
    }
}

impl WsTransport {
    /// wrap an upgraded socket
    pub fn new(socket: WebSocket) -> Self {
        WsTransport { socket }
    }
}

/// sending half
pub struct WsSink(SplitSink<WebSocket, Message>);

impl std::fmt::Debug for WsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSink").finish()
    }
}

/// receiving half
pub struct WsSource(SplitStream<WebSocket>);

impl std::fmt::Debug for WsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSource").finish()
    }
}

impl FrameTransport for WsTransport {
    type Sink = WsSink;
    type Source = WsSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, source) = self.socket.split();
        (WsSink(sink), WsSource(source))
    }
}

#[async_trait]
impl FrameSink for WsSink {
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
impl FrameSource for WsSource {
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.0.next().await {
                Some(Ok(Message::Binary(raw))) => return Ok(Some(Bytes::from(raw))),
                // pings are answered by axum; anything textual is noise
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Err(err)) => return Err(io::Error::other(err)),
            }
        }
    }
}
