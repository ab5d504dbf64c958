#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # muxer
//!
//! `muxer` carves many logical duplex byte streams out of one framed
//! transport. One side calls [`Session::open_substream`], the other sees the
//! stream pop out of [`Session::accept_substream`]; each [`SubStream`]
//! implements `AsyncRead + AsyncWrite` with half-close semantics so it can be
//! bridged directly to a TCP socket with `copy_bidirectional`.
//!
//! The transport is anything that can carry discrete binary frames:
//! a WebSocket connection, or [`LengthDelimited`] over any
//! `AsyncRead + AsyncWrite` byte pipe.

use std::{
    collections::HashMap,
    fmt, io,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::mpsc,
};
use tokio_util::{
    codec::{Framed, LengthDelimitedCodec},
    sync::{CancellationToken, PollSender},
};
use tracing::{debug, trace};

/// Largest payload carried in a single frame. Larger writes are split.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// frame header: stream id (u32 BE) + flags (u8)
const HEADER_LEN: usize = 5;

const FLAG_SYN: u8 = 0x01;
const FLAG_FIN: u8 = 0x02;
const FLAG_RST: u8 = 0x04;

/// per-substream inbound frame buffer (frames, not bytes)
const STREAM_BUF: usize = 64;
/// outbound frame queue shared by all substreams of a session
const SESSION_BUF: usize = 256;
/// streams opened by the peer that nobody has accepted yet
const ACCEPT_BUF: usize = 64;

/// Errors surfaced by session and sub-stream operations.
#[derive(Debug, Error)]
pub enum MuxError {
    /// the session's transport is gone
    #[error("session closed")]
    Closed,
    /// the peer sent a frame we can't make sense of
    #[error("protocol error: {0}")]
    Protocol(&'static str),
}

/// Which end of the transport this session is. Determines sub-stream id
/// parity so both sides can open streams without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// dialed the transport; opens odd stream ids
    Initiator,
    /// accepted the transport; opens even stream ids
    Responder,
}

/// Sending half of a framed transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// deliver one frame to the peer
    async fn send(&mut self, frame: Bytes) -> io::Result<()>;
    /// flush and close the underlying transport
    async fn close(&mut self) -> io::Result<()>;
}

/// Receiving half of a framed transport.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// next frame from the peer; `None` on clean EOF
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// A transport that can be split into independently-owned halves, so the
/// session can read and write concurrently.
pub trait FrameTransport: Send + 'static {
    /// sending half
    type Sink: FrameSink;
    /// receiving half
    type Source: FrameSource;
    /// split into (sink, source)
    fn split(self) -> (Self::Sink, Self::Source);
}

#[derive(Debug, Clone)]
struct Frame {
    stream_id: u32,
    flags: u8,
    payload: Bytes,
}

impl Frame {
    fn data(stream_id: u32, payload: Bytes) -> Self {
        Frame {
            stream_id,
            flags: 0,
            payload,
        }
    }

    fn control(stream_id: u32, flags: u8) -> Self {
        Frame {
            stream_id,
            flags,
            payload: Bytes::new(),
        }
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.stream_id);
        buf.put_u8(self.flags);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    fn decode(mut raw: Bytes) -> Result<Frame, MuxError> {
        if raw.len() < HEADER_LEN {
            return Err(MuxError::Protocol("short frame"));
        }
        let stream_id = raw.get_u32();
        let flags = raw.get_u8();
        if raw.len() > MAX_PAYLOAD {
            return Err(MuxError::Protocol("oversized frame"));
        }
        Ok(Frame {
            stream_id,
            flags,
            payload: raw,
        })
    }
}

enum StreamEvent {
    Data(Bytes),
    Fin,
    Rst,
}

struct Shared {
    out_tx: mpsc::Sender<Frame>,
    streams: Mutex<HashMap<u32, mpsc::Sender<StreamEvent>>>,
    next_id: AtomicU32,
    closed: CancellationToken,
}

impl Shared {
    fn deregister(&self, id: u32) {
        self.streams.lock().remove(&id);
    }
}

/// One multiplexed session over a framed transport.
///
/// Dropping the `Session` closes it; every live [`SubStream`] then reads EOF
/// and fails writes with `BrokenPipe`.
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<SubStream>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.shared.closed.is_cancelled())
            .finish()
    }
}

impl Session {
    /// Start a session over `transport`, spawning its reader and writer
    /// tasks on the current runtime.
    pub fn new<T: FrameTransport>(transport: T, role: Role) -> Session {
        let (sink, source) = transport.split();
        let (out_tx, out_rx) = mpsc::channel(SESSION_BUF);
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BUF);
        let shared = Arc::new(Shared {
            out_tx,
            streams: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(match role {
                Role::Initiator => 1,
                Role::Responder => 2,
            }),
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(sink, out_rx, shared.closed.clone()));
        tokio::spawn(read_loop(source, Arc::clone(&shared), accept_tx));

        Session {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }
    }

    /// Open a fresh sub-stream. The peer sees it on `accept_substream`.
    pub async fn open_substream(&self) -> Result<SubStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::Closed);
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_BUF);
        self.shared.streams.lock().insert(id, tx);
        if self
            .shared
            .out_tx
            .send(Frame::control(id, FLAG_SYN))
            .await
            .is_err()
        {
            self.shared.deregister(id);
            return Err(MuxError::Closed);
        }
        trace!(id, "opened substream");
        Ok(SubStream::new(id, rx, Arc::clone(&self.shared)))
    }

    /// Next sub-stream opened by the peer, in the order the peer opened
    /// them. `None` when the session is closed.
    pub async fn accept_substream(&self) -> Option<SubStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Close the session. Idempotent; all sub-streams unblock.
    pub fn close(&self) {
        self.shared.closed.cancel();
    }

    /// true once the transport is gone or `close` was called
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Token cancelled when the session dies; lets owners watch for
    /// teardown without polling.
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

async fn write_loop<S: FrameSink>(
    mut sink: S,
    mut out_rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = sink.send(frame.encode()).await {
                    debug!(?err, "transport write failed");
                    closed.cancel();
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S: FrameSource>(
    mut source: S,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<SubStream>,
) {
    loop {
        let raw = tokio::select! {
            _ = shared.closed.cancelled() => break,
            raw = source.recv() => raw,
        };
        let frame = match raw {
            Ok(Some(raw)) => match Frame::decode(raw) {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(?err, "bad frame, dropping session");
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                debug!(?err, "transport read failed");
                break;
            }
        };

        let id = frame.stream_id;
        if frame.flags & FLAG_SYN != 0 {
            let (tx, rx) = mpsc::channel(STREAM_BUF);
            shared.streams.lock().insert(id, tx);
            let sub = SubStream::new(id, rx, Arc::clone(&shared));
            if accept_tx.send(sub).await.is_err() {
                // nobody accepting anymore
                break;
            }
            continue;
        }

        let entry = shared.streams.lock().get(&id).cloned();
        let Some(tx) = entry else {
            // unknown or already-torn-down stream; RSTs here are expected
            trace!(id, flags = frame.flags, "frame for unknown stream");
            continue;
        };

        if frame.flags & FLAG_RST != 0 {
            shared.deregister(id);
            let _ = tx.send(StreamEvent::Rst).await;
            continue;
        }
        if !frame.payload.is_empty() && tx.send(StreamEvent::Data(frame.payload)).await.is_err() {
            // receiver dropped without shutdown; tell the peer to stop
            shared.deregister(id);
            let _ = shared.out_tx.send(Frame::control(id, FLAG_RST)).await;
            continue;
        }
        if frame.flags & FLAG_FIN != 0 {
            shared.deregister(id);
            let _ = tx.send(StreamEvent::Fin).await;
        }
    }
    shared.closed.cancel();
    // senders drop with the map; readers observe EOF
    shared.streams.lock().clear();
}

/// One logical duplex byte stream inside a [`Session`].
///
/// Reads yield EOF after the peer half-closes; `poll_shutdown` half-closes
/// our direction. Dropping a stream that was not cleanly shut down sends RST.
pub struct SubStream {
    id: u32,
    events: mpsc::Receiver<StreamEvent>,
    pending: Bytes,
    read_done: bool,
    writer: PollSender<Frame>,
    write_done: bool,
    shared: Arc<Shared>,
}

impl fmt::Debug for SubStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubStream").field("id", &self.id).finish()
    }
}

impl SubStream {
    fn new(id: u32, events: mpsc::Receiver<StreamEvent>, shared: Arc<Shared>) -> SubStream {
        let writer = PollSender::new(shared.out_tx.clone());
        SubStream {
            id,
            events,
            pending: Bytes::new(),
            read_done: false,
            writer,
            write_done: false,
            shared,
        }
    }

    /// stream id within the session, mostly useful in logs
    pub fn id(&self) -> u32 {
        self.id
    }

    fn fill(&mut self, buf: &mut ReadBuf<'_>) {
        let n = self.pending.len().min(buf.remaining());
        buf.put_slice(&self.pending.split_to(n));
    }
}

impl AsyncRead for SubStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.pending.is_empty() {
            self.fill(buf);
            return Poll::Ready(Ok(()));
        }
        if self.read_done {
            return Poll::Ready(Ok(()));
        }
        match self.events.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(StreamEvent::Data(bytes))) => {
                self.pending = bytes;
                self.fill(buf);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(StreamEvent::Fin)) | Poll::Ready(None) => {
                // clean half-close, or the whole session went away
                self.read_done = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(StreamEvent::Rst)) => {
                self.read_done = true;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset by peer",
                )))
            }
        }
    }
}

impl AsyncWrite for SubStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_done || self.shared.closed.is_cancelled() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        match self.writer.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(MAX_PAYLOAD);
                let frame = Frame::data(self.id, Bytes::copy_from_slice(&buf[..n]));
                if self.writer.send_item(frame).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(n))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // frames are handed to the session writer on poll_write
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_done {
            return Poll::Ready(Ok(()));
        }
        match self.writer.poll_reserve(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => {
                self.write_done = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(())) => {
                let id = self.id;
                let _ = self.writer.send_item(Frame::control(id, FLAG_FIN));
                self.write_done = true;
                Poll::Ready(Ok(()))
            }
        }
    }
}

impl Drop for SubStream {
    fn drop(&mut self) {
        self.shared.deregister(self.id);
        if !(self.read_done && self.write_done) && !self.shared.closed.is_cancelled() {
            // best effort; if the queue is full the session is backed up
            // and teardown will reach the peer some other way
            let _ = self
                .shared
                .out_tx
                .try_send(Frame::control(self.id, FLAG_RST));
        }
    }
}

/// [`FrameTransport`] over any ordered byte pipe, using a length-delimited
/// codec. This is what the tests and local demos run the mux over.
pub struct LengthDelimited<T> {
    framed: Framed<T, LengthDelimitedCodec>,
}

impl<T> fmt::Debug for LengthDelimited<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LengthDelimited").finish()
    }
}

impl<T> LengthDelimited<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// wrap `io` in a length-delimited framing layer
    pub fn new(io: T) -> Self {
        let mut codec = LengthDelimitedCodec::new();
        codec.set_max_frame_length(MAX_PAYLOAD + HEADER_LEN);
        LengthDelimited {
            framed: Framed::new(io, codec),
        }
    }
}

/// Sending half of [`LengthDelimited`].
pub struct LengthDelimitedSink<T>(SplitSink<Framed<T, LengthDelimitedCodec>, Bytes>);

impl<T> fmt::Debug for LengthDelimitedSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LengthDelimitedSink").finish()
    }
}

/// Receiving half of [`LengthDelimited`].
pub struct LengthDelimitedSource<T>(SplitStream<Framed<T, LengthDelimitedCodec>>);

impl<T> fmt::Debug for LengthDelimitedSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LengthDelimitedSource").finish()
    }
}

impl<T> FrameTransport for LengthDelimited<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Sink = LengthDelimitedSink<T>;
    type Source = LengthDelimitedSource<T>;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, source) = self.framed.split();
        (LengthDelimitedSink(sink), LengthDelimitedSource(source))
    }
}

#[async_trait]
impl<T> FrameSink for LengthDelimitedSink<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.0.send(frame).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.close().await
    }
}

#[async_trait]
impl<T> FrameSource for LengthDelimitedSource<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        match self.0.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes.freeze())),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}
