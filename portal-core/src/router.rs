//! # router
//!
//! The TLS front door. Accepts raw TCP, buffers just enough bytes to parse
//! the ClientHello's SNI, maps `<name>.<funnel-domain>` to a lease, and
//! bridges the socket to a freshly acquired reverse sub-stream, replaying
//! the buffered hello first. TLS is never terminated here; the relay is a
//! pure SNI-addressed byte bridge.
//!
//! Every reject path closes the socket without writing a single byte.

use std::{collections::HashMap, fmt, io, net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::{
    bridge,
    gate::Gate,
    hub::{HubError, ReverseHub},
    lease::{LeaseId, LeaseManager},
    metrics::{LIVE_BRIDGES, SNI_CONNECTIONS, SNI_REJECTED},
};
use tls_peek::PeekError;

/// hard cap on buffered ClientHello bytes
pub const MAX_HELLO: usize = 4096;

/// `fqdn -> lease_id` routes, installed on register and removed when the
/// lease dies.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, LeaseId>>,
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes.read().len())
            .finish()
    }
}

impl RouteTable {
    /// empty table
    pub fn new() -> Self {
        RouteTable::default()
    }

    /// install `fqdn -> lease_id`
    pub fn register_route(&self, fqdn: impl Into<String>, lease_id: impl Into<LeaseId>) {
        let fqdn = fqdn.into().to_ascii_lowercase();
        let lease_id = lease_id.into();
        debug!(%fqdn, %lease_id, "route installed");
        self.routes.write().insert(fqdn, lease_id);
    }

    /// remove every route pointing at `lease_id`
    pub fn unregister_by_lease(&self, lease_id: &str) {
        self.routes.write().retain(|fqdn, id| {
            if id == lease_id {
                debug!(%fqdn, %lease_id, "route removed");
                false
            } else {
                true
            }
        });
    }

    /// case-folded exact lookup
    pub fn resolve(&self, host: &str) -> Option<LeaseId> {
        self.routes
            .read()
            .get(&host.to_ascii_lowercase())
            .cloned()
    }

    /// number of installed routes
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// is the table empty?
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

#[derive(Debug, Error)]
enum Reject {
    #[error("client hello: {0}")]
    Hello(#[from] PeekError),
    #[error("hello read: {0}")]
    Io(#[from] io::Error),
    #[error("hello deadline passed")]
    Deadline,
    #[error("no route for {0:?}")]
    NoRoute(String),
    #[error("lease expired or banned")]
    LeaseGone,
    #[error("source ip banned")]
    IpBanned,
    #[error("lease not approved")]
    NotApproved,
    #[error("connection cap reached")]
    AtCap,
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl Reject {
    fn reason(&self) -> &'static str {
        match self {
            Reject::Hello(_) => "bad_hello",
            Reject::Io(_) => "io",
            Reject::Deadline => "deadline",
            Reject::NoRoute(_) => "no_route",
            Reject::LeaseGone => "lease_gone",
            Reject::IpBanned => "ip_banned",
            Reject::NotApproved => "not_approved",
            Reject::AtCap => "at_cap",
            Reject::Hub(_) => "no_substream",
        }
    }
}

/// The SNI-routed TCP listener.
pub struct SniRouter {
    routes: Arc<RouteTable>,
    leases: Arc<LeaseManager>,
    hub: Arc<ReverseHub>,
    gate: Arc<Gate>,
    hello_timeout: Duration,
    acquire_timeout: Duration,
}

impl fmt::Debug for SniRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniRouter")
            .field("routes", &self.routes)
            .finish()
    }
}

impl SniRouter {
    /// front door over the shared tables
    pub fn new(
        routes: Arc<RouteTable>,
        leases: Arc<LeaseManager>,
        hub: Arc<ReverseHub>,
        gate: Arc<Gate>,
        hello_timeout: Duration,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(SniRouter {
            routes,
            leases,
            hub,
            gate,
            hello_timeout,
            acquire_timeout,
        })
    }

    /// Accept connections until `shutdown` fires. Active bridges drain on
    /// their own when the hub closes the reverse sessions underneath them.
    pub async fn listen(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(addr = ?listener.local_addr()?, "SNI front door listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("SNI front door stopping");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            let router = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                SNI_CONNECTIONS.inc();
                if let Err(reject) = router.handle_conn(stream, peer, shutdown).await {
                    SNI_REJECTED.with_label_values(&[reject.reason()]).inc();
                    debug!(%peer, %reject, "connection rejected");
                }
            });
        }
    }

    #[instrument(name = "sni", level = "debug", skip_all, fields(%peer))]
    async fn handle_conn(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), Reject> {
        let mut hello = Vec::with_capacity(1024);
        let name = tokio::time::timeout(self.hello_timeout, async {
            loop {
                match tls_peek::server_name(&hello) {
                    Ok(name) => return Ok(name),
                    Err(PeekError::Incomplete) => {
                        if hello.len() >= MAX_HELLO {
                            return Err(Reject::Hello(PeekError::Malformed));
                        }
                        if stream.read_buf(&mut hello).await? == 0 {
                            return Err(Reject::Hello(PeekError::Incomplete));
                        }
                    }
                    Err(err) => return Err(Reject::Hello(err)),
                }
            }
        })
        .await
        .map_err(|_| Reject::Deadline)??;

        // SNI carries no port, but strip one defensively, plus any root dot
        let host = name
            .split(':')
            .next()
            .unwrap_or(&name)
            .trim_end_matches('.');

        let lease_id = self
            .routes
            .resolve(host)
            .ok_or_else(|| Reject::NoRoute(host.to_owned()))?;
        let lease = self
            .leases
            .lookup_by_id(&lease_id)
            .map_err(|_| Reject::LeaseGone)?;

        if self.gate.ip_banned(peer.ip()) {
            return Err(Reject::IpBanned);
        }
        if !self.gate.allowed(&lease_id) {
            return Err(Reject::NotApproved);
        }
        let _conn = self.gate.try_conn(&lease_id).ok_or(Reject::AtCap)?;

        let mut sub = self
            .hub
            .acquire(&lease_id, self.acquire_timeout, &shutdown)
            .await?;

        debug!(name = %lease.name, sub = sub.id(), "bridging");
        sub.write_all(&hello).await?;

        LIVE_BRIDGES.inc();
        let bridged = bridge::copy_bidirectional_limited(stream, sub, self.gate.bucket(&lease_id))
            .await;
        LIVE_BRIDGES.dec();
        match bridged {
            Ok((up, down)) => {
                debug!(name = %lease.name, up, down, "bridge finished");
                Ok(())
            }
            Err(err) => {
                // mid-stream failures are normal churn, not rejects
                debug!(name = %lease.name, ?err, "bridge errored");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hub::Authorizer,
        lease::{LeaseManager, NewLease},
    };
    use muxer::{LengthDelimited, Role, Session};
    use std::collections::HashSet;

    struct Stack {
        routes: Arc<RouteTable>,
        leases: Arc<LeaseManager>,
        hub: Arc<ReverseHub>,
        gate: Arc<Gate>,
        addr: SocketAddr,
        shutdown: CancellationToken,
    }

    async fn start_stack() -> Stack {
        start_stack_with_ttl(Duration::from_secs(30)).await
    }

    async fn start_stack_with_ttl(ttl: Duration) -> Stack {
        let leases = Arc::new(LeaseManager::new(ttl, HashSet::new()));
        let hub = ReverseHub::new(leases.clone() as Arc<dyn Authorizer>);
        let gate = Arc::new(Gate::new(0, 0));
        let routes = Arc::new(RouteTable::new());
        let router = SniRouter::new(
            Arc::clone(&routes),
            Arc::clone(&leases),
            Arc::clone(&hub),
            Arc::clone(&gate),
            Duration::from_secs(2),
            Duration::from_millis(500),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(router.listen(listener, shutdown.clone()));
        Stack {
            routes,
            leases,
            hub,
            gate,
            addr,
            shutdown,
        }
    }

    fn attach_backend(stack: &Stack, lease: &crate::lease::Lease) -> Session {
        let (relay_io, backend_io) = tokio::io::duplex(256 * 1024);
        let backend = Session::new(LengthDelimited::new(backend_io), Role::Initiator);
        stack
            .hub
            .attach(
                &lease.id,
                &lease.reverse_token,
                LengthDelimited::new(relay_io),
            )
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn routes_hello_to_backend() -> anyhow::Result<()> {
        let stack = start_stack().await;
        let lease = stack
            .leases
            .register(NewLease::named("demo"), "127.0.0.1".parse()?)?;
        stack.routes.register_route("demo.localhost", &lease.id);
        let backend = attach_backend(&stack, &lease);

        let mut client = TcpStream::connect(stack.addr).await?;
        let hello = tls_peek::encode_client_hello("demo.localhost");
        client.write_all(&hello).await?;

        // backend sees the replayed hello on a fresh sub-stream
        let mut sub = backend.accept_substream().await.unwrap();
        let mut got = vec![0u8; hello.len()];
        sub.read_exact(&mut got).await?;
        assert_eq!(got, hello);

        // and bytes flow back to the client
        sub.write_all(b"ServerHello-ish").await?;
        let mut buf = [0u8; 15];
        client.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ServerHello-ish");

        stack.shutdown.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn unknown_sni_closed_without_bytes() -> anyhow::Result<()> {
        let stack = start_stack().await;

        let mut client = TcpStream::connect(stack.addr).await?;
        client
            .write_all(&tls_peek::encode_client_hello("ghost.localhost"))
            .await?;
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await?;
        assert_eq!(n, 0);

        stack.shutdown.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn non_tls_bytes_closed() -> anyhow::Result<()> {
        let stack = start_stack().await;

        let mut client = TcpStream::connect(stack.addr).await?;
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await?, 0);

        stack.shutdown.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn expired_lease_closed_without_bytes() -> anyhow::Result<()> {
        let stack = start_stack_with_ttl(Duration::from_millis(150)).await;
        // wire route removal the way the relay does at startup
        {
            let routes = Arc::clone(&stack.routes);
            let hub = Arc::clone(&stack.hub);
            stack.leases.set_on_deleted(move |lease| {
                routes.unregister_by_lease(&lease.id);
                hub.drop_lease(&lease.id);
            });
        }

        let lease = stack
            .leases
            .register(NewLease::named("x"), "127.0.0.1".parse()?)?;
        stack.routes.register_route("x.localhost", &lease.id);
        let _backend = attach_backend(&stack, &lease);

        let expirer = stack
            .leases
            .spawn_expirer(Duration::from_millis(20), stack.shutdown.clone());
        // never renewed, so the expirer reaps it and unwires the route
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(stack.routes.is_empty());

        let mut client = TcpStream::connect(stack.addr).await?;
        client
            .write_all(&tls_peek::encode_client_hello("x.localhost"))
            .await?;
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await?, 0);

        stack.shutdown.cancel();
        let _ = expirer.await;
        Ok(())
    }

    #[tokio::test]
    async fn banned_ip_closed() -> anyhow::Result<()> {
        let stack = start_stack().await;
        let lease = stack
            .leases
            .register(NewLease::named("demo"), "127.0.0.1".parse()?)?;
        stack.routes.register_route("demo.localhost", &lease.id);
        let _backend = attach_backend(&stack, &lease);
        stack.gate.ban_ip("127.0.0.1".parse()?);

        let mut client = TcpStream::connect(stack.addr).await?;
        client
            .write_all(&tls_peek::encode_client_hello("demo.localhost"))
            .await?;
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await?, 0);

        stack.shutdown.cancel();
        Ok(())
    }

    #[tokio::test]
    async fn no_backend_times_out_and_closes() -> anyhow::Result<()> {
        let stack = start_stack().await;
        let lease = stack
            .leases
            .register(NewLease::named("demo"), "127.0.0.1".parse()?)?;
        stack.routes.register_route("demo.localhost", &lease.id);
        // no session attached

        let mut client = TcpStream::connect(stack.addr).await?;
        client
            .write_all(&tls_peek::encode_client_hello("demo.localhost"))
            .await?;
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await?, 0);

        stack.shutdown.cancel();
        Ok(())
    }
}
