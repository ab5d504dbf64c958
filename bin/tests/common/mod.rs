//! In-process relay environment for end-to-end tests: real TCP listeners
//! for both front doors, the full component wiring from the binary, and a
//! throwaway settings file.

use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};

use cert_provider::SelfSignedProvider;
use portal_core::{
    config::cli::{Config, Parser},
    gate::Gate,
    hub::{Authorizer, ReverseHub},
    lease::LeaseManager,
    router::{RouteTable, SniRouter},
    settings::SettingsStore,
};
use relay_api::{ApiState, AuthManager};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub const ADMIN_KEY: &str = "e2e-admin-key";

pub struct RelayEnv {
    pub http_addr: SocketAddr,
    pub sni_addr: SocketAddr,
    pub leases: Arc<LeaseManager>,
    pub shutdown: CancellationToken,
    _settings_dir: tempfile::TempDir,
}

impl RelayEnv {
    pub async fn start(ttl: Duration) -> RelayEnv {
        let ttl_arg = ttl.as_secs().max(1).to_string();
        let cfg = Arc::new(Config::parse_from([
            "portal",
            "--funnel-domain",
            "localhost",
            "--admin-secret-key",
            ADMIN_KEY,
            "--lease-ttl",
            ttl_arg.as_str(),
        ]));
        let settings_dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::new(
            settings_dir.path().join("admin_settings.json"),
        ));

        let leases = Arc::new(LeaseManager::new(ttl, HashSet::new()));
        let gate = Arc::new(Gate::new(0, 0));
        let routes = Arc::new(RouteTable::new());
        let hub = ReverseHub::new(Arc::clone(&leases) as Arc<dyn Authorizer>);
        {
            let routes = Arc::clone(&routes);
            let hub = Arc::clone(&hub);
            let gate = Arc::clone(&gate);
            leases.set_on_deleted(move |lease| {
                routes.unregister_by_lease(&lease.id);
                hub.drop_lease(&lease.id);
                gate.release_lease(&lease.id);
            });
        }

        let shutdown = CancellationToken::new();
        let _expirer = leases.spawn_expirer(Duration::from_millis(100), shutdown.clone());

        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = http_listener.local_addr().unwrap();
        let sni_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let sni_addr = sni_listener.local_addr().unwrap();

        let sni = SniRouter::new(
            Arc::clone(&routes),
            Arc::clone(&leases),
            Arc::clone(&hub),
            Arc::clone(&gate),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        tokio::spawn(sni.listen(sni_listener, shutdown.clone()));

        let state = Arc::new(ApiState {
            acquire_timeout: Duration::from_secs(2),
            auth: Arc::new(AuthManager::new(ADMIN_KEY)),
            certs: Arc::new(SelfSignedProvider::new(cfg.funnel_domain.clone())),
            leases: Arc::clone(&leases),
            hub,
            gate,
            routes,
            settings,
            shutdown: shutdown.clone(),
            cfg,
        });
        tokio::spawn(relay_api::serve(state, http_listener, shutdown.clone()));

        RelayEnv {
            http_addr,
            sni_addr,
            leases,
            shutdown,
            _settings_dir: settings_dir,
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.http_addr)
    }
}

impl Drop for RelayEnv {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Tiny HTTP/1.1 service standing in for a user's backend: answers every
/// request with a fixed body and closes.
pub async fn spawn_echo_http(body: &'static str) -> SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                // read until the end of the request head
                loop {
                    let mut chunk = [0u8; 1024];
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(resp.as_bytes()).await;
            });
        }
    });
    addr
}

/// Wait (bounded) for a lease with `name` to appear in the registry.
pub async fn wait_for_lease(env: &RelayEnv, name: &str) {
    for _ in 0..100 {
        if env.leases.lookup_by_name(name).is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("lease {name:?} never appeared");
}

/// TCP connect helper for the SNI front door.
pub async fn sni_connect(env: &RelayEnv) -> TcpStream {
    TcpStream::connect(env.sni_addr).await.unwrap()
}
