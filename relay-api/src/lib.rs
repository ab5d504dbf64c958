//! # Registration API & HTTP proxy
//!
//! This crate provides the relay's HTTP surface:
//!
//! /api/register, /api/renew, /api/unregister
//! /api/connect (WebSocket reverse sessions)
//! /api/admin/* (operator controls behind a session cookie)
//! /health, /ping, /metrics, /metrics-text
//!
//! plus the subdomain proxy: any request whose Host is
//! `<name>.<funnel-domain>` bypasses the routes above and is forwarded to
//! the lease's backend over a reverse sub-stream.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing, Router,
};
use cert_provider::CertificateProvider;
use portal_core::{
    config::cli,
    gate::Gate,
    hub::ReverseHub,
    lease::LeaseManager,
    router::RouteTable,
    settings::SettingsStore,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod admin;
pub mod auth;
pub mod connect;
pub mod models;
pub mod proxy;
pub mod register;

pub use auth::AuthManager;
pub use connect::WsTransport;

/// Everything the HTTP handlers share.
pub struct ApiState {
    /// relay configuration (funnel domain, public URL, noindex)
    pub cfg: Arc<cli::Config>,
    /// the lease registry
    pub leases: Arc<LeaseManager>,
    /// reverse session pool
    pub hub: Arc<ReverseHub>,
    /// rate/ACL policy
    pub gate: Arc<Gate>,
    /// SNI route table, kept in lockstep with registrations
    pub routes: Arc<RouteTable>,
    /// certificate material source
    pub certs: Arc<dyn CertificateProvider>,
    /// settings persistence
    pub settings: Arc<SettingsStore>,
    /// admin session management
    pub auth: Arc<AuthManager>,
    /// how long the proxy waits for a reverse sub-stream
    pub acquire_timeout: Duration,
    /// process-global shutdown signal
    pub shutdown: CancellationToken,
}

impl fmt::Debug for ApiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiState").finish()
    }
}

/// Requests addressed to a lease subdomain skip the control plane entirely
/// and go straight to the proxy, whatever their path.
async fn lease_host_gate(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if proxy::is_lease_host(&state, &req) {
        match proxy::handle(state, addr, req).await {
            Ok(resp) => resp,
            Err(err) => err.into_response(),
        }
    } else {
        next.run(req).await
    }
}

/// Assemble the full router.
pub fn app(state: Arc<ApiState>) -> Router {
    let admin_routes = Router::new()
        .route("/api/admin/leases", routing::get(admin::list_leases))
        .route("/api/admin/ban", routing::post(admin::ban))
        .route("/api/admin/unban", routing::post(admin::unban))
        .route("/api/admin/approve", routing::post(admin::approve))
        .route("/api/admin/deny", routing::post(admin::deny))
        .route(
            "/api/admin/approval-mode",
            routing::post(admin::set_approval_mode),
        )
        .route("/api/admin/limits", routing::post(admin::set_limits))
        .route("/api/admin/ban-ip", routing::post(admin::ban_ip))
        .route("/api/admin/unban-ip", routing::post(admin::unban_ip))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_admin,
        ));

    Router::new()
        .route("/api/register", routing::post(register::register))
        .route("/api/renew", routing::post(register::renew))
        .route("/api/unregister", routing::post(register::unregister))
        .route("/api/connect", routing::get(connect::connect))
        .route("/api/admin/login", routing::post(admin::login))
        .merge(admin_routes)
        .route("/health", routing::get(handlers::ok))
        .route("/ping", routing::get(handlers::ping))
        .route("/metrics", routing::get(handlers::metrics))
        .route("/metrics-text", routing::get(handlers::metrics_text))
        .fallback(proxy::not_found)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            lease_host_gate,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the HTTP surface until `shutdown` fires.
pub async fn serve(
    state: Arc<ApiState>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(addr = ?listener.local_addr()?, "http listener up");
    let router = app(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

mod handlers {
    use axum::{
        body::Body,
        http::{header, Response, StatusCode},
        response::IntoResponse,
    };
    use portal_core::metrics::{START_TIME, UPTIME};
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::error;

    pub(crate) async fn ok() -> impl IntoResponse {
        StatusCode::OK
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }

    pub(crate) async fn metrics() -> Result<impl IntoResponse, std::convert::Infallible> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap())
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf)).unwrap()),
        }
    }

    pub(crate) async fn metrics_text() -> Result<impl IntoResponse, std::convert::Infallible> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap())
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf)).unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cert_provider::SelfSignedProvider;
    use portal_core::{config::cli::Parser, hub::Authorizer, lease::LeaseError};
    use std::collections::HashSet;

    struct TestRelay {
        addr: SocketAddr,
        state: Arc<ApiState>,
        _settings_dir: tempfile::TempDir,
    }

    impl TestRelay {
        fn url(&self, path: &str) -> String {
            format!("http://{}{path}", self.addr)
        }
    }

    async fn start_relay() -> TestRelay {
        start_relay_with_certs(Arc::new(SelfSignedProvider::new("localhost"))).await
    }

    async fn start_relay_with_certs(certs: Arc<dyn CertificateProvider>) -> TestRelay {
        let cfg = Arc::new(cli::Config::parse_from([
            "portal",
            "--funnel-domain",
            "localhost",
            "--admin-secret-key",
            "test-admin-key",
        ]));
        let settings_dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::new(
            settings_dir.path().join("admin_settings.json"),
        ));
        let leases = Arc::new(LeaseManager::new(cfg.lease_ttl(), HashSet::new()));
        let hub = ReverseHub::new(Arc::clone(&leases) as Arc<dyn Authorizer>);
        let gate = Arc::new(Gate::new(0, 0));
        let routes = Arc::new(RouteTable::new());

        // same unwiring the relay binary installs
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

        let state = Arc::new(ApiState {
            auth: Arc::new(AuthManager::new("test-admin-key")),
            certs,
            leases,
            hub,
            gate,
            routes,
            settings,
            acquire_timeout: Duration::from_millis(200),
            shutdown: CancellationToken::new(),
            cfg,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(
            Arc::clone(&state),
            listener,
            state.shutdown.clone(),
        ));
        TestRelay {
            addr,
            state,
            _settings_dir: settings_dir,
        }
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn register_happy_path() -> anyhow::Result<()> {
        let relay = start_relay().await;
        let resp = client()
            .post(relay.url("/api/register"))
            .json(&serde_json::json!({"name": "demo", "metadata": {}}))
            .send()
            .await?;
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await?;
        assert_eq!(body["success"], true);
        let lease_id = body["lease_id"].as_str().unwrap();
        assert_eq!(lease_id.len(), 32);
        assert!(lease_id.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(body["reverse_token"].as_str().unwrap().len(), 64);
        assert_eq!(body["public_url"], "https://demo.localhost");
        assert!(body["tls_cert"]
            .as_str()
            .unwrap()
            .starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(body["tls_key"].as_str().unwrap().contains("PRIVATE KEY"));

        // visible in the registry and the route table
        assert!(relay.state.leases.lookup_by_name("demo").is_ok());
        assert!(relay.state.routes.resolve("demo.localhost").is_some());
        Ok(())
    }

    #[tokio::test]
    async fn register_rolls_back_on_cert_failure() -> anyhow::Result<()> {
        let provider = cert_provider::StaticProvider::default();
        *provider.fail_with.lock() = Some("issuer down".to_owned());
        let relay = start_relay_with_certs(Arc::new(provider)).await;

        let resp = client()
            .post(relay.url("/api/register"))
            .json(&serde_json::json!({"name": "demo"}))
            .send()
            .await?;
        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = resp.json().await?;
        assert_eq!(body["success"], false);

        // the half-registered lease must not survive
        assert!(relay.state.leases.list().is_empty());
        assert!(relay.state.routes.resolve("demo.localhost").is_none());
        assert!(relay
            .state
            .leases
            .register(
                portal_core::lease::NewLease::named("demo"),
                "127.0.0.1".parse()?
            )
            .is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn register_name_conflict() -> anyhow::Result<()> {
        let relay = start_relay().await;
        let c = client();
        let first = c
            .post(relay.url("/api/register"))
            .json(&serde_json::json!({"name": "demo"}))
            .send()
            .await?;
        assert_eq!(first.status(), 200);

        let second = c
            .post(relay.url("/api/register"))
            .json(&serde_json::json!({"name": "demo"}))
            .send()
            .await?;
        assert_eq!(second.status(), 409);
        let body: serde_json::Value = second.json().await?;
        assert_eq!(body["success"], false);
        assert!(body["message"].as_str().unwrap().contains("name conflict"));
        Ok(())
    }

    #[tokio::test]
    async fn register_invalid_name() -> anyhow::Result<()> {
        let relay = start_relay().await;
        let resp = client()
            .post(relay.url("/api/register"))
            .json(&serde_json::json!({"name": "Bad_Name"}))
            .send()
            .await?;
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await?;
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("valid DNS label"));
        // registry untouched
        assert!(relay.state.leases.list().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn renew_and_unregister_auth() -> anyhow::Result<()> {
        let relay = start_relay().await;
        let c = client();
        let body: serde_json::Value = c
            .post(relay.url("/api/register"))
            .json(&serde_json::json!({"name": "demo"}))
            .send()
            .await?
            .json()
            .await?;
        let lease_id = body["lease_id"].as_str().unwrap();
        let token = body["reverse_token"].as_str().unwrap();

        let bad = c
            .post(relay.url("/api/renew"))
            .json(&serde_json::json!({"lease_id": lease_id, "reverse_token": "0000"}))
            .send()
            .await?;
        assert_eq!(bad.status(), 401);

        let ok = c
            .post(relay.url("/api/renew"))
            .json(&serde_json::json!({"lease_id": lease_id, "reverse_token": token}))
            .send()
            .await?;
        assert_eq!(ok.status(), 200);
        let renew_body: serde_json::Value = ok.json().await?;
        assert_eq!(renew_body["success"], true);

        let gone = c
            .post(relay.url("/api/unregister"))
            .json(&serde_json::json!({"lease_id": lease_id, "reverse_token": token}))
            .send()
            .await?;
        assert_eq!(gone.status(), 200);

        // idempotent-ish: the second teardown is a clean 404
        let again = c
            .post(relay.url("/api/unregister"))
            .json(&serde_json::json!({"lease_id": lease_id, "reverse_token": token}))
            .send()
            .await?;
        assert_eq!(again.status(), 404);

        // unknown lease id on renew
        let unknown = c
            .post(relay.url("/api/renew"))
            .json(&serde_json::json!({"lease_id": "00".repeat(16), "reverse_token": token}))
            .send()
            .await?;
        assert_eq!(unknown.status(), 404);
        Ok(())
    }

    #[tokio::test]
    async fn admin_requires_session() -> anyhow::Result<()> {
        let relay = start_relay().await;
        let c = client();

        let denied = c.get(relay.url("/api/admin/leases")).send().await?;
        assert_eq!(denied.status(), 401);

        let refused = c
            .post(relay.url("/api/admin/login"))
            .json(&serde_json::json!({"key": "wrong"}))
            .send()
            .await?;
        assert_eq!(refused.status(), 401);

        let login = c
            .post(relay.url("/api/admin/login"))
            .json(&serde_json::json!({"key": "test-admin-key"}))
            .send()
            .await?;
        assert_eq!(login.status(), 200);
        let cookie = login
            .headers()
            .get("set-cookie")
            .unwrap()
            .to_str()?
            .split(';')
            .next()
            .unwrap()
            .to_owned();

        let listed = c
            .get(relay.url("/api/admin/leases"))
            .header("cookie", &cookie)
            .send()
            .await?;
        assert_eq!(listed.status(), 200);
        Ok(())
    }

    #[tokio::test]
    async fn admin_ban_persists() -> anyhow::Result<()> {
        let relay = start_relay().await;
        let c = client();
        let body: serde_json::Value = c
            .post(relay.url("/api/register"))
            .json(&serde_json::json!({"name": "demo"}))
            .send()
            .await?
            .json()
            .await?;
        let lease_id = body["lease_id"].as_str().unwrap().to_owned();

        let login = c
            .post(relay.url("/api/admin/login"))
            .json(&serde_json::json!({"key": "test-admin-key"}))
            .send()
            .await?;
        let cookie = login
            .headers()
            .get("set-cookie")
            .unwrap()
            .to_str()?
            .split(';')
            .next()
            .unwrap()
            .to_owned();

        let banned = c
            .post(relay.url("/api/admin/ban"))
            .header("cookie", &cookie)
            .json(&serde_json::json!({"lease_id": lease_id}))
            .send()
            .await?;
        assert_eq!(banned.status(), 200);

        assert_eq!(
            relay.state.leases.lookup_by_id(&lease_id),
            Err(LeaseError::NotFound)
        );
        // and it hit the settings file before the response went out
        let persisted = relay.state.settings.load()?;
        assert!(persisted.banned_leases.contains(&lease_id));
        // the ban unwired the SNI route too
        assert!(relay.state.routes.resolve("demo.localhost").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn tls_lease_redirected_to_https() -> anyhow::Result<()> {
        let relay = start_relay().await;
        let c = client();
        c.post(relay.url("/api/register"))
            .json(&serde_json::json!({"name": "demo", "tls_mode": "tls"}))
            .send()
            .await?;

        let resp = c
            .get(relay.url("/some/path?q=1"))
            .header("host", "demo.localhost")
            .send()
            .await?;
        assert_eq!(resp.status(), 301);
        assert_eq!(
            resp.headers().get("location").unwrap(),
            "https://demo.localhost/some/path?q=1"
        );
        Ok(())
    }

    #[tokio::test]
    async fn proxy_without_backend_is_503() -> anyhow::Result<()> {
        let relay = start_relay().await;
        let c = client();
        c.post(relay.url("/api/register"))
            .json(&serde_json::json!({"name": "demo", "tls_mode": "no-tls"}))
            .send()
            .await?;

        let resp = c
            .get(relay.url("/"))
            .header("host", "demo.localhost")
            .send()
            .await?;
        assert_eq!(resp.status(), 503);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_subdomain_is_404() -> anyhow::Result<()> {
        let relay = start_relay().await;
        let resp = client()
            .get(relay.url("/"))
            .header("host", "ghost.localhost")
            .send()
            .await?;
        assert_eq!(resp.status(), 404);
        Ok(())
    }

    #[tokio::test]
    async fn health_and_metrics() -> anyhow::Result<()> {
        let relay = start_relay().await;
        let c = client();
        assert_eq!(c.get(relay.url("/health")).send().await?.status(), 200);
        assert_eq!(c.get(relay.url("/ping")).send().await?.status(), 200);

        // a registration touches the lease gauge, so it must show up
        c.post(relay.url("/api/register"))
            .json(&serde_json::json!({"name": "metered"}))
            .send()
            .await?;
        let metrics = c.get(relay.url("/metrics-text")).send().await?;
        assert_eq!(metrics.status(), 200);
        assert!(metrics.text().await?.contains("active_leases"));
        Ok(())
    }
}
