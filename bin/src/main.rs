#![allow(clippy::cognitive_complexity)]
use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};

use cert_provider::{CertificateProvider, SelfSignedProvider};
use portal_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    gate::Gate,
    hub::{Authorizer, ReverseHub},
    lease::LeaseManager,
    router::{RouteTable, SniRouter},
    settings::SettingsStore,
    tokio::{self, net::TcpListener, runtime::Builder, signal, task::JoinHandle, time},
    tracing::*,
};
use relay_api::{ApiState, AuthManager};
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// expirer tick
const EXPIRE_INTERVAL: Duration = Duration::from_secs(1);
/// bounded wait for draining tasks on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.portal_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let rt = Builder::new_multi_thread()
        .thread_name("portal-worker")
        .enable_all()
        .build()?;

    rt.block_on(async move { flatten(tokio::spawn(start(config))).await })
}

async fn start(mut config: cli::Config) -> Result<()> {
    // every admin surface needs a key, generated when the operator gave none
    let admin_key = match &config.admin_secret_key {
        Some(key) => key.clone(),
        None => {
            let key = random_hex(16);
            info!(%key, "generated admin secret key");
            config.admin_secret_key = Some(key.clone());
            key
        }
    };
    let config = Arc::new(config);

    debug!("loading admin settings");
    let settings_store = Arc::new(SettingsStore::new(&config.settings_path));
    let settings = settings_store
        .load()
        .context("reading admin settings")?;

    let leases = Arc::new(LeaseManager::new(
        config.lease_ttl(),
        settings.banned_leases.iter().cloned().collect(),
    ));
    let gate = Arc::new(Gate::new(config.lease_bps, config.max_connections_per_lease));
    gate.restore(settings.gate_snapshot());
    let routes = Arc::new(RouteTable::new());
    let hub = ReverseHub::new(Arc::clone(&leases) as Arc<dyn Authorizer>);

    // every removal, whatever the cause, unwires the route, the reverse
    // sessions and the per-lease limits
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

    if config.funnel_domain != "localhost" {
        warn!(
            funnel_domain = %config.funnel_domain,
            "no ACME provider wired, serving self-signed certificates"
        );
    }
    let certs: Arc<dyn CertificateProvider> =
        Arc::new(SelfSignedProvider::new(config.funnel_domain.clone()));

    let token = CancellationToken::new();
    let expirer = leases.spawn_expirer(EXPIRE_INTERVAL, token.clone());

    debug!("binding listeners");
    let http_listener = TcpListener::bind(config.http_addr())
        .await
        .with_context(|| format!("binding http listener on {}", config.http_addr()))?;
    let sni_listener = TcpListener::bind(config.sni_addr())
        .await
        .with_context(|| format!("binding SNI listener on {}", config.sni_addr()))?;

    let sni = SniRouter::new(
        Arc::clone(&routes),
        Arc::clone(&leases),
        Arc::clone(&hub),
        Arc::clone(&gate),
        config.hello_timeout(),
        config.acquire_timeout(),
    );
    let state = Arc::new(ApiState {
        acquire_timeout: config.acquire_timeout(),
        auth: Arc::new(AuthManager::new(admin_key)),
        leases: Arc::clone(&leases),
        hub: Arc::clone(&hub),
        gate,
        routes,
        certs,
        settings: settings_store,
        shutdown: token.clone(),
        cfg: Arc::clone(&config),
    });

    info!(
        port = config.port,
        sni_port = config.sni_port,
        funnel_domain = %config.funnel_domain,
        "portal relay starting"
    );
    let mut sni_task = tokio::spawn(sni.listen(sni_listener, token.clone()));
    let mut http_task = tokio::spawn(relay_api::serve(state, http_listener, token.clone()));

    tokio::select! {
        res = &mut sni_task => {
            token.cancel();
            return flatten_now(res).context("SNI front door exited");
        }
        res = &mut http_task => {
            token.cancel();
            return flatten_now(res).context("http listener exited");
        }
        res = signal::ctrl_c() => {
            info!("caught shutdown signal handler");
            if let Err(err) = res {
                error!(?err);
            }
        }
    }

    info!("notifying tasks of shutdown...");
    token.cancel();
    if time::timeout(DRAIN_TIMEOUT, hub.stop()).await.is_err() {
        error!("reverse sessions did not drain in time, exiting anyway");
    }
    for (name, task) in [("sni", sni_task), ("http", http_task)] {
        match time::timeout(DRAIN_TIMEOUT, task).await {
            Ok(res) => {
                if let Err(err) = flatten_now(res) {
                    error!(?err, name, "task exited with error");
                }
            }
            Err(_) => error!(name, "task did not finish in time"),
        }
    }
    if let Err(err) = expirer.await {
        error!(?err, "error waiting for lease expirer");
    }
    info!("all tasks finished cleanly");
    Ok(())
}

fn random_hex(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    flatten_now(handle.await)
}

fn flatten_now<T>(
    res: Result<Result<T, anyhow::Error>, tokio::task::JoinError>,
) -> Result<T, anyhow::Error> {
    match res {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}
