//! Registration control plane: `/api/register`, `/api/renew`,
//! `/api/unregister`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use portal_core::{
    lease::{NewLease, TlsMode},
    metrics::{REGISTRATIONS, RENEWALS},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    models::{
        ApiError, LeaseAuth, OkResponse, RegisterRequest, RegisterResponse, RenewResponse,
    },
    ApiState,
};

/// certificate provisioning may block this long before we give up
const CERT_DEADLINE: Duration = Duration::from_secs(60);

/// Extract the client IP, trusting X-Forwarded-For when a fronting proxy
/// set it, falling back to the socket address.
pub(crate) fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> std::net::IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or_else(|| addr.ip())
}

#[instrument(level = "debug", skip_all, fields(name = %req.name))]
pub(crate) async fn register(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let ip = client_ip(&headers, addr);
    let new_lease = NewLease {
        name: req.name,
        metadata: req.metadata,
        alpn: req
            .alpn
            .unwrap_or_else(|| vec!["http/1.1".to_owned()]),
        tls_mode: req.tls_mode.unwrap_or(TlsMode::Tls),
    };
    let lease = state.leases.register(new_lease, ip)?;

    let fqdn = format!("{}.{}", lease.name, state.cfg.funnel_domain);
    state.routes.register_route(&fqdn, &lease.id);

    let cert = tokio::time::timeout(
        CERT_DEADLINE,
        state.certs.get_cert_pem(&lease.name, &state.shutdown),
    )
    .await;
    let pair = match cert {
        Ok(Ok(pair)) => pair,
        Ok(Err(err)) => {
            warn!(?err, name = %lease.name, "certificate provisioning failed, rolling back");
            return Err(rollback(&state, &lease).await);
        }
        Err(_) => {
            warn!(name = %lease.name, "certificate provisioning timed out, rolling back");
            return Err(rollback(&state, &lease).await);
        }
    };

    REGISTRATIONS.inc();
    info!(lease_id = %lease.id, name = %lease.name, "registered");
    Ok(Json(RegisterResponse {
        success: true,
        public_url: state.cfg.public_url(&lease.name),
        lease_id: lease.id,
        reverse_token: lease.reverse_token,
        tls_cert: pair.cert_pem,
        tls_key: pair.key_pem,
    }))
}

/// a lease without certificate material must not exist
async fn rollback(state: &ApiState, lease: &portal_core::lease::Lease) -> ApiError {
    if let Err(err) = state.leases.unregister(&lease.id, &lease.reverse_token) {
        debug!(?err, lease_id = %lease.id, "rollback unregister");
    }
    ApiError::unavailable("certificate unavailable")
}

#[instrument(level = "debug", skip_all)]
pub(crate) async fn renew(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<LeaseAuth>,
) -> Result<Json<RenewResponse>, ApiError> {
    let ip = client_ip(&headers, addr);
    let lease = state.leases.renew(&req.lease_id, &req.reverse_token, ip)?;
    RENEWALS.inc();

    // hand back current material so backends pick up rotations without a
    // second round trip; failure here never fails the renewal
    let pair = tokio::time::timeout(
        CERT_DEADLINE,
        state.certs.get_cert_pem(&lease.name, &state.shutdown),
    )
    .await
    .ok()
    .and_then(|r| r.ok());

    Ok(Json(RenewResponse {
        success: true,
        tls_cert: pair.as_ref().map(|p| p.cert_pem.clone()),
        tls_key: pair.map(|p| p.key_pem),
    }))
}

#[instrument(level = "debug", skip_all)]
pub(crate) async fn unregister(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LeaseAuth>,
) -> Result<Json<OkResponse>, ApiError> {
    match state.leases.unregister(&req.lease_id, &req.reverse_token) {
        Ok(()) => Ok(OkResponse::new()),
        Err(err) => {
            let api: ApiError = err.into();
            if api.status == StatusCode::NOT_FOUND {
                debug!(lease_id = %req.lease_id, "unregister for unknown lease");
            }
            Err(api)
        }
    }
}
