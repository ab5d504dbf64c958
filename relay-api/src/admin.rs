//! Operator controls: ban/unban, approval, per-lease limits and IP bans.
//! Every mutation persists `admin_settings.json` before responding, so the
//! relay comes back with the same policy after a restart.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use portal_core::{gate::ApprovalMode, settings::AdminSettings};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::{
    auth::SESSION_COOKIE,
    models::{ApiError, OkResponse},
    ApiState,
};

#[derive(Debug, Deserialize)]
pub(crate) struct LoginRequest {
    key: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LeaseTarget {
    lease_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LimitsRequest {
    lease_id: String,
    #[serde(default)]
    bps: Option<u64>,
    #[serde(default)]
    max_conns: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApprovalModeRequest {
    mode: ApprovalMode,
}

#[derive(Debug, Deserialize)]
pub(crate) struct IpTarget {
    ip: IpAddr,
}

/// one row of `GET /api/admin/leases`
#[derive(Debug, Serialize)]
pub(crate) struct LeaseView {
    lease_id: String,
    name: String,
    metadata: serde_json::Value,
    tls_mode: portal_core::lease::TlsMode,
    client_ip: IpAddr,
    first_seen: chrono::DateTime<chrono::Utc>,
    last_seen: chrono::DateTime<chrono::Utc>,
    expires_in_secs: u64,
    active_conns: u32,
    reverse_sessions: usize,
    approved: bool,
}

#[instrument(level = "debug", skip_all)]
pub(crate) async fn login(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> Response {
    match state.auth.validate_key(&req.key, addr.ip()) {
        Ok(()) => {
            let cookie = format!(
                "{SESSION_COOKIE}={}; HttpOnly; Path=/; Max-Age=86400; SameSite=Strict",
                state.auth.create_session()
            );
            info!(ip = %addr.ip(), "admin login");
            let mut resp = OkResponse::new().into_response();
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    resp.headers_mut().insert(header::SET_COOKIE, value);
                    resp
                }
                Err(_) => {
                    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "cookie encoding")
                        .into_response()
                }
            }
        }
        Err(err) => {
            warn!(ip = %addr.ip(), %err, "admin login refused");
            ApiError::new(StatusCode::UNAUTHORIZED, err.to_string()).into_response()
        }
    }
}

fn persist(state: &ApiState) -> Result<(), ApiError> {
    let settings = AdminSettings::from_parts(state.leases.banned_ids(), state.gate.snapshot());
    state.settings.persist(&settings).map_err(|err| {
        warn!(?err, "failed to persist admin settings");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "settings not persisted")
    })
}

pub(crate) async fn list_leases(State(state): State<Arc<ApiState>>) -> Json<Vec<LeaseView>> {
    let views = state
        .leases
        .list()
        .into_iter()
        .map(|lease| LeaseView {
            active_conns: state.gate.active_conns(&lease.id),
            reverse_sessions: state.hub.sessions_for(&lease.id),
            approved: state.gate.allowed(&lease.id),
            expires_in_secs: lease.expires_in().as_secs(),
            lease_id: lease.id,
            name: lease.name,
            metadata: lease.metadata,
            tls_mode: lease.tls_mode,
            client_ip: lease.client_ip,
            first_seen: lease.first_seen,
            last_seen: lease.last_seen,
        })
        .collect();
    Json(views)
}

pub(crate) async fn ban(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LeaseTarget>,
) -> Result<Json<OkResponse>, ApiError> {
    state.leases.ban(&req.lease_id);
    persist(&state)?;
    Ok(OkResponse::new())
}

pub(crate) async fn unban(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LeaseTarget>,
) -> Result<Json<OkResponse>, ApiError> {
    state.leases.unban(&req.lease_id);
    persist(&state)?;
    Ok(OkResponse::new())
}

pub(crate) async fn approve(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LeaseTarget>,
) -> Result<Json<OkResponse>, ApiError> {
    state.gate.approve(&req.lease_id);
    persist(&state)?;
    Ok(OkResponse::new())
}

pub(crate) async fn deny(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LeaseTarget>,
) -> Result<Json<OkResponse>, ApiError> {
    state.gate.deny(&req.lease_id);
    persist(&state)?;
    Ok(OkResponse::new())
}

pub(crate) async fn set_approval_mode(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<ApprovalModeRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    info!(mode = ?req.mode, "approval mode changed");
    state.gate.set_approval_mode(req.mode);
    persist(&state)?;
    Ok(OkResponse::new())
}

pub(crate) async fn set_limits(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<LimitsRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    if let Some(bps) = req.bps {
        state.gate.set_bps(&req.lease_id, bps);
    }
    if let Some(max) = req.max_conns {
        state.gate.set_conn_limit(&req.lease_id, max);
    }
    persist(&state)?;
    Ok(OkResponse::new())
}

pub(crate) async fn ban_ip(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<IpTarget>,
) -> Result<Json<OkResponse>, ApiError> {
    state.gate.ban_ip(req.ip);
    persist(&state)?;
    Ok(OkResponse::new())
}

pub(crate) async fn unban_ip(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<IpTarget>,
) -> Result<Json<OkResponse>, ApiError> {
    state.gate.unban_ip(req.ip);
    persist(&state)?;
    Ok(OkResponse::new())
}
