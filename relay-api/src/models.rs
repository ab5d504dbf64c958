//! Wire formats for the registration and admin APIs.
//!
//! Every error leaves the relay as `{"success": false, "message": "..."}`
//! with a matching HTTP status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use portal_core::{
    hub::HubError,
    lease::{LeaseError, TlsMode},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `POST /api/register` body
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// requested DNS label
    pub name: String,
    /// opaque metadata blob stored with the lease
    #[serde(default)]
    pub metadata: Value,
    /// advertised protocols; `http/1.1` when omitted
    #[serde(default)]
    pub alpn: Option<Vec<String>>,
    /// where TLS terminates; backend (`tls`) when omitted
    #[serde(default)]
    pub tls_mode: Option<TlsMode>,
}

/// `POST /api/register` response
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    /// always true on 200
    pub success: bool,
    /// opaque lease id, hex
    pub lease_id: String,
    /// secret for renew/unregister/connect
    pub reverse_token: String,
    /// where the lease is reachable
    pub public_url: String,
    /// PEM chain covering the lease's subdomain
    pub tls_cert: String,
    /// PEM private key
    pub tls_key: String,
}

/// body shared by renew and unregister
#[derive(Debug, Deserialize)]
pub struct LeaseAuth {
    /// lease id from registration
    pub lease_id: String,
    /// matching reverse token
    pub reverse_token: String,
}

/// `POST /api/renew` response
#[derive(Debug, Serialize)]
pub struct RenewResponse {
    /// always true on 200
    pub success: bool,
    /// present when the certificate rotated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<String>,
    /// present when the certificate rotated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<String>,
}

/// bare `{"success": true}`
#[derive(Debug, Serialize)]
pub struct OkResponse {
    /// always true
    pub success: bool,
}

impl OkResponse {
    pub(crate) fn new() -> Json<OkResponse> {
        Json(OkResponse { success: true })
    }
}

/// first frame a backend sends on `/api/connect`
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectEnvelope {
    /// lease id from registration
    pub lease_id: String,
    /// matching reverse token
    pub reverse_token: String,
}

/// An error response carrying a terse message and a stable status.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status to send
    pub status: StatusCode,
    /// short human-readable reason
    pub message: String,
}

impl ApiError {
    pub(crate) fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    pub(crate) fn bad_gateway(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_GATEWAY, message)
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<LeaseError> for ApiError {
    fn from(err: LeaseError) -> Self {
        let status = match &err {
            LeaseError::InvalidName(_) => StatusCode::BAD_REQUEST,
            LeaseError::NameConflict(_) => StatusCode::CONFLICT,
            LeaseError::Banned => StatusCode::FORBIDDEN,
            LeaseError::NotFound => StatusCode::NOT_FOUND,
            LeaseError::Unauthorized => StatusCode::UNAUTHORIZED,
        };
        ApiError::new(status, err.to_string())
    }
}

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        let status = match &err {
            HubError::Unauthorized => StatusCode::UNAUTHORIZED,
            HubError::NoLease => StatusCode::NOT_FOUND,
            // transient; the client is expected to retry
            _ => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiError::new(status, err.to_string())
    }
}
