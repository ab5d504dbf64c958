//! Admin-surface authentication: secret-key login, HMAC-signed session
//! cookies and a per-IP lockout after repeated failures.

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use crate::{models::ApiError, ApiState};

/// cookie carrying the admin session
pub const SESSION_COOKIE: &str = "portal_session";
/// failures before an IP is locked out
const MAX_FAILURES: u32 = 5;
/// lockout duration after too many failures
const LOCKOUT: Duration = Duration::from_secs(60);
/// admin sessions live this long
const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Login failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// wrong secret key
    #[error("invalid key")]
    BadKey,
    /// too many failures from this address recently
    #[error("too many failed attempts, try again later")]
    LockedOut,
}

#[derive(Default)]
struct FailureState {
    count: u32,
    locked_until: Option<Instant>,
}

/// Validates the admin key, mints signed session cookies, and throttles
/// brute-force attempts per source IP.
pub struct AuthManager {
    secret_key: String,
    sessions: Mutex<HashMap<String, Instant>>,
    failures: Mutex<HashMap<IpAddr, FailureState>>,
}

impl fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthManager").finish()
    }
}

impl AuthManager {
    /// manager checking against `secret_key`
    pub fn new(secret_key: impl Into<String>) -> Self {
        AuthManager {
            secret_key: secret_key.into(),
            sessions: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn sign(&self, sid: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(sid.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time key check with per-IP lockout bookkeeping.
    pub fn validate_key(&self, key: &str, ip: IpAddr) -> Result<(), AuthError> {
        {
            let mut failures = self.failures.lock();
            if let Some(state) = failures.get_mut(&ip) {
                match state.locked_until {
                    Some(until) if Instant::now() < until => return Err(AuthError::LockedOut),
                    Some(_) => {
                        // lockout elapsed
                        *state = FailureState::default();
                    }
                    None => {}
                }
            }
        }
        let ok: bool = key
            .as_bytes()
            .ct_eq(self.secret_key.as_bytes())
            .into();
        if ok {
            self.failures.lock().remove(&ip);
            Ok(())
        } else {
            self.record_failed_login(ip);
            Err(AuthError::BadKey)
        }
    }

    /// Count a failure; the Nth in a row locks the address out.
    pub fn record_failed_login(&self, ip: IpAddr) {
        let mut failures = self.failures.lock();
        let state = failures.entry(ip).or_default();
        state.count += 1;
        if state.count >= MAX_FAILURES {
            warn!(%ip, "admin login locked out");
            state.locked_until = Some(Instant::now() + LOCKOUT);
        }
    }

    /// Mint a session and return the cookie value (`sid.signature`).
    pub fn create_session(&self) -> String {
        use rand::RngCore;
        let mut sid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut sid);
        let sid = hex::encode(sid);
        self.sessions
            .lock()
            .insert(sid.clone(), Instant::now() + SESSION_TTL);
        let sig = self.sign(&sid);
        format!("{sid}.{sig}")
    }

    /// Verify a cookie value: signature first (constant time), then the
    /// session table and its expiry.
    pub fn validate_session(&self, cookie_value: &str) -> bool {
        let Some((sid, sig)) = cookie_value.split_once('.') else {
            return false;
        };
        let expect = self.sign(sid);
        let sig_ok: bool = expect.as_bytes().ct_eq(sig.as_bytes()).into();
        if !sig_ok {
            return false;
        }
        let mut sessions = self.sessions.lock();
        match sessions.get(sid) {
            Some(expiry) if Instant::now() < *expiry => true,
            Some(_) => {
                sessions.remove(sid);
                false
            }
            None => false,
        }
    }
}

fn session_cookie(req: &Request) -> Option<&str> {
    let cookies = req.headers().get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then_some(value)
    })
}

/// Middleware guarding the admin routes with the session cookie.
pub async fn require_admin(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match session_cookie(&req) {
        Some(value) if state.auth.validate_session(value) => Ok(next.run(req).await),
        _ => {
            warn!(ip = %addr.ip(), path = %req.uri().path(), "admin request without valid session");
            Err(ApiError::new(StatusCode::UNAUTHORIZED, "admin login required"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        format!("10.0.0.{last}").parse().unwrap()
    }

    #[tokio::test]
    async fn key_and_session_flow() {
        let auth = AuthManager::new("super-secret");
        assert_eq!(auth.validate_key("super-secret", ip(1)), Ok(()));

        let cookie = auth.create_session();
        assert!(auth.validate_session(&cookie));
        assert!(!auth.validate_session("bogus.bogus"));

        // tampered signature
        let (sid, _) = cookie.split_once('.').unwrap();
        assert!(!auth.validate_session(&format!("{sid}.{}", "0".repeat(64))));
    }

    #[tokio::test]
    async fn lockout_after_failures() {
        let auth = AuthManager::new("super-secret");
        for _ in 0..MAX_FAILURES {
            assert_eq!(auth.validate_key("wrong", ip(2)), Err(AuthError::BadKey));
        }
        // locked out now, even with the right key
        assert_eq!(
            auth.validate_key("super-secret", ip(2)),
            Err(AuthError::LockedOut)
        );
        // other addresses are unaffected
        assert_eq!(auth.validate_key("super-secret", ip(3)), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn lockout_expires() {
        let auth = AuthManager::new("super-secret");
        for _ in 0..MAX_FAILURES {
            let _ = auth.validate_key("wrong", ip(4));
        }
        assert_eq!(
            auth.validate_key("super-secret", ip(4)),
            Err(AuthError::LockedOut)
        );
        tokio::time::sleep(LOCKOUT + Duration::from_secs(1)).await;
        assert_eq!(auth.validate_key("super-secret", ip(4)), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_expire() {
        let auth = AuthManager::new("super-secret");
        let cookie = auth.create_session();
        assert!(auth.validate_session(&cookie));
        tokio::time::sleep(SESSION_TTL + Duration::from_secs(1)).await;
        assert!(!auth.validate_session(&cookie));
    }
}
