//! # lease
//!
//! `lease` is the authoritative registry of named, TTL-bound services. A
//! backend registers a name, gets back a `(lease_id, reverse_token)` pair,
//! and must renew before `expires` or the background expirer reaps the
//! lease. Every removal, whatever its cause, fires the `on_deleted`
//! callback so the SNI route table, the reverse hub and the rate gate can
//! unwire their per-lease state.
//!
//! All operations take the internal lock only for map manipulation; the
//! callback always runs after the lock is released.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::metrics::{ACTIVE_LEASES, EXPIRED_LEASES};

/// opaque lease identifier, 16 random bytes hex encoded
pub type LeaseId = String;

/// Whether the backend terminates TLS for this lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TlsMode {
    /// plain HTTP through the subdomain proxy
    #[serde(rename = "no-tls")]
    NoTls,
    /// TLS bytes bridged through the SNI front door, terminated by the backend
    #[serde(rename = "tls")]
    Tls,
}

/// One registered service.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    /// opaque id, unique for the process lifetime
    pub id: LeaseId,
    /// DNS label the lease is reachable under
    pub name: String,
    /// secret proving ownership on renew/unregister/attach
    pub reverse_token: String,
    /// advertised protocols, most preferred first
    pub alpn: Vec<String>,
    /// where TLS terminates
    pub tls_mode: TlsMode,
    /// opaque backend-supplied metadata (description, tags, ...)
    pub metadata: Value,
    /// wall-clock registration time
    pub first_seen: DateTime<Utc>,
    /// wall-clock time of the last successful register/renew
    pub last_seen: DateTime<Utc>,
    /// monotonic deadline; not visible to lookups past this point
    pub expires: Instant,
    /// remote address observed at registration/renewal
    pub client_ip: IpAddr,
}

impl Lease {
    fn expired(&self, now: Instant) -> bool {
        self.expires <= now
    }

    /// seconds until expiry, clamped at zero
    pub fn expires_in(&self) -> Duration {
        self.expires.saturating_duration_since(Instant::now())
    }
}

/// Fields a backend supplies when registering.
#[derive(Debug, Clone)]
pub struct NewLease {
    /// requested DNS label
    pub name: String,
    /// opaque metadata blob
    pub metadata: Value,
    /// advertised protocols; defaults to `http/1.1`
    pub alpn: Vec<String>,
    /// where TLS terminates; defaults to the backend
    pub tls_mode: TlsMode,
}

impl NewLease {
    /// a plain registration for `name` with default protocol settings
    pub fn named(name: impl Into<String>) -> Self {
        NewLease {
            name: name.into(),
            metadata: Value::Null,
            alpn: vec!["http/1.1".to_owned()],
            tls_mode: TlsMode::Tls,
        }
    }
}

/// Validation and authorization failures from the registry.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LeaseError {
    /// the name fails DNS label validation
    #[error("{0:?} is not a valid DNS label")]
    InvalidName(String),
    /// another unexpired lease holds the name
    #[error("name conflict: {0:?} is already registered")]
    NameConflict(String),
    /// the lease id is on the operator ban list
    #[error("lease is banned")]
    Banned,
    /// no active lease with that id
    #[error("lease not found")]
    NotFound,
    /// reverse token mismatch
    #[error("reverse token mismatch")]
    Unauthorized,
}

type OnDeleted = Arc<dyn Fn(&Lease) + Send + Sync>;

struct Inner {
    leases: HashMap<LeaseId, Lease>,
    names: HashMap<String, LeaseId>,
}

/// Thread-safe lease registry. See the module docs for the locking rules.
pub struct LeaseManager {
    inner: RwLock<Inner>,
    banned: RwLock<HashSet<LeaseId>>,
    ttl: Duration,
    on_deleted: Mutex<Option<OnDeleted>>,
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("ttl", &self.ttl)
            .field("active", &self.inner.read().leases.len())
            .finish()
    }
}

/// `true` when `name` is a valid lowercase DNS label
/// (`^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$`)
pub fn valid_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

fn random_hex(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

fn token_matches(expected: &str, candidate: &str) -> bool {
    expected
        .as_bytes()
        .ct_eq(candidate.as_bytes())
        .into()
}

impl LeaseManager {
    /// New registry with the given TTL; `banned` seeds the ban list from
    /// persisted settings.
    pub fn new(ttl: Duration, banned: HashSet<LeaseId>) -> Self {
        LeaseManager {
            inner: RwLock::new(Inner {
                leases: HashMap::new(),
                names: HashMap::new(),
            }),
            banned: RwLock::new(banned),
            ttl,
            on_deleted: Mutex::new(None),
        }
    }

    /// the configured TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Install the removal callback. Invoked outside the lock for every
    /// removal regardless of cause.
    pub fn set_on_deleted<F>(&self, f: F)
    where
        F: Fn(&Lease) + Send + Sync + 'static,
    {
        *self.on_deleted.lock() = Some(Arc::new(f));
    }

    fn fire_on_deleted(&self, lease: &Lease) {
        let cb = self.on_deleted.lock().clone();
        if let Some(cb) = cb {
            // a panicking callback must not take the expirer down with it
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(lease))).is_err() {
                error!(lease_id = %lease.id, "on_deleted callback panicked");
            }
        }
    }

    /// Create a lease for `req.name`. First registrant wins; the id and
    /// reverse token are fresh cryptographically-random hex strings.
    pub fn register(&self, req: NewLease, client_ip: IpAddr) -> Result<Lease, LeaseError> {
        if !valid_label(&req.name) {
            return Err(LeaseError::InvalidName(req.name));
        }
        let id = random_hex(16);
        let reverse_token = random_hex(32);
        if self.banned.read().contains(&id) {
            return Err(LeaseError::Banned);
        }

        let now = Instant::now();
        let wall = Utc::now();
        let lease = Lease {
            id: id.clone(),
            name: req.name.clone(),
            reverse_token,
            alpn: req.alpn,
            tls_mode: req.tls_mode,
            metadata: req.metadata,
            first_seen: wall,
            last_seen: wall,
            expires: now + self.ttl,
            client_ip,
        };

        let evicted = {
            let mut inner = self.inner.write();
            // the holder of the name may have expired between expirer ticks
            let evicted = match inner.names.get(&req.name) {
                Some(holder) => match inner.leases.get(holder) {
                    Some(held) if !held.expired(now) => {
                        return Err(LeaseError::NameConflict(req.name));
                    }
                    _ => {
                        let holder = holder.clone();
                        inner.leases.remove(&holder)
                    }
                },
                None => None,
            };
            inner.names.insert(req.name.clone(), id.clone());
            inner.leases.insert(id.clone(), lease.clone());
            ACTIVE_LEASES.set(inner.leases.len() as i64);
            evicted
        };
        if let Some(evicted) = evicted {
            self.fire_on_deleted(&evicted);
        }
        info!(lease_id = %lease.id, name = %lease.name, %client_ip, "lease registered");
        Ok(lease)
    }

    /// Advance `expires` and `last_seen`. Token verified in constant time.
    pub fn renew(
        &self,
        id: &str,
        reverse_token: &str,
        client_ip: IpAddr,
    ) -> Result<Lease, LeaseError> {
        if self.banned.read().contains(id) {
            return Err(LeaseError::Banned);
        }
        let mut inner = self.inner.write();
        let ttl = self.ttl;
        let lease = inner.leases.get_mut(id).ok_or(LeaseError::NotFound)?;
        if !token_matches(&lease.reverse_token, reverse_token) {
            return Err(LeaseError::Unauthorized);
        }
        lease.expires = Instant::now() + ttl;
        lease.last_seen = Utc::now();
        lease.client_ip = client_ip;
        trace!(lease_id = %id, "lease renewed");
        Ok(lease.clone())
    }

    /// Tear the lease down. Requires the reverse token; removing an already
    /// gone lease is `NotFound`, which callers may treat as success.
    pub fn unregister(&self, id: &str, reverse_token: &str) -> Result<(), LeaseError> {
        let removed = {
            let mut inner = self.inner.write();
            let lease = inner.leases.get(id).ok_or(LeaseError::NotFound)?;
            if !token_matches(&lease.reverse_token, reverse_token) {
                return Err(LeaseError::Unauthorized);
            }
            let Some(lease) = inner.leases.remove(id) else {
                return Err(LeaseError::NotFound);
            };
            inner.names.remove(&lease.name);
            ACTIVE_LEASES.set(inner.leases.len() as i64);
            lease
        };
        info!(lease_id = %id, name = %removed.name, "lease unregistered");
        self.fire_on_deleted(&removed);
        Ok(())
    }

    /// Case-folded lookup; expired and banned leases are invisible.
    pub fn lookup_by_name(&self, name: &str) -> Result<Lease, LeaseError> {
        let name = name.to_ascii_lowercase();
        let inner = self.inner.read();
        let id = inner.names.get(&name).ok_or(LeaseError::NotFound)?;
        self.visible(inner.leases.get(id))
    }

    /// Lookup by id; expired and banned leases are invisible.
    pub fn lookup_by_id(&self, id: &str) -> Result<Lease, LeaseError> {
        let inner = self.inner.read();
        self.visible(inner.leases.get(id))
    }

    fn visible(&self, lease: Option<&Lease>) -> Result<Lease, LeaseError> {
        let lease = lease.ok_or(LeaseError::NotFound)?;
        if lease.expired(Instant::now()) {
            return Err(LeaseError::NotFound);
        }
        if self.banned.read().contains(&lease.id) {
            return Err(LeaseError::NotFound);
        }
        Ok(lease.clone())
    }

    /// `true` when `(id, token)` names a live lease and the token matches.
    /// Constant-time on the token; used by the reverse hub's authorizer.
    pub fn authorize(&self, id: &str, reverse_token: &str) -> bool {
        match self.lookup_by_id(id) {
            Ok(lease) => token_matches(&lease.reverse_token, reverse_token),
            Err(_) => false,
        }
    }

    /// Snapshot of active leases, sorted by name.
    pub fn list(&self) -> Vec<Lease> {
        let now = Instant::now();
        let banned = self.banned.read();
        let inner = self.inner.read();
        let mut out: Vec<Lease> = inner
            .leases
            .values()
            .filter(|l| !l.expired(now) && !banned.contains(&l.id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Ban a lease id. An active lease with that id is removed immediately
    /// (firing `on_deleted`); the id stays rejected until `unban`.
    pub fn ban(&self, id: &str) {
        self.banned.write().insert(id.to_owned());
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.leases.remove(id);
            if let Some(lease) = &removed {
                inner.names.remove(&lease.name);
                ACTIVE_LEASES.set(inner.leases.len() as i64);
            }
            removed
        };
        if let Some(lease) = removed {
            info!(lease_id = %id, name = %lease.name, "lease banned");
            self.fire_on_deleted(&lease);
        } else {
            info!(lease_id = %id, "lease id banned");
        }
    }

    /// Lift a ban.
    pub fn unban(&self, id: &str) {
        if self.banned.write().remove(id) {
            info!(lease_id = %id, "lease unbanned");
        }
    }

    /// current ban list, for persisting to settings
    pub fn banned_ids(&self) -> Vec<LeaseId> {
        let mut out: Vec<_> = self.banned.read().iter().cloned().collect();
        out.sort();
        out
    }

    /// Remove every lease with `expires <= now`, firing callbacks after the
    /// lock is dropped. Returns how many were reaped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let removed: Vec<Lease> = {
            let mut inner = self.inner.write();
            let expired: Vec<LeaseId> = inner
                .leases
                .values()
                .filter(|l| l.expired(now))
                .map(|l| l.id.clone())
                .collect();
            let removed = expired
                .into_iter()
                .filter_map(|id| inner.leases.remove(&id))
                .collect::<Vec<_>>();
            for lease in &removed {
                inner.names.remove(&lease.name);
            }
            if !removed.is_empty() {
                ACTIVE_LEASES.set(inner.leases.len() as i64);
            }
            removed
        };
        for lease in &removed {
            debug!(lease_id = %lease.id, name = %lease.name, "lease expired");
            EXPIRED_LEASES.inc();
            self.fire_on_deleted(lease);
        }
        removed.len()
    }

    /// Run the expirer until `shutdown` fires. `interval` is 1 s in
    /// production; tests shrink it.
    pub fn spawn_expirer(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let mgr = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("lease expirer stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        let reaped = mgr.sweep_expired();
                        if reaped > 0 {
                            debug!(reaped, "expirer sweep");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn manager(ttl: Duration) -> Arc<LeaseManager> {
        Arc::new(LeaseManager::new(ttl, HashSet::new()))
    }

    #[test]
    fn register_and_lookup() {
        let mgr = manager(Duration::from_secs(30));
        let lease = mgr
            .register(NewLease::named("demo"), localhost())
            .unwrap();
        assert_eq!(lease.id.len(), 32);
        assert_eq!(lease.reverse_token.len(), 64);
        assert!(lease.id.bytes().all(|b| b.is_ascii_hexdigit()));

        let found = mgr.lookup_by_name("demo").unwrap();
        assert_eq!(found.id, lease.id);
        // lookups case-fold
        let found = mgr.lookup_by_name("DEMO").unwrap();
        assert_eq!(found.id, lease.id);
        assert_eq!(mgr.lookup_by_id(&lease.id).unwrap().name, "demo");
    }

    #[test]
    fn rejects_invalid_names() {
        let mgr = manager(Duration::from_secs(30));
        for bad in [
            "Bad_Name",
            "",
            "-lead",
            "trail-",
            "UPPER",
            "dot.ted",
            &"a".repeat(64),
        ] {
            let err = mgr
                .register(NewLease::named(bad), localhost())
                .unwrap_err();
            assert!(matches!(err, LeaseError::InvalidName(_)), "{bad:?}");
        }
        assert!(mgr.list().is_empty());
    }

    #[test]
    fn name_conflict_single_winner() {
        let mgr = manager(Duration::from_secs(30));
        mgr.register(NewLease::named("demo"), localhost()).unwrap();
        let err = mgr
            .register(NewLease::named("demo"), localhost())
            .unwrap_err();
        assert_eq!(err, LeaseError::NameConflict("demo".to_owned()));
    }

    #[tokio::test]
    async fn concurrent_registers_single_winner() {
        let mgr = manager(Duration::from_secs(30));
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let mgr = Arc::clone(&mgr);
            tasks.push(tokio::spawn(async move {
                mgr.register(NewLease::named("demo"), localhost()).is_ok()
            }));
        }
        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn renew_requires_matching_token() {
        let mgr = manager(Duration::from_secs(30));
        let lease = mgr
            .register(NewLease::named("demo"), localhost())
            .unwrap();

        let err = mgr
            .renew(&lease.id, "0000", localhost())
            .unwrap_err();
        assert_eq!(err, LeaseError::Unauthorized);
        // bad token left the lease untouched
        let unchanged = mgr.lookup_by_id(&lease.id).unwrap();
        assert_eq!(unchanged.last_seen, lease.last_seen);

        let renewed = mgr
            .renew(&lease.id, &lease.reverse_token, localhost())
            .unwrap();
        assert!(renewed.expires >= lease.expires);
    }

    #[test]
    fn unregister_is_idempotent() {
        let mgr = manager(Duration::from_secs(30));
        let lease = mgr
            .register(NewLease::named("demo"), localhost())
            .unwrap();
        mgr.unregister(&lease.id, &lease.reverse_token).unwrap();
        assert_eq!(
            mgr.unregister(&lease.id, &lease.reverse_token),
            Err(LeaseError::NotFound)
        );

        // name is free again and a new registration gets a fresh id
        let again = mgr
            .register(NewLease::named("demo"), localhost())
            .unwrap();
        assert_ne!(again.id, lease.id);
    }

    #[test]
    fn unregister_rejects_wrong_token() {
        let mgr = manager(Duration::from_secs(30));
        let lease = mgr
            .register(NewLease::named("demo"), localhost())
            .unwrap();
        assert_eq!(
            mgr.unregister(&lease.id, "bogus"),
            Err(LeaseError::Unauthorized)
        );
        assert!(mgr.lookup_by_id(&lease.id).is_ok());
    }

    #[tokio::test]
    #[traced_test]
    async fn expirer_reaps_and_fires_callback_once() {
        let mgr = manager(Duration::from_millis(100));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        mgr.set_on_deleted(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let lease = mgr.register(NewLease::named("x"), localhost()).unwrap();
        let shutdown = CancellationToken::new();
        let task = mgr.spawn_expirer(Duration::from_millis(20), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mgr.lookup_by_name("x"), Err(LeaseError::NotFound));
        assert_eq!(mgr.lookup_by_id(&lease.id), Err(LeaseError::NotFound));
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[test]
    fn expired_lease_is_invisible_before_sweep() {
        let mgr = manager(Duration::from_millis(1));
        let lease = mgr.register(NewLease::named("x"), localhost()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // not yet swept, still invisible
        assert_eq!(mgr.lookup_by_id(&lease.id), Err(LeaseError::NotFound));
        assert!(!mgr.authorize(&lease.id, &lease.reverse_token));
        // and the name can be claimed again
        assert!(mgr.register(NewLease::named("x"), localhost()).is_ok());
    }

    #[test]
    fn ban_removes_and_blocks() {
        let mgr = manager(Duration::from_secs(30));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        mgr.set_on_deleted(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let lease = mgr
            .register(NewLease::named("demo"), localhost())
            .unwrap();
        mgr.ban(&lease.id);
        assert_eq!(mgr.lookup_by_id(&lease.id), Err(LeaseError::NotFound));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.banned_ids(), vec![lease.id.clone()]);

        mgr.unban(&lease.id);
        assert!(mgr.banned_ids().is_empty());
    }

    #[test]
    fn authorize_is_strict() {
        let mgr = manager(Duration::from_secs(30));
        let lease = mgr
            .register(NewLease::named("demo"), localhost())
            .unwrap();
        assert!(mgr.authorize(&lease.id, &lease.reverse_token));
        assert!(!mgr.authorize(&lease.id, "nope"));
        assert!(!mgr.authorize("unknown", &lease.reverse_token));
    }

    #[test]
    fn label_validation() {
        assert!(valid_label("a"));
        assert!(valid_label("demo-1"));
        assert!(valid_label(&"a".repeat(63)));
        assert!(!valid_label(""));
        assert!(!valid_label(&"a".repeat(64)));
        assert!(!valid_label("-x"));
        assert!(!valid_label("x-"));
        assert!(!valid_label("X"));
        assert!(!valid_label("a_b"));
        assert!(!valid_label("a.b"));
    }
}
