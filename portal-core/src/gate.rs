//! # gate
//!
//! Per-lease traffic policy: a bytes/sec token bucket wrapped around each
//! direction of a bridge, a concurrent-connection cap, the approval gate and
//! the source-IP ban set. Buckets and counters are created lazily and torn
//! down by the lease `on_deleted` callback.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::lease::LeaseId;

/// Policy for whether unapproved leases may serve traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// every lease serves unless explicitly denied
    #[default]
    Auto,
    /// only explicitly approved leases serve
    Manual,
}

/// Token bucket where capacity equals the refill rate, so one second of
/// idle time buys at most one second of burst.
pub struct TokenBucket {
    rate: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    available: f64,
    refilled: Instant,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket").field("rate", &self.rate).finish()
    }
}

impl TokenBucket {
    /// bucket refilling `rate` bytes per second; `rate` must be non-zero
    pub fn new(rate: u64) -> Self {
        TokenBucket {
            rate,
            state: Mutex::new(BucketState {
                available: rate as f64,
                refilled: Instant::now(),
            }),
        }
    }

    /// configured bytes/sec
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Block until `n` tokens are available, then consume them. `n` larger
    /// than the capacity is clamped, so oversized chunks still pass.
    pub async fn take(&self, n: u64) {
        if n == 0 {
            return;
        }
        let n = (n.min(self.rate)) as f64;
        loop {
            let wait = {
                let mut st = self.state.lock();
                let now = Instant::now();
                let cap = self.rate as f64;
                st.available =
                    (st.available + now.duration_since(st.refilled).as_secs_f64() * cap).min(cap);
                st.refilled = now;
                if st.available >= n {
                    st.available -= n;
                    return;
                }
                Duration::from_secs_f64((n - st.available) / cap)
            };
            eprintln!("DEBUG take waiting {:?} at {:?}", wait, tokio::time::Instant::now());
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Default)]
struct ConnCount {
    active: AtomicU32,
}

/// Releases one connection slot when dropped.
pub struct ConnGuard {
    counter: Arc<ConnCount>,
}

impl fmt::Debug for ConnGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnGuard").finish()
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.counter.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
struct Approval {
    mode: ApprovalMode,
    approved: HashSet<LeaseId>,
    denied: HashSet<LeaseId>,
}

/// All per-lease policy state, shared by the SNI router and HTTP proxy.
pub struct Gate {
    default_bps: u64,
    default_max_conns: u32,
    bps_overrides: RwLock<HashMap<LeaseId, u64>>,
    buckets: RwLock<HashMap<LeaseId, Arc<TokenBucket>>>,
    conn_limits: RwLock<HashMap<LeaseId, u32>>,
    conns: RwLock<HashMap<LeaseId, Arc<ConnCount>>>,
    approval: RwLock<Approval>,
    ip_bans: RwLock<HashSet<IpAddr>>,
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("default_bps", &self.default_bps)
            .field("default_max_conns", &self.default_max_conns)
            .finish()
    }
}

impl Gate {
    /// Gate with process-wide defaults; `0` disables the respective limit.
    pub fn new(default_bps: u64, default_max_conns: u32) -> Self {
        Gate {
            default_bps,
            default_max_conns,
            bps_overrides: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
            conn_limits: RwLock::new(HashMap::new()),
            conns: RwLock::new(HashMap::new()),
            approval: RwLock::new(Approval::default()),
            ip_bans: RwLock::new(HashSet::new()),
        }
    }

    fn bps_for(&self, lease_id: &str) -> u64 {
        self.bps_overrides
            .read()
            .get(lease_id)
            .copied()
            .unwrap_or(self.default_bps)
    }

    /// The lease's token bucket, lazily created. `None` when throttling is
    /// disabled for this lease.
    pub fn bucket(&self, lease_id: &str) -> Option<Arc<TokenBucket>> {
        let rate = self.bps_for(lease_id);
        if rate == 0 {
            return None;
        }
        if let Some(bucket) = self.buckets.read().get(lease_id) {
            if bucket.rate() == rate {
                return Some(Arc::clone(bucket));
            }
        }
        let mut buckets = self.buckets.write();
        // limit may have changed under us; rebuild on mismatch
        let bucket = buckets
            .entry(lease_id.to_owned())
            .and_modify(|b| {
                if b.rate() != rate {
                    *b = Arc::new(TokenBucket::new(rate));
                }
            })
            .or_insert_with(|| Arc::new(TokenBucket::new(rate)));
        Some(Arc::clone(bucket))
    }

    /// Claim a connection slot for the lease. `None` when the cap is hit.
    pub fn try_conn(&self, lease_id: &str) -> Option<ConnGuard> {
        let limit = self
            .conn_limits
            .read()
            .get(lease_id)
            .copied()
            .unwrap_or(self.default_max_conns);
        let counter = {
            let mut conns = self.conns.write();
            Arc::clone(conns.entry(lease_id.to_owned()).or_default())
        };
        let mut current = counter.active.load(Ordering::Acquire);
        loop {
            if limit != 0 && current >= limit {
                debug!(lease_id, current, limit, "connection cap reached");
                return None;
            }
            match counter.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ConnGuard { counter }),
                Err(observed) => current = observed,
            }
        }
    }

    /// active connection count for a lease, for admin display
    pub fn active_conns(&self, lease_id: &str) -> u32 {
        self.conns
            .read()
            .get(lease_id)
            .map(|c| c.active.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// set the per-lease bps cap; `0` disables throttling for the lease
    pub fn set_bps(&self, lease_id: &str, bps: u64) {
        self.bps_overrides.write().insert(lease_id.to_owned(), bps);
        if bps == 0 {
            self.buckets.write().remove(lease_id);
        }
    }

    /// set the per-lease concurrent connection cap; `0` means unlimited
    pub fn set_conn_limit(&self, lease_id: &str, max: u32) {
        self.conn_limits.write().insert(lease_id.to_owned(), max);
    }

    /// current approval mode
    pub fn approval_mode(&self) -> ApprovalMode {
        self.approval.read().mode
    }

    /// switch between auto and manual approval
    pub fn set_approval_mode(&self, mode: ApprovalMode) {
        self.approval.write().mode = mode;
    }

    /// put the lease on the approved list (and off the denied list)
    pub fn approve(&self, lease_id: &str) {
        let mut a = self.approval.write();
        a.denied.remove(lease_id);
        a.approved.insert(lease_id.to_owned());
    }

    /// put the lease on the denied list (and off the approved list)
    pub fn deny(&self, lease_id: &str) {
        let mut a = self.approval.write();
        a.approved.remove(lease_id);
        a.denied.insert(lease_id.to_owned());
    }

    /// May this lease serve traffic right now? Denied always loses; in
    /// manual mode a lease must additionally be on the approved list.
    pub fn allowed(&self, lease_id: &str) -> bool {
        let a = self.approval.read();
        if a.denied.contains(lease_id) {
            return false;
        }
        match a.mode {
            ApprovalMode::Auto => true,
            ApprovalMode::Manual => a.approved.contains(lease_id),
        }
    }

    /// is this source address banned?
    pub fn ip_banned(&self, ip: IpAddr) -> bool {
        self.ip_bans.read().contains(&ip)
    }

    /// ban a source address
    pub fn ban_ip(&self, ip: IpAddr) {
        self.ip_bans.write().insert(ip);
    }

    /// lift a source address ban
    pub fn unban_ip(&self, ip: IpAddr) {
        self.ip_bans.write().remove(&ip);
    }

    /// Drop all runtime state for a deleted lease. Called from the lease
    /// `on_deleted` callback.
    pub fn release_lease(&self, lease_id: &str) {
        self.buckets.write().remove(lease_id);
        self.conns.write().remove(lease_id);
    }

    /// export for settings persistence
    pub fn snapshot(&self) -> GateSnapshot {
        let a = self.approval.read();
        GateSnapshot {
            bps_limits: self.bps_overrides.read().clone(),
            conn_limits: self.conn_limits.read().clone(),
            approval_mode: a.mode,
            approved_leases: a.approved.iter().cloned().collect(),
            denied_leases: a.denied.iter().cloned().collect(),
            banned_ips: self.ip_bans.read().iter().copied().collect(),
        }
    }

    /// seed from persisted settings at startup
    pub fn restore(&self, snap: GateSnapshot) {
        *self.bps_overrides.write() = snap.bps_limits;
        *self.conn_limits.write() = snap.conn_limits;
        {
            let mut a = self.approval.write();
            a.mode = snap.approval_mode;
            a.approved = snap.approved_leases.into_iter().collect();
            a.denied = snap.denied_leases.into_iter().collect();
        }
        *self.ip_bans.write() = snap.banned_ips.into_iter().collect();
    }
}

/// The gate's persistable state; merged into the settings file alongside
/// the lease ban list.
#[derive(Debug, Clone, Default)]
pub struct GateSnapshot {
    /// per-lease bps overrides
    pub bps_limits: HashMap<LeaseId, u64>,
    /// per-lease connection caps
    pub conn_limits: HashMap<LeaseId, u32>,
    /// auto or manual
    pub approval_mode: ApprovalMode,
    /// leases allowed in manual mode
    pub approved_leases: Vec<LeaseId>,
    /// leases always refused
    pub denied_leases: Vec<LeaseId>,
    /// source addresses refused at every front door
    pub banned_ips: Vec<IpAddr>,
}
