//! # hub
//!
//! Holds the backend-initiated reverse sessions, keyed by lease, and hands
//! out one fresh sub-stream per inbound client connection. Sub-streams for
//! inbound clients are always opened *by the relay* on an already-attached
//! session; the backend only ever accepts. Within one lease, acquirers are
//! served strictly in arrival order; across sessions of the same lease the
//! hub round-robins.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use muxer::{FrameTransport, MuxError, Role, Session, SubStream};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    lease::{LeaseId, LeaseManager},
    metrics::REVERSE_SESSIONS,
};

/// Failures from attach/acquire.
#[derive(Debug, Error)]
pub enum HubError {
    /// the reverse token does not match the lease
    #[error("reverse token rejected")]
    Unauthorized,
    /// no active lease with that id
    #[error("no lease with that id")]
    NoLease,
    /// the wait deadline passed and no session was ever attached
    #[error("no reverse session attached")]
    NoSession,
    /// the wait deadline passed while sessions were busy dying
    #[error("timed out waiting for a reverse sub-stream")]
    Timeout,
    /// the lease was dropped or the hub is shutting down
    #[error("hub closed")]
    Closed,
    /// the multiplexer rejected the transport
    #[error(transparent)]
    Transport(#[from] MuxError),
}

/// Outcome of reverse-session authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// token matches a live lease
    Accepted,
    /// no live lease with that id
    NoLease,
    /// lease exists, token does not match
    BadToken,
}

/// Decides whether a backend may attach a reverse session for a lease.
pub trait Authorizer: Send + Sync + 'static {
    /// constant-time verdict for `(lease_id, reverse_token)`
    fn authorize(&self, lease_id: &str, reverse_token: &str) -> AuthOutcome;
}

impl Authorizer for LeaseManager {
    fn authorize(&self, lease_id: &str, reverse_token: &str) -> AuthOutcome {
        match self.lookup_by_id(lease_id) {
            Err(_) => AuthOutcome::NoLease,
            Ok(_) if self.authorize(lease_id, reverse_token) => AuthOutcome::Accepted,
            Ok(_) => AuthOutcome::BadToken,
        }
    }
}

struct SlotState {
    sessions: Vec<Arc<Session>>,
    rr: usize,
    closed: bool,
    ever_attached: bool,
}

struct LeaseSlot {
    state: Mutex<SlotState>,
    /// wakes the head-of-line acquirer when a session arrives or dies
    notify: Notify,
    /// FIFO handout queue; tokio mutexes wake waiters in arrival order
    handout: tokio::sync::Mutex<()>,
}

impl LeaseSlot {
    fn new() -> Arc<Self> {
        Arc::new(LeaseSlot {
            state: Mutex::new(SlotState {
                sessions: Vec::new(),
                rr: 0,
                closed: false,
                ever_attached: false,
            }),
            notify: Notify::new(),
            handout: tokio::sync::Mutex::new(()),
        })
    }

    fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut st = self.state.lock();
        let before = st.sessions.len();
        st.sessions.retain(|s| !Arc::ptr_eq(s, session));
        before != st.sessions.len()
    }
}

/// Pool of reverse sessions and the acquire/attach machinery.
pub struct ReverseHub {
    slots: RwLock<HashMap<LeaseId, Arc<LeaseSlot>>>,
    authorizer: Arc<dyn Authorizer>,
    shutdown: CancellationToken,
    live_sessions: AtomicUsize,
    drained: Notify,
}

impl fmt::Debug for ReverseHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseHub")
            .field("live_sessions", &self.live_sessions.load(Ordering::Acquire))
            .finish()
    }
}

impl ReverseHub {
    /// hub authorizing attaches through `authorizer`
    pub fn new(authorizer: Arc<dyn Authorizer>) -> Arc<Self> {
        Arc::new(ReverseHub {
            slots: RwLock::new(HashMap::new()),
            authorizer,
            shutdown: CancellationToken::new(),
            live_sessions: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    fn slot(&self, lease_id: &str) -> Arc<LeaseSlot> {
        if let Some(slot) = self.slots.read().get(lease_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(
            slots
                .entry(lease_id.to_owned())
                .or_insert_with(LeaseSlot::new),
        )
    }

    /// Authorize and adopt a backend transport as a reverse session for
    /// `lease_id`. On success the hub owns the session until the transport
    /// dies or the lease goes away.
    pub fn attach<T: FrameTransport>(
        self: &Arc<Self>,
        lease_id: &str,
        reverse_token: &str,
        transport: T,
    ) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }
        match self.authorizer.authorize(lease_id, reverse_token) {
            AuthOutcome::Accepted => {}
            AuthOutcome::NoLease => return Err(HubError::NoLease),
            AuthOutcome::BadToken => {
                warn!(lease_id, "reverse session attach rejected");
                return Err(HubError::Unauthorized);
            }
        }

        // the backend dialed us, so the relay is the responder side and
        // opens the sub-streams
        let session = Arc::new(Session::new(transport, Role::Responder));
        let slot = self.slot(lease_id);
        {
            let mut st = slot.state.lock();
            if st.closed {
                session.close();
                return Err(HubError::Closed);
            }
            st.sessions.push(Arc::clone(&session));
            st.ever_attached = true;
        }
        self.live_sessions.fetch_add(1, Ordering::AcqRel);
        REVERSE_SESSIONS.inc();
        info!(lease_id, "reverse session attached");
        slot.notify.notify_waiters();

        // watcher: unhook the session when its transport dies
        let hub = Arc::clone(self);
        let lease_id = lease_id.to_owned();
        let closed = session.closed_token();
        tokio::spawn(async move {
            closed.cancelled().await;
            if slot.remove_session(&session) {
                debug!(%lease_id, "reverse session detached");
            }
            REVERSE_SESSIONS.dec();
            if hub.live_sessions.fetch_sub(1, Ordering::AcqRel) == 1 {
                hub.drained.notify_waiters();
            }
            // wake waiters so they can fail over to other sessions
            slot.notify.notify_waiters();
        });
        Ok(())
    }

    /// Obtain a fresh sub-stream for an inbound client connection, waiting
    /// up to `timeout` for a session to be attached. FIFO per lease.
    pub async fn acquire(
        &self,
        lease_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SubStream, HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }
        let slot = self.slot(lease_id);
        tokio::select! {
            res = Self::acquire_from(&slot) => res,
            _ = tokio::time::sleep(timeout) => {
                crate::metrics::ACQUIRE_TIMEOUTS.inc();
                if slot.state.lock().ever_attached {
                    Err(HubError::Timeout)
                } else {
                    Err(HubError::NoSession)
                }
            }
            _ = cancel.cancelled() => Err(HubError::Closed),
            _ = self.shutdown.cancelled() => Err(HubError::Closed),
        }
    }

    async fn acquire_from(slot: &Arc<LeaseSlot>) -> Result<SubStream, HubError> {
        // serialize handouts; the queue on this mutex is the FIFO order
        let _turn = slot.handout.lock().await;
        loop {
            let candidate = {
                let mut st = slot.state.lock();
                if st.closed {
                    return Err(HubError::Closed);
                }
                if st.sessions.is_empty() {
                    None
                } else {
                    st.rr = (st.rr + 1) % st.sessions.len();
                    Some(Arc::clone(&st.sessions[st.rr]))
                }
            };
            match candidate {
                Some(session) => match session.open_substream().await {
                    Ok(sub) => return Ok(sub),
                    Err(err) => {
                        debug!(?err, "session refused sub-stream, removing");
                        slot.remove_session(&session);
                        session.close();
                    }
                },
                None => {
                    let notified = slot.notify.notified();
                    let ready = {
                        let st = slot.state.lock();
                        st.closed || !st.sessions.is_empty()
                    };
                    if !ready {
                        notified.await;
                    }
                }
            }
        }
    }

    /// Close every session for the lease and wake all waiters with
    /// `Closed`. Safe to call from the lease `on_deleted` callback.
    pub fn drop_lease(&self, lease_id: &str) {
        let slot = self.slots.write().remove(lease_id);
        if let Some(slot) = slot {
            let sessions = {
                let mut st = slot.state.lock();
                st.closed = true;
                std::mem::take(&mut st.sessions)
            };
            for session in &sessions {
                session.close();
            }
            if !sessions.is_empty() {
                debug!(lease_id, count = sessions.len(), "dropped reverse sessions");
            }
            slot.notify.notify_waiters();
        }
    }

    /// Fan `drop_lease` out to everything and wait until every session
    /// watcher has observed its transport gone. Callers bound the wait.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let ids: Vec<LeaseId> = self.slots.read().keys().cloned().collect();
        for id in ids {
            self.drop_lease(&id);
        }
        loop {
            let drained = self.drained.notified();
            if self.live_sessions.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// attached session count, for admin display
    pub fn session_count(&self) -> usize {
        self.live_sessions.load(Ordering::Acquire)
    }

    /// sessions currently attached for one lease
    pub fn sessions_for(&self, lease_id: &str) -> usize {
        self.slots
            .read()
            .get(lease_id)
            .map(|slot| slot.state.lock().sessions.len())
            .unwrap_or(0)
    }
}
