//! Session registry and lifecycle
//!
//! A session is a logical client context owning its handles; the registry
//! is the single process-wide table mapping session ids to live sessions.

pub mod handle;

pub use handle::{Handle, PendingTrickle, WebRtcFlags, TRICKLE_MAX_AGE};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{codes, ApiError};
use crate::transport::TransportSession;

/// The transport a session was created from. Fixed at creation; it may be
/// observed but never rebound.
#[derive(Clone)]
pub struct TransportOrigin {
    /// Package name of the originating transport
    pub transport: String,
    /// The connection instance the `create` arrived on
    pub instance: Arc<TransportSession>,
}

/// A logical client context
///
/// Owns its handle map; externally reachable only through the registry,
/// which hands out clones of the owning `Arc`. Once `destroyed` latches,
/// registry lookups no longer return the session even while references
/// remain live.
pub struct Session {
    id: u64,
    origin: TransportOrigin,
    handles: Mutex<HashMap<u64, Arc<Handle>>>,
    last_activity: Mutex<Instant>,
    destroyed: AtomicBool,
    timeout_latched: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

impl Session {
    fn new(id: u64, origin: TransportOrigin) -> Arc<Self> {
        info!("Creating new session: {id}");
        Arc::new(Self {
            id,
            origin,
            handles: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(Instant::now()),
            destroyed: AtomicBool::new(false),
            timeout_latched: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn origin(&self) -> &TransportOrigin {
        &self.origin
    }

    /// Record activity; called before any request-specific dispatch
    pub fn touch(&self) {
        let mut last = self.last_activity.lock();
        // Instant is monotonic, so this can only move forward
        *last = Instant::now();
    }

    /// How long this session has been idle
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub(crate) fn is_timeout_latched(&self) -> bool {
        self.timeout_latched.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Latch the destroyed flag; returns true exactly once
    pub(crate) fn mark_destroyed(&self) -> bool {
        self.destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Latch the timeout flag; returns true exactly once. Races between
    /// the sweeper and a concurrent destroy are resolved here.
    pub(crate) fn latch_timeout(&self) -> bool {
        self.timeout_latched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn insert_handle(&self, handle: Arc<Handle>) {
        self.handles.lock().insert(handle.id(), handle);
    }

    /// Look a handle up; clones the owning Arc under the lock
    pub fn find_handle(&self, handle_id: u64) -> Option<Arc<Handle>> {
        self.handles.lock().get(&handle_id).cloned()
    }

    pub(crate) fn remove_handle(&self, handle_id: u64) -> Option<Arc<Handle>> {
        self.handles.lock().remove(&handle_id)
    }

    /// Drain every handle out of the map (session teardown)
    pub(crate) fn take_handles(&self) -> Vec<Arc<Handle>> {
        self.handles.lock().drain().map(|(_, h)| h).collect()
    }

    /// Ids of the live handles, for admin introspection
    pub fn handle_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.handles.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }
}

/// Process-wide session table
///
/// One mutex, short critical sections: lookups clone the Arc under the
/// lock and nothing else.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    refcount_debug: AtomicBool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            refcount_debug: AtomicBool::new(false),
        }
    }

    /// Create and insert a session. A caller-supplied id that is already
    /// taken is a SESSION_CONFLICT; id 0 or `None` picks a random free
    /// nonzero id.
    pub fn create(
        &self,
        requested_id: Option<u64>,
        origin: TransportOrigin,
    ) -> Result<Arc<Session>, ApiError> {
        let mut sessions = self.sessions.lock();
        let id = match requested_id {
            Some(id) if id > 0 => {
                if sessions.contains_key(&id) {
                    return Err(ApiError::new(
                        codes::SESSION_CONFLICT,
                        "Session ID already in use",
                    ));
                }
                id
            }
            _ => loop {
                let id = rand::random::<u64>();
                if id != 0 && !sessions.contains_key(&id) {
                    break id;
                }
            },
        };
        let session = Session::new(id, origin);
        sessions.insert(id, Arc::clone(&session));
        if self.refcount_debug.load(Ordering::Relaxed) {
            debug!("refs: session {id} strong={}", Arc::strong_count(&session));
        }
        Ok(session)
    }

    /// Look a session up. Destroyed sessions are invisible even if a
    /// remove has not happened yet.
    pub fn find(&self, session_id: u64) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock();
        let session = sessions.get(&session_id)?;
        if session.is_destroyed() {
            return None;
        }
        if self.refcount_debug.load(Ordering::Relaxed) {
            debug!(
                "refs: session {session_id} strong={}",
                Arc::strong_count(session)
            );
        }
        Some(Arc::clone(session))
    }

    pub fn remove(&self, session_id: u64) -> Option<Arc<Session>> {
        let removed = self.sessions.lock().remove(&session_id);
        if let Some(session) = &removed {
            if self.refcount_debug.load(Ordering::Relaxed) {
                debug!(
                    "refs: session {session_id} removed, strong={}",
                    Arc::strong_count(session)
                );
            }
        }
        removed
    }

    /// Snapshot of every live session (sweeper, transport_gone)
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.sessions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub(crate) fn set_refcount_debug(&self, enabled: bool) {
        self.refcount_debug.store(enabled, Ordering::Relaxed);
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
