//! Per-PeerConnection handle
//!
//! A handle is a child of exactly one session, bound to exactly one
//! plugin at attach time. It carries the signaling state machine's flag
//! word, the pending-trickle queue, and the local/remote SDP pair.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

use crate::capture::PacketCapture;
use crate::media::IceAgentRef;
use crate::plugin::{Plugin, PluginSession};
use crate::session::Session;

bitflags::bitflags! {
    /// WebRTC-related state bits of a handle.
    ///
    /// The bits are orthogonal by design: inbound and outbound JSEP paths
    /// set them independently and the admin API reports each one. Legal
    /// transitions are centralized in the [`Handle`] methods and the API
    /// handlers; illegal ones are refused with an error, never performed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WebRtcFlags: u32 {
        const GOT_OFFER        = 1 << 0;
        const GOT_ANSWER       = 1 << 1;
        const PROCESSING_OFFER = 1 << 2;
        const START            = 1 << 3;
        const READY            = 1 << 4;
        const STOP             = 1 << 5;
        const ALERT            = 1 << 6;
        const TRICKLE          = 1 << 7;
        const ALL_TRICKLES     = 1 << 8;
        const RESEND_TRICKLES  = 1 << 9;
        const TRICKLE_SYNCED   = 1 << 10;
        const ICE_RESTART      = 1 << 11;
        const DATA_CHANNELS    = 1 << 12;
        const HAS_AUDIO        = 1 << 13;
        const HAS_VIDEO        = 1 << 14;
        const RFC4588_RTX      = 1 << 15;
        const CLEANING         = 1 << 16;
    }
}

/// Trickle candidates older than this at replay time are discarded
pub const TRICKLE_MAX_AGE: Duration = Duration::from_secs(45);

/// A trickle candidate buffered until the SDP exchange it belongs to has
/// completed
#[derive(Debug, Clone)]
pub struct PendingTrickle {
    /// Transaction of the trickle request that carried it
    pub transaction: String,
    /// A single candidate object, or an array of them
    pub candidate: Value,
    /// When the candidate arrived
    pub received_at: Instant,
}

impl PendingTrickle {
    pub fn new(transaction: &str, candidate: Value) -> Self {
        Self {
            transaction: transaction.to_string(),
            candidate,
            received_at: Instant::now(),
        }
    }

    /// Whether this candidate is too old to be replayed
    pub fn is_stale(&self) -> bool {
        self.received_at.elapsed() > TRICKLE_MAX_AGE
    }
}

struct PluginBinding {
    plugin: Arc<dyn Plugin>,
    session: Arc<PluginSession>,
}

/// Per-PeerConnection object, owned by its session's handle map
pub struct Handle {
    id: u64,
    opaque_id: Option<String>,
    session: Weak<Session>,
    created: chrono::DateTime<chrono::Utc>,
    binding: Mutex<Option<PluginBinding>>,
    flags: Mutex<WebRtcFlags>,
    agent: Mutex<Option<IceAgentRef>>,
    local_sdp: Mutex<Option<String>>,
    remote_sdp: Mutex<Option<String>>,
    pending_trickles: Mutex<VecDeque<PendingTrickle>>,
    /// Serializes JSEP and trickle processing for this handle
    negotiation: tokio::sync::Mutex<()>,
    cleaning_done: Notify,
    dump_packets: AtomicBool,
    capture: Mutex<Option<Arc<PacketCapture>>>,
}

impl Handle {
    pub(crate) fn new(id: u64, opaque_id: Option<String>, session: &Arc<Session>) -> Arc<Self> {
        info!("Creating new handle {id} in session {}", session.id());
        Arc::new(Self {
            id,
            opaque_id,
            session: Arc::downgrade(session),
            created: chrono::Utc::now(),
            binding: Mutex::new(None),
            flags: Mutex::new(WebRtcFlags::empty()),
            agent: Mutex::new(None),
            local_sdp: Mutex::new(None),
            remote_sdp: Mutex::new(None),
            pending_trickles: Mutex::new(VecDeque::new()),
            negotiation: tokio::sync::Mutex::new(()),
            cleaning_done: Notify::new(),
            dump_packets: AtomicBool::new(false),
            capture: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn opaque_id(&self) -> Option<&str> {
        self.opaque_id.as_deref()
    }

    /// The owning session, if it is still alive
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    pub fn created(&self) -> chrono::DateTime<chrono::Utc> {
        self.created
    }

    /// Bind the plugin at attach time; exactly once per handle
    pub(crate) fn bind_plugin(
        &self,
        plugin: Arc<dyn Plugin>,
        session: Arc<PluginSession>,
    ) -> Result<(), &'static str> {
        let mut binding = self.binding.lock();
        if binding.is_some() {
            return Err("handle already attached to a plugin");
        }
        *binding = Some(PluginBinding { plugin, session });
        Ok(())
    }

    /// The attached plugin and its per-handle context
    pub fn binding(&self) -> Option<(Arc<dyn Plugin>, Arc<PluginSession>)> {
        self.binding
            .lock()
            .as_ref()
            .map(|b| (Arc::clone(&b.plugin), Arc::clone(&b.session)))
    }

    pub fn plugin(&self) -> Option<Arc<dyn Plugin>> {
        self.binding.lock().as_ref().map(|b| Arc::clone(&b.plugin))
    }

    pub fn plugin_session(&self) -> Option<Arc<PluginSession>> {
        self.binding.lock().as_ref().map(|b| Arc::clone(&b.session))
    }

    /// Snapshot of the flag word
    pub fn flags(&self) -> WebRtcFlags {
        *self.flags.lock()
    }

    pub fn is_set(&self, flags: WebRtcFlags) -> bool {
        self.flags.lock().contains(flags)
    }

    pub fn set_flags(&self, flags: WebRtcFlags) {
        self.flags.lock().insert(flags);
    }

    /// Clear bits; clearing CLEANING wakes any JSEP processing parked in
    /// [`Handle::wait_until_clean`].
    pub fn clear_flags(&self, flags: WebRtcFlags) {
        self.flags.lock().remove(flags);
        if flags.contains(WebRtcFlags::CLEANING) {
            self.cleaning_done.notify_waiters();
        }
    }

    /// Wait for a previous media session's cleanup to finish. Returns
    /// false if CLEANING is still set when the timeout expires.
    pub async fn wait_until_clean(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.cleaning_done.notified();
            if !self.is_set(WebRtcFlags::CLEANING) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.is_set(WebRtcFlags::CLEANING);
            }
        }
    }

    pub fn has_agent(&self) -> bool {
        self.agent.lock().is_some()
    }

    pub fn agent(&self) -> Option<IceAgentRef> {
        self.agent.lock().clone()
    }

    pub(crate) fn set_agent(&self, agent: IceAgentRef) {
        *self.agent.lock() = Some(agent);
    }

    pub(crate) fn drop_agent(&self) {
        *self.agent.lock() = None;
    }

    pub fn local_sdp(&self) -> Option<String> {
        self.local_sdp.lock().clone()
    }

    pub(crate) fn set_local_sdp(&self, sdp: String) {
        *self.local_sdp.lock() = Some(sdp);
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.remote_sdp.lock().clone()
    }

    pub(crate) fn set_remote_sdp(&self, sdp: String) {
        *self.remote_sdp.lock() = Some(sdp);
    }

    pub(crate) fn queue_trickle(&self, trickle: PendingTrickle) {
        self.pending_trickles.lock().push_back(trickle);
    }

    /// Drain the queue in FIFO order
    pub(crate) fn take_pending_trickles(&self) -> Vec<PendingTrickle> {
        self.pending_trickles.lock().drain(..).collect()
    }

    pub fn pending_trickle_count(&self) -> usize {
        self.pending_trickles.lock().len()
    }

    /// The per-handle negotiation lock; held across JSEP and trickle
    /// processing so the two never interleave on one handle.
    pub(crate) fn negotiation(&self) -> &tokio::sync::Mutex<()> {
        &self.negotiation
    }

    pub fn dump_enabled(&self) -> bool {
        self.dump_packets.load(Ordering::Acquire)
    }

    pub(crate) fn start_capture(&self, capture: Arc<PacketCapture>) -> Result<(), &'static str> {
        let mut slot = self.capture.lock();
        if slot.is_some() {
            return Err("text2pcap already started");
        }
        *slot = Some(capture);
        self.dump_packets.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn stop_capture(&self) -> Result<(), &'static str> {
        let mut slot = self.capture.lock();
        if slot.take().is_none() {
            return Err("text2pcap not started");
        }
        self.dump_packets.store(false, Ordering::Release);
        Ok(())
    }

    pub(crate) fn capture(&self) -> Option<Arc<PacketCapture>> {
        self.capture.lock().clone()
    }
}
