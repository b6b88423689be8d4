//! Plugin collaborator contract
//!
//! A plugin is a server-side application (videoroom, SIP, streaming, ...)
//! attached to handles. The core forwards `message` bodies and JSEP
//! envelopes to it and relays RTP/RTCP/data in both directions; everything
//! else about the plugin is opaque.
//!
//! Plugins are statically linked factories registered with the gateway
//! builder; each must report [`PLUGIN_API_VERSION`] (or newer) from
//! `api_compatibility()` or registration is refused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ApiError, Result};
use crate::session::Handle;

/// Minimum plugin API version accepted at registration
pub const PLUGIN_API_VERSION: u32 = 8;

/// Outcome of [`Plugin::handle_message`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginResult {
    /// Synchronous result: mapped to a `success` reply carrying
    /// `plugindata`. Must be a JSON object.
    Ok(Value),
    /// The plugin took the message for asynchronous processing: mapped to
    /// an `ack` reply, optionally with a hint string.
    OkWait(Option<String>),
    /// The plugin failed: mapped to a PLUGIN_MESSAGE error carrying the
    /// plugin's own message.
    Err(String),
}

/// Per-handle context shared between the core and a plugin.
///
/// The back-reference to the owning [`Handle`] is non-owning: a plugin
/// keeping a `PluginSession` alive cannot keep a torn-down handle alive
/// with it. Once `stopped` latches, every callback on this session becomes
/// a no-op.
pub struct PluginSession {
    handle: Weak<Handle>,
    stopped: AtomicBool,
}

impl PluginSession {
    pub(crate) fn new(handle: &Arc<Handle>) -> Arc<Self> {
        Arc::new(Self {
            handle: Arc::downgrade(handle),
            stopped: AtomicBool::new(false),
        })
    }

    /// The owning handle, if it is still alive
    pub fn handle(&self) -> Option<Arc<Handle>> {
        self.handle.upgrade()
    }

    /// False once the handle was detached or its session destroyed
    pub fn is_alive(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && self.handle.strong_count() > 0
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// Application plugin contract (core -> plugin)
///
/// Concurrency: two `message` requests on the same handle may reach
/// `handle_message` concurrently on different workers. The core serializes
/// JSEP and trickle processing per handle, but plain body-only messages
/// can interleave; plugins that need full serialization must provide it
/// internally.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Human-readable name (e.g. "Echo test")
    fn name(&self) -> &'static str;

    /// Unique package identifier (e.g. "plugin.echo")
    fn package(&self) -> &'static str;

    /// Module author
    fn author(&self) -> &'static str;

    /// One-line description
    fn description(&self) -> &'static str;

    /// Numeric module version
    fn version(&self) -> u32;

    /// Human-readable module version
    fn version_string(&self) -> &'static str;

    /// Plugin API version this module was built against
    fn api_compatibility(&self) -> u32;

    /// One-time initialization; the callback surface stays valid for the
    /// plugin's whole lifetime.
    fn init(&self, gateway: Arc<dyn GatewayCallbacks>) -> Result<()>;

    /// Tear the plugin down (called once at gateway shutdown)
    fn destroy(&self) {}

    /// A handle attached to this plugin
    fn create_session(&self, session: &Arc<PluginSession>) -> Result<()>;

    /// The handle is going away (detach, session destroy, timeout)
    fn destroy_session(&self, session: &Arc<PluginSession>) -> Result<()>;

    /// Handle a `message` request. `jsep`, when present, is the anonymized
    /// envelope described in the signaling state machine.
    async fn handle_message(
        &self,
        session: &Arc<PluginSession>,
        transaction: &str,
        body: Value,
        jsep: Option<Value>,
    ) -> PluginResult;

    /// The PeerConnection for this session just became usable
    fn setup_media(&self, session: &Arc<PluginSession>) {
        let _ = session;
    }

    /// The PeerConnection for this session was hung up
    fn hangup_media(&self, session: &Arc<PluginSession>) {
        let _ = session;
    }

    /// RTP arriving from the peer
    fn incoming_rtp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]) {
        let _ = (session, video, buf);
    }

    /// RTCP arriving from the peer
    fn incoming_rtcp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]) {
        let _ = (session, video, buf);
    }

    /// Datachannel payload arriving from the peer
    fn incoming_data(&self, session: &Arc<PluginSession>, buf: &[u8]) {
        let _ = (session, buf);
    }

    /// Plugin-specific state for admin introspection. Must return a JSON
    /// object; anything else is discarded with a warning.
    fn query_session(&self, session: &Arc<PluginSession>) -> Value;
}

/// Callback surface the core exposes to plugins (plugin -> core)
#[async_trait]
pub trait GatewayCallbacks: Send + Sync {
    /// Push an asynchronous event (and optionally a JSEP offer/answer) to
    /// the client behind this session. SDP supplied by the plugin is
    /// merged with the local ICE/DTLS attributes before leaving.
    async fn push_event(
        &self,
        session: &Arc<PluginSession>,
        transaction: Option<&str>,
        message: Value,
        jsep: Option<Value>,
    ) -> std::result::Result<(), ApiError>;

    /// Relay an RTP packet towards the peer
    fn relay_rtp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]);

    /// Relay an RTCP packet towards the peer
    fn relay_rtcp(&self, session: &Arc<PluginSession>, video: bool, buf: &[u8]);

    /// Relay a datachannel payload towards the peer
    fn relay_data(&self, session: &Arc<PluginSession>, buf: &[u8]);

    /// Hang up the PeerConnection without detaching the handle. Always
    /// deferred: the caller's task never runs the teardown itself.
    fn close_pc(&self, session: &Arc<PluginSession>);

    /// Detach the handle entirely. Always deferred, like `close_pc`.
    fn end_session(&self, session: &Arc<PluginSession>);

    /// Whether the event subsystem has any active sinks
    fn events_is_enabled(&self) -> bool;

    /// Hand an event record to the event subsystem on behalf of a plugin
    fn notify_event(&self, package: &str, session: Option<&Arc<PluginSession>>, event: Value);
}
