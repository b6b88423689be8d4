//! Transport collaborator contract
//!
//! A transport is the signaling carrier (HTTP long-poll, WebSocket, AMQP,
//! ...) that shuttles JSON requests and responses. The core never touches
//! the network itself: it only sees this interface, plus the opaque
//! per-connection [`TransportSession`] each request originates from.
//!
//! Transports are statically linked factories registered with the gateway
//! builder; each must report [`TRANSPORT_API_VERSION`] (or newer) from
//! `api_compatibility()` or registration is refused.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Minimum transport API version accepted at registration
pub const TRANSPORT_API_VERSION: u32 = 7;

/// Opaque per-request correlation token, handed back verbatim with the
/// reply so the transport can route it to the right client request.
pub type ReplyToken = Arc<dyn Any + Send + Sync>;

/// Opaque per-connection descriptor owned by a transport.
///
/// The core compares instances by identity ([`Arc::ptr_eq`]) when a
/// transport goes away; it never looks inside the descriptor.
pub struct TransportSession {
    descriptor: Arc<dyn Any + Send + Sync>,
}

impl TransportSession {
    /// Wrap a transport-private descriptor
    pub fn new(descriptor: Arc<dyn Any + Send + Sync>) -> Arc<Self> {
        Arc::new(Self { descriptor })
    }

    /// Downcast the descriptor back to the transport's own type
    pub fn descriptor<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.descriptor.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransportSession({:p})", Arc::as_ptr(&self.descriptor))
    }
}

/// Signaling carrier contract (core -> transport)
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable name (e.g. "RabbitMQ transport")
    fn name(&self) -> &'static str;

    /// Unique package identifier (e.g. "transport.ws")
    fn package(&self) -> &'static str;

    /// Module author
    fn author(&self) -> &'static str;

    /// One-line description
    fn description(&self) -> &'static str;

    /// Numeric module version
    fn version(&self) -> u32;

    /// Human-readable module version
    fn version_string(&self) -> &'static str;

    /// Transport API version this module was built against
    fn api_compatibility(&self) -> u32;

    /// Deliver a JSON message (reply or asynchronous event) to the client
    /// behind `instance`. `reply_token` is present when the message answers
    /// a specific request; `admin` tells the transport which API the
    /// message belongs to.
    async fn send_message(
        &self,
        instance: &Arc<TransportSession>,
        reply_token: Option<&ReplyToken>,
        admin: bool,
        message: Value,
    ) -> Result<()>;

    /// A session was created on this instance
    fn session_created(&self, instance: &Arc<TransportSession>, session_id: u64) {
        let _ = (instance, session_id);
    }

    /// A session originated by this instance is over. `timeout` is true
    /// when the sweeper expired it rather than the client destroying it.
    fn session_over(&self, instance: &Arc<TransportSession>, session_id: u64, timeout: bool) {
        let _ = (instance, session_id, timeout);
    }

    /// Tear the transport down (called once at gateway shutdown)
    fn destroy(&self) {}
}
