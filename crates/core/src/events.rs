//! Event-sink collaborator contract
//!
//! Event handlers receive structured records about everything notable the
//! core does (sessions created and expired, JSEP exchanged, plugin and
//! transport originated events). Fan-out is fire-and-forget: a slow sink
//! never blocks the control plane.

use serde_json::Value;

/// Minimum event-handler API version accepted at registration
pub const EVENT_HANDLER_API_VERSION: u32 = 3;

/// Event record categories
pub mod event_type {
    pub const SESSION: &str = "session";
    pub const HANDLE: &str = "handle";
    pub const JSEP: &str = "jsep";
    pub const PLUGIN: &str = "plugin";
    pub const TRANSPORT: &str = "transport";
    pub const CORE: &str = "core";
}

/// Event sink contract (core -> event handler)
pub trait EventHandler: Send + Sync {
    /// Human-readable name
    fn name(&self) -> &'static str;

    /// Unique package identifier (e.g. "eventhandler.sample")
    fn package(&self) -> &'static str;

    /// Module author
    fn author(&self) -> &'static str;

    /// One-line description
    fn description(&self) -> &'static str;

    /// Numeric module version
    fn version(&self) -> u32;

    /// Human-readable module version
    fn version_string(&self) -> &'static str;

    /// Event-handler API version this module was built against
    fn api_compatibility(&self) -> u32;

    /// Receive one event record
    fn incoming_event(&self, event: Value);

    /// Answer an admin `query_eventhandler` request. Sinks that do not
    /// support queries return `None`.
    fn handle_request(&self, request: Value) -> Option<Value> {
        let _ = request;
        None
    }

    /// Tear the sink down (called once at gateway shutdown)
    fn destroy(&self) {}
}
