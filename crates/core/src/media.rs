//! ICE and SDP collaborator contracts
//!
//! The media stack (ICE/DTLS/SRTP) and the SDP parser live outside the
//! core; the core only routes calls through these two traits. Mock
//! implementations back the test suite, real ones are linked by the
//! deployment.

use std::any::Any;
use std::sync::Arc;

use serde_json::Value;

use crate::error::ApiError;
use crate::session::Handle;

/// Opaque reference to an ICE agent owned by the media stack
pub type IceAgentRef = Arc<dyn Any + Send + Sync>;

/// Per-media m-line counts extracted by the SDP pre-parse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaCounts {
    pub audio: usize,
    pub video: usize,
    pub data: usize,
}

/// A pre-parsed SDP blob plus its media summary
#[derive(Debug, Clone)]
pub struct ParsedSdp {
    pub sdp: String,
    pub counts: MediaCounts,
}

/// State of local candidate gathering for a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    InProgress,
    Done,
    Failed,
}

/// ICE/DTLS/SRTP stack contract (core -> media stack)
pub trait IceStack: Send + Sync {
    /// Set up the local ICE agent for a handle. `offer` is true when the
    /// peer sent the offer (the agent answers), false when a plugin is
    /// about to offer. `trickle` reflects the peer's trickle support.
    fn setup_local(
        &self,
        handle: &Arc<Handle>,
        offer: bool,
        counts: MediaCounts,
        trickle: bool,
    ) -> Result<IceAgentRef, String>;

    /// Restart ICE with fresh credentials on an established handle
    fn restart(&self, handle: &Arc<Handle>);

    /// Feed one trickled remote candidate to the agent
    fn add_candidate(&self, handle: &Arc<Handle>, candidate: &Value) -> Result<(), ApiError>;

    /// All remote candidates arrived up front: start connectivity checks
    fn setup_remote_candidates(&self, handle: &Arc<Handle>);

    /// Full-trickle mode: re-emit our cached local candidates (after an
    /// ICE restart)
    fn resend_trickles(&self, handle: &Arc<Handle>);

    /// Hang up the media session for a handle
    fn hangup(&self, handle: &Arc<Handle>, reason: &str);

    /// Local candidate-gathering progress for a handle
    fn gathering_state(&self, handle: &Arc<Handle>) -> GatheringState;

    /// Whether the handle's media stream exists yet (trickles arriving
    /// earlier are buffered by the core)
    fn stream_ready(&self, handle: &Arc<Handle>) -> bool;

    /// Whether the SCTP association for datachannels exists yet
    fn sctp_provisioned(&self, handle: &Arc<Handle>) -> bool;

    /// Create the SCTP association (datachannels negotiated late)
    fn create_sctp(&self, handle: &Arc<Handle>);

    /// Whether the server trickles its own candidates instead of
    /// embedding them all in the SDP
    fn full_trickle(&self) -> bool;

    /// Peer simulcast SSRCs (0 to 3 entries; fewer than 2 means no
    /// simulcast)
    fn peer_simulcast_ssrcs(&self, handle: &Arc<Handle>) -> Vec<u32> {
        let _ = handle;
        Vec::new()
    }

    /// Relay media towards the peer
    fn relay_rtp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]);
    fn relay_rtcp(&self, handle: &Arc<Handle>, video: bool, buf: &[u8]);
    fn relay_data(&self, handle: &Arc<Handle>, buf: &[u8]);

    /// Stream/component summary (states, I/O stats) for admin
    /// introspection
    fn stream_summary(&self, handle: &Arc<Handle>) -> Option<Value> {
        let _ = handle;
        None
    }

    /// Toggle the stack's own debug logging
    fn set_debug(&self, enabled: bool);

    /// Whether the stack's own debug logging is on
    fn is_debug_enabled(&self) -> bool;
}

/// SDP parser contract (core -> SDP stack)
pub trait SdpStack: Send + Sync {
    /// Parse and summarize an SDP blob; the error string becomes the
    /// JSEP_INVALID_SDP reason.
    fn preparse(&self, sdp: &str) -> Result<ParsedSdp, String>;

    /// Apply a parsed remote SDP to the handle's media session. `update`
    /// is true on renegotiation; an ICE-credential change must latch the
    /// handle's ICE_RESTART flag.
    fn process(&self, handle: &Arc<Handle>, parsed: &ParsedSdp, update: bool)
        -> Result<(), String>;

    /// Strip transport-level attributes before the SDP is shown to a
    /// plugin
    fn anonymize(&self, parsed: &ParsedSdp) -> Result<String, String>;

    /// Enrich a plugin-supplied SDP with the local ICE/DTLS/media
    /// attributes; the result becomes the handle's local SDP.
    fn merge(&self, handle: &Arc<Handle>, parsed: &ParsedSdp, offer: bool)
        -> Result<String, String>;
}
