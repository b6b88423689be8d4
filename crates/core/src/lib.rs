//! rtcgate signaling and session-management core
//!
//! The engine of a general-purpose WebRTC gateway: it accepts JSON
//! control requests over pluggable transports, manages the lifecycle of
//! sessions and their handles, brokers SDP offer/answer and trickled ICE
//! candidates between remote peers and server-side plugins, and forwards
//! asynchronous plugin notifications back to the originating transport.
//!
//! The core never touches the network or the media plane itself: the
//! ICE/DTLS/SRTP stack, the SDP parser, the concrete transports, and the
//! application plugins are all collaborators behind the traits in
//! [`media`], [`transport`], [`plugin`], and [`events`].
//!
//! # Architecture
//!
//! ```text
//! Transport -> incoming_request -> FIFO queue -> dispatcher
//!                  (admin / control verbs inline, `message` -> worker pool)
//!                           |
//!                  session registry / handles
//!                           |
//!              ICE + SDP stacks        plugins
//!                           \\            /
//!                     push_event / relay callbacks
//! ```
//!
//! Everything process-wide hangs off one [`Gateway`] value constructed by
//! [`GatewayBuilder`] at startup; there are no hidden globals.

pub mod api;
pub mod auth;
pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod media;
pub mod message;
pub mod plugin;
pub mod session;
pub mod transport;

pub use config::Config;
pub use dispatch::Request;
pub use error::{codes, ApiError, Error, Result};
pub use events::{EventHandler, EVENT_HANDLER_API_VERSION};
pub use gateway::{Gateway, GatewayBuilder, SERVER_VERSION, SERVER_VERSION_STRING};
pub use media::{GatheringState, IceAgentRef, IceStack, MediaCounts, ParsedSdp, SdpStack};
pub use plugin::{GatewayCallbacks, Plugin, PluginResult, PluginSession, PLUGIN_API_VERSION};
pub use session::{Handle, PendingTrickle, Session, SessionRegistry, WebRtcFlags};
pub use transport::{
    ReplyToken, Transport, TransportSession, TRANSPORT_API_VERSION,
};
