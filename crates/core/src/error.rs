//! Error types for the rtcgate signaling core

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur inside the core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration parsing or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Module registration error (bad API version, duplicate package, ...)
    #[error("Module error: {0}")]
    Module(String),

    /// Transport delivery error
    #[error("Transport error: {0}")]
    Transport(String),

    /// The gateway is shutting down
    #[error("Gateway is stopping")]
    Stopping,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// Numeric error codes of the JSON control API.
///
/// These are wire-visible: clients match on the numbers, so they are kept
/// stable even where the reason strings evolve.
pub mod codes {
    /// Unclassified error
    pub const UNKNOWN: i32 = 490;
    /// Transport-specific error
    pub const TRANSPORT_SPECIFIC: i32 = 450;
    /// The request is missing
    pub const MISSING_REQUEST: i32 = 452;
    /// The verb is not known to this API
    pub const UNKNOWN_REQUEST: i32 = 453;
    /// The payload is not valid JSON
    pub const INVALID_JSON: i32 = 454;
    /// The payload is valid JSON but not an object
    pub const INVALID_JSON_OBJECT: i32 = 455;
    /// A mandatory element is missing
    pub const MISSING_MANDATORY_ELEMENT: i32 = 456;
    /// The verb cannot be addressed at this path (session/handle scope)
    pub const INVALID_REQUEST_PATH: i32 = 457;
    /// No such session
    pub const SESSION_NOT_FOUND: i32 = 458;
    /// No such handle
    pub const HANDLE_NOT_FOUND: i32 = 459;
    /// No such plugin
    pub const PLUGIN_NOT_FOUND: i32 = 460;
    /// The plugin refused the attach
    pub const PLUGIN_ATTACH: i32 = 461;
    /// The plugin could not handle the message
    pub const PLUGIN_MESSAGE: i32 = 462;
    /// The plugin refused the detach
    pub const PLUGIN_DETACH: i32 = 463;
    /// The JSEP type is neither offer nor answer
    pub const JSEP_UNKNOWN_TYPE: i32 = 464;
    /// The JSEP SDP failed to parse or process
    pub const JSEP_INVALID_SDP: i32 = 465;
    /// The trickle candidate references an invalid stream
    pub const TRICKLE_INVALID_STREAM: i32 = 466;
    /// An element has the wrong JSON type or an out-of-range value
    pub const INVALID_ELEMENT_TYPE: i32 = 467;
    /// The caller-supplied session id is already in use
    pub const SESSION_CONFLICT: i32 = 468;
    /// An answer arrived without a prior offer
    pub const UNEXPECTED_ANSWER: i32 = 469;
    /// No such token
    pub const TOKEN_NOT_FOUND: i32 = 470;
    /// The operation is illegal in the current WebRTC state
    pub const WEBRTC_STATE: i32 = 471;
    /// Missing or wrong secret/token
    pub const UNAUTHORIZED: i32 = 403;
    /// The token is not allowed to access this plugin
    pub const UNAUTHORIZED_PLUGIN: i32 = 405;
}

/// A wire-level API error: numeric code plus human-readable reason.
///
/// Serialized into `{janus:"error", error:{code, reason}}` replies and
/// always routed back on the originating transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("API error {code}: {reason}")]
pub struct ApiError {
    /// Numeric error code, see [`codes`]
    pub code: i32,
    /// Human-readable reason
    pub reason: String,
}

impl ApiError {
    /// Create an error with an explicit reason
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Create an error with the default reason string for its code
    pub fn from_code(code: i32) -> Self {
        Self::new(code, default_reason(code))
    }
}

fn default_reason(code: i32) -> &'static str {
    match code {
        codes::UNAUTHORIZED => "Unauthorized request (wrong or missing secret/token)",
        codes::UNAUTHORIZED_PLUGIN => "Unauthorized access to plugin (token is not allowed to)",
        codes::TRANSPORT_SPECIFIC => "Transport specific error",
        codes::MISSING_REQUEST => "Missing request",
        codes::UNKNOWN_REQUEST => "Unknown request",
        codes::INVALID_JSON => "Invalid JSON",
        codes::INVALID_JSON_OBJECT => "Invalid JSON object",
        codes::MISSING_MANDATORY_ELEMENT => "Missing mandatory element",
        codes::INVALID_REQUEST_PATH => "Invalid path for this request",
        codes::SESSION_NOT_FOUND => "Session not found",
        codes::HANDLE_NOT_FOUND => "Handle not found",
        codes::PLUGIN_NOT_FOUND => "Plugin not found",
        codes::PLUGIN_ATTACH => "Error attaching to plugin",
        codes::PLUGIN_MESSAGE => "Error sending message to plugin",
        codes::PLUGIN_DETACH => "Error detaching from plugin",
        codes::JSEP_UNKNOWN_TYPE => "Unsupported JSEP type",
        codes::JSEP_INVALID_SDP => "Invalid SDP",
        codes::TRICKLE_INVALID_STREAM => "Invalid stream",
        codes::INVALID_ELEMENT_TYPE => "Invalid element type",
        codes::SESSION_CONFLICT => "Session ID already in use",
        codes::UNEXPECTED_ANSWER => "Unexpected ANSWER (did we offer?)",
        codes::TOKEN_NOT_FOUND => "Token not found",
        codes::WEBRTC_STATE => "Invalid WebRTC state",
        _ => "Unknown error",
    }
}
