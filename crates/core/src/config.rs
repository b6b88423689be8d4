//! Gateway configuration
//!
//! Loaded from a TOML file by the service binary; every field has a
//! default so a missing section never fails deserialization.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub media: MediaConfig,
    pub admin: AdminConfig,
}

/// General section: identity, timeouts, auth, module lists
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name reported by the `info` verb
    pub server_name: String,

    /// Idle seconds before the sweeper expires a session. 0 disables
    /// session timeouts entirely.
    pub session_timeout: u64,

    /// Shared API secret; `None` disables the mechanism
    pub api_secret: Option<String>,

    /// Enable token-based authentication
    pub token_auth: bool,

    /// Cap on concurrently running plugin-message workers; saturation is
    /// rejected instead of queued.
    pub max_message_workers: usize,

    /// Plugin packages to skip at registration
    pub disabled_plugins: Vec<String>,

    /// Transport packages to skip at registration
    pub disabled_transports: Vec<String>,

    /// Event-handler packages to skip at registration
    pub disabled_event_handlers: Vec<String>,

    /// Master switch for event-handler broadcasting
    pub broadcast_events: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            server_name: "rtcgate".to_string(),
            session_timeout: 60,
            api_secret: None,
            token_auth: false,
            max_message_workers: 64,
            disabled_plugins: Vec::new(),
            disabled_transports: Vec::new(),
            disabled_event_handlers: Vec::new(),
            broadcast_events: true,
        }
    }
}

/// Media section: knobs the core holds on behalf of the media stack
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Negotiate RFC 4588 retransmissions on plugin offers
    pub rfc4588: bool,

    /// Retransmission buffer length; values 1..=199 are refused by the
    /// admin mutator, 0 disables NACKs.
    pub max_nack_queue: usize,

    /// Seconds without media before the no-media event fires
    pub no_media_timer: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            rfc4588: false,
            max_nack_queue: 500,
            no_media_timer: 1,
        }
    }
}

/// Admin-API section
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Expose the admin API at all
    pub enabled: bool,

    /// Admin secret; `None` leaves the admin API unguarded
    pub admin_secret: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admin_secret: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}
