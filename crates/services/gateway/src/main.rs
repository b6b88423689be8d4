//! Gateway server binary entry point
//!
//! Bootstraps the rtcgate signaling core: parses arguments, loads the
//! configuration file, initializes logging, registers the statically
//! linked modules, and runs until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Start with a configuration file
//! cargo run -p rtcgate-gateway -- --config ./rtcgate.toml
//!
//! # Override individual settings from the environment
//! RTCGATE_SESSION_TIMEOUT=30 cargo run -p rtcgate-gateway
//! ```
//!
//! The stock binary links no transports, plugins, or media stacks;
//! deployments add theirs in [`register_modules`]. Startup refuses to
//! proceed without at least one transport.

use std::path::PathBuf;

use clap::Parser;
use rtcgate_core::{Config, Gateway, GatewayBuilder};
use tracing::info;
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter,
};

/// rtcgate WebRTC gateway
///
/// Signaling and session-management server brokering SDP and trickled ICE
/// between WebRTC peers and server-side plugins.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "RTCGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the session timeout (seconds, 0 disables expiry)
    #[arg(long, env = "RTCGATE_SESSION_TIMEOUT")]
    session_timeout: Option<u64>,

    /// Override the API secret
    #[arg(long, env = "RTCGATE_API_SECRET")]
    api_secret: Option<String>,

    /// Override the admin secret
    #[arg(long, env = "RTCGATE_ADMIN_SECRET")]
    admin_secret: Option<String>,

    /// Enable token-based authentication
    #[arg(long, env = "RTCGATE_TOKEN_AUTH", default_value_t = false)]
    token_auth: bool,
}

/// Registration point for statically linked modules.
///
/// A deployment build adds its transports, plugins, event handlers, and
/// ICE/SDP stacks here, e.g.:
///
/// ```ignore
/// builder
///     .ice(Arc::new(MyIceStack::new()))
///     .sdp(Arc::new(MySdpParser::new()))
///     .transport(Arc::new(WebSocketTransport::new()))
///     .plugin(Arc::new(EchoPlugin::new()))
/// ```
fn register_modules(builder: GatewayBuilder) -> GatewayBuilder {
    builder
}

/// Map the admin API's numeric log level onto a tracing filter
fn level_filter(level: u32) -> EnvFilter {
    let directive = match level {
        0 => "off",
        1 | 2 => "error",
        3 => "warn",
        4 => "info",
        5 => "debug",
        _ => "trace",
    };
    EnvFilter::new(directive)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(timeout) = args.session_timeout {
        config.general.session_timeout = timeout;
    }
    if let Some(secret) = args.api_secret {
        config.general.api_secret = Some(secret);
    }
    if let Some(secret) = args.admin_secret {
        config.admin.admin_secret = Some(secret);
    }
    if args.token_auth {
        config.general.token_auth = true;
    }

    let builder = Gateway::builder(config).on_log_level_change(Box::new(move |level| {
        let _ = reload_handle.reload(level_filter(level));
    }));
    let gateway = register_modules(builder).build()?;
    gateway.start()?;
    info!("rtcgate started");

    tokio::signal::ctrl_c().await?;
    info!("Ctrl+C received, shutting down");
    gateway.destroy().await;
    Ok(())
}
