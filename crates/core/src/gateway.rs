//! The gateway runtime
//!
//! All process-wide state (session registry, module tables, auth, runtime
//! settings, stop latch) lives behind this one value, constructed at
//! startup and passed to every entry point. The dispatcher, the timeout
//! sweeper, and both callback surfaces hang off it; there are no hidden
//! globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{constant_time_eq, TokenAuth};
use crate::capture::PacketKind;
use crate::config::Config;
use crate::dispatch::{self, DeferredJob, QueueItem, Request};
use crate::error::{codes, ApiError, Error, Result};
use crate::events::{event_type, EventHandler, EVENT_HANDLER_API_VERSION};
use crate::media::{GatheringState, IceStack, ParsedSdp, SdpStack};
use crate::message::{envelope, error_reply};
use crate::plugin::{GatewayCallbacks, Plugin, PluginSession, PLUGIN_API_VERSION};
use crate::session::{
    Handle, Session, SessionRegistry, TransportOrigin, WebRtcFlags,
};
use crate::transport::{ReplyToken, Transport, TransportSession, TRANSPORT_API_VERSION};

/// Numeric server version reported by `info`
pub const SERVER_VERSION: u32 = 30;
/// Human-readable server version reported by `info`
pub const SERVER_VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

/// Sweeper tick period
const SWEEPER_TICK: Duration = Duration::from_secs(2);
/// How long JSEP processing waits for a previous media session's cleanup
pub(crate) const CLEANING_WAIT: Duration = Duration::from_secs(3);
/// Poll period while waiting for local candidate gathering
const GATHERING_POLL: Duration = Duration::from_millis(100);

/// Hook invoked when the admin API changes the log level
pub type LogLevelHook = Box<dyn Fn(u32) + Send + Sync>;

/// Runtime-mutable settings, exposed through the admin API
pub struct RuntimeSettings {
    session_timeout: AtomicU64,
    log_level: AtomicU32,
    log_timestamps: AtomicBool,
    log_colors: AtomicBool,
    locking_debug: AtomicBool,
    refcount_debug: AtomicBool,
    max_nack_queue: AtomicUsize,
    no_media_timer: AtomicU64,
}

impl RuntimeSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            session_timeout: AtomicU64::new(config.general.session_timeout),
            log_level: AtomicU32::new(4),
            log_timestamps: AtomicBool::new(false),
            log_colors: AtomicBool::new(true),
            locking_debug: AtomicBool::new(false),
            refcount_debug: AtomicBool::new(false),
            max_nack_queue: AtomicUsize::new(config.media.max_nack_queue),
            no_media_timer: AtomicU64::new(config.media.no_media_timer),
        }
    }

    pub fn session_timeout(&self) -> u64 {
        self.session_timeout.load(Ordering::Acquire)
    }

    pub fn set_session_timeout(&self, seconds: u64) {
        self.session_timeout.store(seconds, Ordering::Release);
    }

    pub fn log_level(&self) -> u32 {
        self.log_level.load(Ordering::Acquire)
    }

    pub fn set_log_level(&self, level: u32) {
        self.log_level.store(level, Ordering::Release);
    }

    pub fn log_timestamps(&self) -> bool {
        self.log_timestamps.load(Ordering::Acquire)
    }

    pub fn set_log_timestamps(&self, enabled: bool) {
        self.log_timestamps.store(enabled, Ordering::Release);
    }

    pub fn log_colors(&self) -> bool {
        self.log_colors.load(Ordering::Acquire)
    }

    pub fn set_log_colors(&self, enabled: bool) {
        self.log_colors.store(enabled, Ordering::Release);
    }

    pub fn locking_debug(&self) -> bool {
        self.locking_debug.load(Ordering::Acquire)
    }

    pub fn set_locking_debug(&self, enabled: bool) {
        self.locking_debug.store(enabled, Ordering::Release);
    }

    pub fn refcount_debug(&self) -> bool {
        self.refcount_debug.load(Ordering::Acquire)
    }

    pub fn set_refcount_debug(&self, enabled: bool) {
        self.refcount_debug.store(enabled, Ordering::Release);
    }

    pub fn max_nack_queue(&self) -> usize {
        self.max_nack_queue.load(Ordering::Acquire)
    }

    pub fn set_max_nack_queue(&self, value: usize) {
        self.max_nack_queue.store(value, Ordering::Release);
    }

    pub fn no_media_timer(&self) -> u64 {
        self.no_media_timer.load(Ordering::Acquire)
    }

    pub fn set_no_media_timer(&self, value: u64) {
        self.no_media_timer.store(value, Ordering::Release);
    }
}

/// Builder assembling a [`Gateway`] from config, media stacks, and the
/// statically linked modules
pub struct GatewayBuilder {
    config: Config,
    ice: Option<Arc<dyn IceStack>>,
    sdp: Option<Arc<dyn SdpStack>>,
    transports: Vec<Arc<dyn Transport>>,
    plugins: Vec<Arc<dyn Plugin>>,
    event_handlers: Vec<Arc<dyn EventHandler>>,
    log_level_hook: Option<LogLevelHook>,
}

impl GatewayBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ice: None,
            sdp: None,
            transports: Vec::new(),
            plugins: Vec::new(),
            event_handlers: Vec::new(),
            log_level_hook: None,
        }
    }

    /// The ICE/DTLS/SRTP stack implementation
    pub fn ice(mut self, ice: Arc<dyn IceStack>) -> Self {
        self.ice = Some(ice);
        self
    }

    /// The SDP parser implementation
    pub fn sdp(mut self, sdp: Arc<dyn SdpStack>) -> Self {
        self.sdp = Some(sdp);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handlers.push(handler);
        self
    }

    /// Install the hook `set_log_level` forwards to (e.g. a
    /// tracing-subscriber reload handle)
    pub fn on_log_level_change(mut self, hook: LogLevelHook) -> Self {
        self.log_level_hook = Some(hook);
        self
    }

    /// Validate module versions and fatal startup conditions, then
    /// assemble the runtime. Plugins are initialized with the callback
    /// surface before this returns.
    pub fn build(self) -> Result<Arc<Gateway>> {
        let config = self.config;
        let ice = self
            .ice
            .ok_or_else(|| Error::Config("No ICE stack configured".to_string()))?;
        let sdp = self
            .sdp
            .ok_or_else(|| Error::Config("No SDP stack configured".to_string()))?;

        let mut transports: HashMap<String, Arc<dyn Transport>> = HashMap::new();
        for transport in self.transports {
            let package = transport.package().to_string();
            if config.general.disabled_transports.contains(&package) {
                info!("Transport '{package}' disabled, skipping");
                continue;
            }
            if transport.api_compatibility() < TRANSPORT_API_VERSION {
                return Err(Error::Module(format!(
                    "Transport '{package}' was built against API version {}, expected at least {}",
                    transport.api_compatibility(),
                    TRANSPORT_API_VERSION
                )));
            }
            if transports.insert(package.clone(), transport).is_some() {
                return Err(Error::Module(format!("Duplicate transport '{package}'")));
            }
        }
        if transports.is_empty() {
            return Err(Error::Config(
                "No transport enabled, giving up".to_string(),
            ));
        }

        let mut plugins: HashMap<String, Arc<dyn Plugin>> = HashMap::new();
        for plugin in self.plugins {
            let package = plugin.package().to_string();
            if config.general.disabled_plugins.contains(&package) {
                info!("Plugin '{package}' disabled, skipping");
                continue;
            }
            if plugin.api_compatibility() < PLUGIN_API_VERSION {
                return Err(Error::Module(format!(
                    "Plugin '{package}' was built against API version {}, expected at least {}",
                    plugin.api_compatibility(),
                    PLUGIN_API_VERSION
                )));
            }
            if plugins.insert(package.clone(), plugin).is_some() {
                return Err(Error::Module(format!("Duplicate plugin '{package}'")));
            }
        }

        let mut event_handlers: HashMap<String, Arc<dyn EventHandler>> = HashMap::new();
        for handler in self.event_handlers {
            let package = handler.package().to_string();
            if config.general.disabled_event_handlers.contains(&package) {
                info!("Event handler '{package}' disabled, skipping");
                continue;
            }
            if handler.api_compatibility() < EVENT_HANDLER_API_VERSION {
                return Err(Error::Module(format!(
                    "Event handler '{package}' was built against API version {}, expected at least {}",
                    handler.api_compatibility(),
                    EVENT_HANDLER_API_VERSION
                )));
            }
            if event_handlers.insert(package.clone(), handler).is_some() {
                return Err(Error::Module(format!("Duplicate event handler '{package}'")));
            }
        }

        if config.general.token_auth
            && (!config.admin.enabled || config.admin.admin_secret.is_none())
        {
            return Err(Error::Config(
                "Token based authentication requires the admin API with a secret; \
                 all requests would fail otherwise"
                    .to_string(),
            ));
        }

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        let max_workers = config.general.max_message_workers.max(1);
        let settings = RuntimeSettings::from_config(&config);
        let auth = TokenAuth::new(config.general.token_auth);

        let gateway = Arc::new(Gateway {
            config,
            registry: SessionRegistry::new(),
            plugins,
            transports,
            event_handlers,
            auth,
            settings,
            ice,
            sdp,
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            deferred_tx,
            deferred_rx: Mutex::new(Some(deferred_rx)),
            message_workers: Arc::new(Semaphore::new(max_workers)),
            stop: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            log_level_hook: self.log_level_hook,
        });

        for plugin in gateway.plugins.values() {
            let callbacks: Arc<dyn GatewayCallbacks> = gateway.clone();
            plugin.init(callbacks)?;
            info!("Plugin '{}' initialized", plugin.package());
        }

        Ok(gateway)
    }
}

/// The signaling core runtime
pub struct Gateway {
    config: Config,
    registry: SessionRegistry,
    plugins: HashMap<String, Arc<dyn Plugin>>,
    transports: HashMap<String, Arc<dyn Transport>>,
    event_handlers: HashMap<String, Arc<dyn EventHandler>>,
    auth: TokenAuth,
    settings: RuntimeSettings,
    ice: Arc<dyn IceStack>,
    sdp: Arc<dyn SdpStack>,
    requests_tx: mpsc::UnboundedSender<QueueItem>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<QueueItem>>>,
    deferred_tx: mpsc::UnboundedSender<DeferredJob>,
    deferred_rx: Mutex<Option<mpsc::UnboundedReceiver<DeferredJob>>>,
    message_workers: Arc<Semaphore>,
    stop: AtomicBool,
    shutdown_notify: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    log_level_hook: Option<LogLevelHook>,
}

impl Gateway {
    pub fn builder(config: Config) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Spawn the dispatcher and the timer loop (sweeper + deferred
    /// teardown). Idempotent only in the sense that a second call fails.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let requests_rx = self
            .requests_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Other("Gateway already started".to_string()))?;
        let deferred_rx = self
            .deferred_rx
            .lock()
            .take()
            .ok_or_else(|| Error::Other("Gateway already started".to_string()))?;

        let dispatcher = tokio::spawn(dispatch::run(Arc::clone(self), requests_rx));
        let timer = tokio::spawn(Self::timer_loop(Arc::clone(self), deferred_rx));
        self.tasks.lock().extend([dispatcher, timer]);

        self.notify_handlers(
            event_type::CORE,
            json!({ "event": { "status": "started", "info": self.server_info(None) } }),
        );
        info!("Gateway started");
        Ok(())
    }

    /// Cooperative shutdown: stop flag, sweeper, transports, worker-pool
    /// drain, dispatcher sentinel, sessions, plugins, event handlers.
    pub async fn destroy(self: &Arc<Self>) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down gateway");
        self.notify_handlers(
            event_type::CORE,
            json!({ "event": { "status": "shutdown" } }),
        );
        self.shutdown_notify.notify_waiters();

        for transport in self.transports.values() {
            transport.destroy();
        }

        // Drain the worker pool without cancelling in-flight messages
        let max = self.config.general.max_message_workers.max(1) as u32;
        let _drain = self.message_workers.acquire_many(max).await;

        let _ = self.requests_tx.send(QueueItem::Shutdown);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        info!("Destroying sessions");
        for session in self.registry.all() {
            self.destroy_session(&session);
            self.registry.remove(session.id());
        }

        for plugin in self.plugins.values() {
            plugin.destroy();
        }
        for handler in self.event_handlers.values() {
            handler.destroy();
        }
        info!("Gateway stopped");
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Transport callback surface (transport -> core)
    // ------------------------------------------------------------------

    /// Entry point transports call for every parsed JSON request
    pub fn incoming_request(
        &self,
        transport: &str,
        instance: &Arc<TransportSession>,
        reply_token: Option<ReplyToken>,
        admin: bool,
        payload: Value,
    ) -> Result<()> {
        if self.is_stopping() {
            return Err(Error::Stopping);
        }
        debug!(
            "Got {} API request from '{transport}'",
            if admin { "an admin" } else { "a core" }
        );
        let request = Request {
            transport: transport.to_string(),
            instance: Arc::clone(instance),
            reply_token,
            admin,
            payload,
        };
        self.requests_tx
            .send(QueueItem::Request(request))
            .map_err(|_| Error::Stopping)
    }

    /// A transport connection vanished: destroy every session it
    /// originated, within this call.
    pub fn transport_gone(&self, instance: &Arc<TransportSession>) {
        debug!("A transport instance has gone away");
        for session in self.registry.all() {
            if session.is_destroyed() || session.is_timeout_latched() {
                continue;
            }
            if Arc::ptr_eq(&session.origin().instance, instance) {
                debug!("  -- Marking session {} as over", session.id());
                self.destroy_session(&session);
                self.registry.remove(session.id());
                self.notify_handlers(
                    event_type::SESSION,
                    json!({ "session_id": session.id(), "event": { "name": "destroyed" } }),
                );
            }
        }
    }

    pub fn is_api_secret_needed(&self) -> bool {
        self.config.general.api_secret.is_some()
    }

    pub fn is_api_secret_valid(&self, secret: &str) -> bool {
        match &self.config.general.api_secret {
            None => true,
            Some(expected) => constant_time_eq(secret.as_bytes(), expected.as_bytes()),
        }
    }

    pub fn is_auth_token_needed(&self) -> bool {
        self.auth.is_enabled()
    }

    pub fn is_auth_token_valid(&self, token: &str) -> bool {
        !self.auth.is_enabled() || self.auth.check_token(token)
    }

    /// Event record from a transport module
    pub fn notify_transport_event(&self, package: &str, event: Value) {
        if !event.is_object() {
            return;
        }
        self.notify_handlers(
            event_type::TRANSPORT,
            json!({ "transport": package, "event": event }),
        );
    }

    // ------------------------------------------------------------------
    // Request processing entry points
    // ------------------------------------------------------------------

    /// Process one core-API request and send the reply on its transport
    pub async fn process_incoming_request(self: &Arc<Self>, request: &Request) {
        crate::api::handler::process(self, request).await;
    }

    /// Process one admin-API request and send the reply on its transport
    pub async fn process_incoming_admin_request(self: &Arc<Self>, request: &Request) {
        crate::api::admin::process(self, request).await;
    }

    // ------------------------------------------------------------------
    // Internals shared with the API handlers
    // ------------------------------------------------------------------

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub(crate) fn auth(&self) -> &TokenAuth {
        &self.auth
    }

    pub(crate) fn ice(&self) -> &Arc<dyn IceStack> {
        &self.ice
    }

    pub(crate) fn sdp_stack(&self) -> &Arc<dyn SdpStack> {
        &self.sdp
    }

    pub(crate) fn plugin(&self, package: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(package).cloned()
    }

    pub(crate) fn plugins(&self) -> &HashMap<String, Arc<dyn Plugin>> {
        &self.plugins
    }

    pub(crate) fn transports(&self) -> &HashMap<String, Arc<dyn Transport>> {
        &self.transports
    }

    pub(crate) fn event_handlers(&self) -> &HashMap<String, Arc<dyn EventHandler>> {
        &self.event_handlers
    }

    pub(crate) fn message_workers(&self) -> &Arc<Semaphore> {
        &self.message_workers
    }

    pub(crate) fn apply_log_level(&self, level: u32) {
        self.settings.set_log_level(level);
        if let Some(hook) = &self.log_level_hook {
            hook(level);
        }
    }

    pub(crate) fn set_refcount_debug(&self, enabled: bool) {
        self.settings.set_refcount_debug(enabled);
        self.registry.set_refcount_debug(enabled);
    }

    /// A request is authorized iff the API secret matches, or a valid
    /// token is presented, or both mechanisms are disabled.
    pub(crate) fn check_authorization(&self, payload: &Value) -> bool {
        let secret_configured = self.config.general.api_secret.is_some();
        let token_enabled = self.auth.is_enabled();
        if !secret_configured && !token_enabled {
            return true;
        }
        let mut secret_ok = false;
        let mut token_ok = false;
        if let Some(expected) = &self.config.general.api_secret {
            if let Some(given) = payload.get("apisecret").and_then(Value::as_str) {
                secret_ok = constant_time_eq(given.as_bytes(), expected.as_bytes());
            }
        }
        if token_enabled {
            if let Some(token) = payload.get("token").and_then(Value::as_str) {
                token_ok = self.auth.check_token(token);
            }
        }
        secret_ok || token_ok
    }

    pub(crate) fn check_admin_secret(&self, payload: &Value) -> bool {
        match &self.config.admin.admin_secret {
            None => true,
            Some(expected) => payload
                .get("admin_secret")
                .and_then(Value::as_str)
                .is_some_and(|given| constant_time_eq(given.as_bytes(), expected.as_bytes())),
        }
    }

    /// Route a reply back over the originating transport
    pub(crate) async fn send_reply(&self, request: &Request, payload: Value) {
        let Some(transport) = self.transports.get(&request.transport) else {
            warn!("No transport '{}' to send the reply to", request.transport);
            return;
        };
        if let Err(e) = transport
            .send_message(
                &request.instance,
                request.reply_token.as_ref(),
                request.admin,
                payload,
            )
            .await
        {
            warn!("Error sending reply over '{}': {e}", request.transport);
        }
    }

    pub(crate) async fn reply_error(
        &self,
        request: &Request,
        session_id: u64,
        transaction: Option<&str>,
        err: ApiError,
    ) {
        debug!("Request failed with {} ({})", err.code, err.reason);
        self.send_reply(request, error_reply(session_id, transaction, &err))
            .await;
    }

    /// Send an asynchronous event to the client behind a session
    pub(crate) async fn session_notify_event(&self, session: &Arc<Session>, event: Value) {
        if session.is_destroyed() {
            return;
        }
        let origin = session.origin();
        let Some(transport) = self.transports.get(&origin.transport) else {
            return;
        };
        if let Err(e) = transport
            .send_message(&origin.instance, None, false, event)
            .await
        {
            warn!("Error notifying session {}: {e}", session.id());
        }
    }

    /// Fan an event record out to every sink
    pub(crate) fn notify_handlers(&self, kind: &str, mut record: Value) {
        if !self.events_enabled() {
            return;
        }
        let Some(map) = record.as_object_mut() else {
            return;
        };
        map.insert("type".to_string(), json!(kind));
        map.insert(
            "timestamp".to_string(),
            json!(chrono::Utc::now().timestamp_micros()),
        );
        for handler in self.event_handlers.values() {
            handler.incoming_event(record.clone());
        }
    }

    pub(crate) fn notify_jsep_event(
        &self,
        session_id: u64,
        handle: &Arc<Handle>,
        owner: &str,
        jsep_type: &str,
        sdp: &str,
    ) {
        self.notify_handlers(
            event_type::JSEP,
            json!({
                "session_id": session_id,
                "handle_id": handle.id(),
                "opaque_id": handle.opaque_id(),
                "owner": owner,
                "jsep": { "type": jsep_type, "sdp": sdp },
            }),
        );
    }

    fn events_enabled(&self) -> bool {
        self.config.general.broadcast_events && !self.event_handlers.is_empty()
    }

    /// The `info` payload: capabilities plus the loaded module maps
    pub(crate) fn server_info(&self, transaction: Option<&str>) -> Value {
        let mut info = envelope("server_info", 0, transaction);
        info["name"] = json!(self.config.general.server_name);
        info["version"] = json!(SERVER_VERSION);
        info["version_string"] = json!(SERVER_VERSION_STRING);
        info["author"] = json!("rtcgate contributors");
        info["data_channels"] = json!(true);
        info["session-timeout"] = json!(self.settings.session_timeout());
        info["full-trickle"] = json!(self.ice.full_trickle());
        info["rfc-4588"] = json!(self.config.media.rfc4588);
        info["api_secret"] = json!(self.config.general.api_secret.is_some());
        info["auth_token"] = json!(self.auth.is_enabled());
        info["event_handlers"] = json!(self.events_enabled());

        let mut transports = serde_json::Map::new();
        for (package, t) in &self.transports {
            transports.insert(
                package.clone(),
                json!({
                    "name": t.name(),
                    "author": t.author(),
                    "description": t.description(),
                    "version": t.version(),
                    "version_string": t.version_string(),
                }),
            );
        }
        info["transports"] = Value::Object(transports);

        let mut handlers = serde_json::Map::new();
        for (package, h) in &self.event_handlers {
            handlers.insert(
                package.clone(),
                json!({
                    "name": h.name(),
                    "author": h.author(),
                    "description": h.description(),
                    "version": h.version(),
                    "version_string": h.version_string(),
                }),
            );
        }
        info["events"] = Value::Object(handlers);

        let mut plugins = serde_json::Map::new();
        for (package, p) in &self.plugins {
            plugins.insert(
                package.clone(),
                json!({
                    "name": p.name(),
                    "author": p.author(),
                    "description": p.description(),
                    "version": p.version(),
                    "version_string": p.version_string(),
                }),
            );
        }
        info["plugins"] = Value::Object(plugins);
        info
    }

    // ------------------------------------------------------------------
    // Session/handle lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn create_session(
        &self,
        requested_id: Option<u64>,
        origin: TransportOrigin,
    ) -> std::result::Result<Arc<Session>, ApiError> {
        self.registry.create(requested_id, origin)
    }

    /// Allocate a handle with a process-unique nonzero id
    pub(crate) fn create_handle(
        &self,
        session: &Arc<Session>,
        opaque_id: Option<String>,
    ) -> Arc<Handle> {
        loop {
            let id = rand::random::<u64>();
            if id == 0 || session.find_handle(id).is_some() {
                continue;
            }
            let handle = Handle::new(id, opaque_id, session);
            session.insert_handle(Arc::clone(&handle));
            return handle;
        }
    }

    /// Bind plugin and handle together and run the plugin's attach hook
    pub(crate) fn attach_plugin(
        &self,
        handle: &Arc<Handle>,
        plugin: &Arc<dyn Plugin>,
    ) -> std::result::Result<(), String> {
        let psession = PluginSession::new(handle);
        handle
            .bind_plugin(Arc::clone(plugin), Arc::clone(&psession))
            .map_err(str::to_string)?;
        plugin
            .create_session(&psession)
            .map_err(|e| e.to_string())
    }

    /// Latch `destroyed` and tear down every handle. Returns false when
    /// somebody else already destroyed the session.
    pub(crate) fn destroy_session(&self, session: &Arc<Session>) -> bool {
        if !session.mark_destroyed() {
            return false;
        }
        info!("Destroying session {}", session.id());
        for handle in session.take_handles() {
            self.destroy_handle_inner(&handle, "Session destroyed");
        }
        true
    }

    /// Detach one handle from its session (the `detach` verb,
    /// plugin-initiated `end_session`)
    pub(crate) fn destroy_handle(&self, session: &Arc<Session>, handle: &Arc<Handle>) {
        session.remove_handle(handle.id());
        self.destroy_handle_inner(handle, "Detach");
    }

    fn destroy_handle_inner(&self, handle: &Arc<Handle>, reason: &str) {
        if handle.is_set(WebRtcFlags::STOP) {
            return;
        }
        self.webrtc_hangup(handle, reason);
        if let Some((plugin, psession)) = handle.binding() {
            psession.stop();
            if let Err(e) = plugin.destroy_session(&psession) {
                warn!(
                    "Plugin '{}' failed to destroy session for handle {}: {e}",
                    plugin.package(),
                    handle.id()
                );
            }
        }
        handle.set_flags(WebRtcFlags::STOP);
        handle.drop_agent();
    }

    /// Hang the PeerConnection up without detaching the handle
    pub(crate) fn webrtc_hangup(&self, handle: &Arc<Handle>, reason: &str) {
        if !handle.has_agent() {
            return;
        }
        debug!("[{}] Hanging up PeerConnection: {reason}", handle.id());
        handle.set_flags(WebRtcFlags::ALERT);
        self.ice.hangup(handle, reason);
        if let Some((plugin, psession)) = handle.binding() {
            plugin.hangup_media(&psession);
        }
    }

    // ------------------------------------------------------------------
    // Timer loop: timeout sweeper + deferred plugin-initiated teardown
    // ------------------------------------------------------------------

    async fn timer_loop(
        gateway: Arc<Gateway>,
        mut deferred_rx: mpsc::UnboundedReceiver<DeferredJob>,
    ) {
        info!("Sessions watchdog started");
        let mut tick = tokio::time::interval(SWEEPER_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let shutdown = gateway.shutdown_notify.notified();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tick.tick() => {
                    if gateway.is_stopping() {
                        break;
                    }
                    gateway.sweep_sessions().await;
                }
                job = deferred_rx.recv() => match job {
                    Some(DeferredJob::ClosePc(psession)) => gateway.deferred_close_pc(&psession),
                    Some(DeferredJob::EndSession(psession)) => gateway.deferred_end_session(&psession),
                    None => break,
                },
            }
        }
        info!("Sessions watchdog stopped");
    }

    async fn sweep_sessions(self: &Arc<Self>) {
        let timeout = self.settings.session_timeout();
        if timeout < 1 {
            // Session timeouts are disabled
            return;
        }
        let timeout = Duration::from_secs(timeout);
        for session in self.registry.all() {
            if session.is_destroyed() || session.idle_for() < timeout {
                continue;
            }
            if !session.latch_timeout() {
                continue;
            }
            info!("Timeout expired for session {}", session.id());
            self.destroy_session(&session);
            // Notify the transport the session originated from
            let origin = session.origin().clone();
            if let Some(transport) = self.transports.get(&origin.transport) {
                let event = envelope("timeout", session.id(), None);
                if let Err(e) = transport
                    .send_message(&origin.instance, None, false, event)
                    .await
                {
                    warn!("Error sending timeout event: {e}");
                }
                transport.session_over(&origin.instance, session.id(), true);
            }
            self.notify_handlers(
                event_type::SESSION,
                json!({ "session_id": session.id(), "event": { "name": "timeout" } }),
            );
            self.registry.remove(session.id());
        }
    }

    fn deferred_close_pc(&self, psession: &Arc<PluginSession>) {
        let Some(handle) = psession.handle() else {
            return;
        };
        if handle.is_set(WebRtcFlags::STOP) || handle.is_set(WebRtcFlags::ALERT) {
            return;
        }
        debug!(
            "[{}] Plugin asked to hangup PeerConnection: sending alert",
            handle.id()
        );
        self.webrtc_hangup(&handle, "Close PC");
    }

    fn deferred_end_session(&self, psession: &Arc<PluginSession>) {
        let Some(handle) = psession.handle() else {
            return;
        };
        if handle.is_set(WebRtcFlags::STOP) {
            return;
        }
        let Some(session) = handle.session() else {
            return;
        };
        debug!("[{}] Plugin asked to end the handle", handle.id());
        self.destroy_handle(&session, &handle);
    }

    // ------------------------------------------------------------------
    // Signaling helpers shared by the inbound and outbound JSEP paths
    // ------------------------------------------------------------------

    /// The answer is in and processed: replay buffered trickles and start
    /// connectivity checks. Caller holds the handle's negotiation lock.
    pub(crate) fn handle_answer_ready(&self, handle: &Arc<Handle>) {
        handle.clear_flags(WebRtcFlags::PROCESSING_OFFER);
        let pending = handle.take_pending_trickles();
        if !pending.is_empty() {
            debug!(
                "[{}]   -- Processing {} pending trickle candidates",
                handle.id(),
                pending.len()
            );
        }
        for trickle in pending {
            if trickle.is_stale() {
                warn!(
                    "[{}] Discarding stale trickle candidate (transaction {})",
                    handle.id(),
                    trickle.transaction
                );
                continue;
            }
            match &trickle.candidate {
                Value::Object(_) => {
                    if let Err(e) = self.ice.add_candidate(handle, &trickle.candidate) {
                        warn!("[{}] Error parsing queued candidate: {}", handle.id(), e.reason);
                    }
                }
                Value::Array(candidates) => {
                    for candidate in candidates {
                        // Individual failures in a batch are not reported
                        let _ = self.ice.add_candidate(handle, candidate);
                    }
                }
                _ => {}
            }
        }
        if handle.is_set(WebRtcFlags::TRICKLE) && !handle.is_set(WebRtcFlags::ALL_TRICKLES) {
            debug!(
                "[{}]   -- ICE trickling is supported by the peer, waiting for remote candidates",
                handle.id()
            );
            handle.set_flags(WebRtcFlags::START);
        } else {
            debug!("[{}] Done! Sending connectivity checks", handle.id());
            self.ice.setup_remote_candidates(handle);
        }
    }

    /// Outbound JSEP (plugin supplied an offer/answer through
    /// `push_event`): mirror of the inbound state machine, ending in an
    /// SDP merged with the local ICE/DTLS attributes.
    async fn process_outbound_jsep(
        &self,
        handle: &Arc<Handle>,
        sdp_type: &str,
        sdp: &str,
        restart: bool,
    ) -> std::result::Result<Value, ApiError> {
        let offer = match sdp_type {
            "offer" => {
                handle.set_flags(WebRtcFlags::GOT_OFFER);
                handle.clear_flags(WebRtcFlags::GOT_ANSWER);
                true
            }
            "answer" => {
                handle.set_flags(WebRtcFlags::GOT_ANSWER);
                false
            }
            _ => {
                return Err(ApiError::new(
                    codes::JSEP_UNKNOWN_TYPE,
                    format!("JSEP error: unknown message type '{sdp_type}'"),
                ))
            }
        };

        let parsed = self
            .sdp
            .preparse(sdp)
            .map_err(|e| ApiError::new(codes::JSEP_INVALID_SDP, e))?;

        let mut updating = false;
        if offer {
            if !handle.wait_until_clean(CLEANING_WAIT).await {
                return Err(ApiError::new(
                    codes::WEBRTC_STATE,
                    "Still cleaning a previous session",
                ));
            }
            if handle.has_agent() {
                updating = true;
                info!("[{}] Updating existing session", handle.id());
            } else {
                if self.config.media.rfc4588 {
                    handle.set_flags(WebRtcFlags::RFC4588_RTX);
                }
                let agent = self
                    .ice
                    .setup_local(handle, false, parsed.counts, true)
                    .map_err(|e| ApiError::new(codes::UNKNOWN, e))?;
                handle.set_agent(agent);
            }
        }

        if !updating {
            self.wait_for_gathering(handle).await?;
        }

        let anonymized = self
            .sdp
            .anonymize(&parsed)
            .map_err(|e| ApiError::new(codes::JSEP_INVALID_SDP, e))?;
        let anonymized = ParsedSdp {
            sdp: anonymized,
            counts: parsed.counts,
        };
        if offer && restart {
            info!("[{}] Restarting ICE", handle.id());
            self.ice.restart(handle);
        }
        let merged = self
            .sdp
            .merge(handle, &anonymized, offer)
            .map_err(|e| ApiError::new(codes::JSEP_INVALID_SDP, e))?;
        handle.set_local_sdp(merged.clone());

        if !updating {
            if offer {
                // Wait for the answer before handling trickle candidates
                handle.set_flags(WebRtcFlags::PROCESSING_OFFER);
            } else {
                let _guard = handle.negotiation().lock().await;
                self.handle_answer_ready(handle);
            }
        }

        if !offer
            && handle.is_set(WebRtcFlags::READY)
            && handle.is_set(WebRtcFlags::DATA_CHANNELS)
            && !self.ice.sctp_provisioned(handle)
        {
            info!("[{}] Creating datachannels...", handle.id());
            self.ice.create_sctp(handle);
        }

        Ok(json!({ "type": sdp_type, "sdp": merged }))
    }

    /// Block until local candidate gathering completes, polling the media
    /// stack; aborts when the handle stops or gathering fails.
    async fn wait_for_gathering(
        &self,
        handle: &Arc<Handle>,
    ) -> std::result::Result<(), ApiError> {
        loop {
            if handle.is_set(WebRtcFlags::STOP) || handle.is_set(WebRtcFlags::ALERT) {
                return Err(ApiError::new(
                    codes::HANDLE_NOT_FOUND,
                    "Handle detached or PeerConnection closed",
                ));
            }
            match self.ice.gathering_state(handle) {
                GatheringState::Done => return Ok(()),
                GatheringState::Failed => {
                    return Err(ApiError::new(
                        codes::JSEP_INVALID_SDP,
                        "Error gathering candidates",
                    ))
                }
                GatheringState::InProgress => {
                    debug!("[{}] Waiting for candidates-done callback...", handle.id());
                    tokio::time::sleep(GATHERING_POLL).await;
                }
            }
        }
    }

    /// Shared alive checks for the plugin callback surface
    fn callback_handle(&self, psession: &Arc<PluginSession>) -> Option<Arc<Handle>> {
        if !psession.is_alive() {
            return None;
        }
        let handle = psession.handle()?;
        if handle.is_set(WebRtcFlags::STOP) || handle.is_set(WebRtcFlags::ALERT) {
            return None;
        }
        Some(handle)
    }
}

#[async_trait]
impl GatewayCallbacks for Gateway {
    async fn push_event(
        &self,
        psession: &Arc<PluginSession>,
        transaction: Option<&str>,
        message: Value,
        jsep: Option<Value>,
    ) -> std::result::Result<(), ApiError> {
        if !psession.is_alive() {
            return Err(ApiError::from_code(codes::SESSION_NOT_FOUND));
        }
        let handle = psession
            .handle()
            .ok_or_else(|| ApiError::from_code(codes::SESSION_NOT_FOUND))?;
        if handle.is_set(WebRtcFlags::STOP) {
            return Err(ApiError::from_code(codes::SESSION_NOT_FOUND));
        }
        let session = handle
            .session()
            .filter(|s| !s.is_destroyed())
            .ok_or_else(|| ApiError::from_code(codes::SESSION_NOT_FOUND))?;
        if !message.is_object() {
            return Err(ApiError::new(
                codes::INVALID_JSON_OBJECT,
                "Cannot push event (JSON error: not an object)",
            ));
        }
        let plugin = handle
            .plugin()
            .ok_or_else(|| ApiError::from_code(codes::HANDLE_NOT_FOUND))?;

        // Attach a merged JSEP if the plugin supplied one
        let mut restart = false;
        let mut jsep_info: Option<(String, String)> = None;
        let merged_jsep = match &jsep {
            Some(jsep) => {
                let sdp_type = jsep.get("type").and_then(Value::as_str);
                let sdp = jsep.get("sdp").and_then(Value::as_str);
                restart = sdp.is_some()
                    && jsep
                        .get("restart")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                match (sdp_type, sdp) {
                    (Some(sdp_type), Some(sdp)) => {
                        jsep_info = Some((sdp_type.to_string(), sdp.to_string()));
                        Some(
                            self.process_outbound_jsep(&handle, sdp_type, sdp, restart)
                                .await?,
                        )
                    }
                    _ => None,
                }
            }
            None => None,
        };

        let mut event = envelope("event", session.id(), transaction);
        event["sender"] = json!(handle.id());
        event["plugindata"] = json!({
            "plugin": plugin.package(),
            "data": message,
        });
        if let Some(merged) = merged_jsep {
            event["jsep"] = merged;
        }
        debug!("[{}] Sending event to transport...", handle.id());
        self.session_notify_event(&session, event).await;

        if (restart || handle.is_set(WebRtcFlags::RESEND_TRICKLES)) && self.ice.full_trickle() {
            // ICE restarted: send our trickle candidates again
            self.ice.resend_trickles(&handle);
            handle.clear_flags(WebRtcFlags::RESEND_TRICKLES);
        }

        if let Some((sdp_type, sdp)) = jsep_info {
            self.notify_jsep_event(session.id(), &handle, "local", &sdp_type, &sdp);
        }
        Ok(())
    }

    fn relay_rtp(&self, psession: &Arc<PluginSession>, video: bool, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let Some(handle) = self.callback_handle(psession) else {
            return;
        };
        if handle.dump_enabled() {
            if let Some(capture) = handle.capture() {
                let _ = capture.dump(false, PacketKind::Rtp, buf);
            }
        }
        self.ice.relay_rtp(&handle, video, buf);
    }

    fn relay_rtcp(&self, psession: &Arc<PluginSession>, video: bool, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let Some(handle) = self.callback_handle(psession) else {
            return;
        };
        if handle.dump_enabled() {
            if let Some(capture) = handle.capture() {
                let _ = capture.dump(false, PacketKind::Rtcp, buf);
            }
        }
        self.ice.relay_rtcp(&handle, video, buf);
    }

    fn relay_data(&self, psession: &Arc<PluginSession>, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        let Some(handle) = self.callback_handle(psession) else {
            return;
        };
        if handle.dump_enabled() {
            if let Some(capture) = handle.capture() {
                let _ = capture.dump(false, PacketKind::Data, buf);
            }
        }
        self.ice.relay_data(&handle, buf);
    }

    fn close_pc(&self, psession: &Arc<PluginSession>) {
        if !psession.is_alive() {
            return;
        }
        let _ = self
            .deferred_tx
            .send(DeferredJob::ClosePc(Arc::clone(psession)));
    }

    fn end_session(&self, psession: &Arc<PluginSession>) {
        if !psession.is_alive() {
            return;
        }
        let _ = self
            .deferred_tx
            .send(DeferredJob::EndSession(Arc::clone(psession)));
    }

    fn events_is_enabled(&self) -> bool {
        self.events_enabled()
    }

    fn notify_event(&self, package: &str, psession: Option<&Arc<PluginSession>>, event: Value) {
        if !event.is_object() {
            return;
        }
        let mut record = json!({ "plugin": package, "event": event });
        if let Some(handle) = psession.and_then(|p| p.handle()) {
            record["handle_id"] = json!(handle.id());
            if let Some(opaque) = handle.opaque_id() {
                record["opaque_id"] = json!(opaque);
            }
            if let Some(session) = handle.session() {
                record["session_id"] = json!(session.id());
            }
        }
        self.notify_handlers(event_type::PLUGIN, record);
    }
}
