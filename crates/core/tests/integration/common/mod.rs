//! Mock collaborators shared by the integration tests
//!
//! The gateway only ever talks to its transports, plugins, and media
//! stacks through traits, so the whole control plane can be exercised
//! with these in-memory stand-ins.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use rtcgate_core::error::ApiError;
use rtcgate_core::events::EventHandler;
use rtcgate_core::media::{GatheringState, IceAgentRef, IceStack, MediaCounts, ParsedSdp, SdpStack};
use rtcgate_core::plugin::{GatewayCallbacks, Plugin, PluginResult, PluginSession};
use rtcgate_core::session::{Handle, WebRtcFlags};
use rtcgate_core::transport::{ReplyToken, Transport, TransportSession};
use rtcgate_core::{
    Config, Gateway, Result, EVENT_HANDLER_API_VERSION, PLUGIN_API_VERSION, TRANSPORT_API_VERSION,
};

/// Transport stand-in capturing everything the core sends
pub struct MockTransport {
    messages: Mutex<VecDeque<(bool, Value)>>,
    notify: Notify,
    pub created_sessions: Mutex<Vec<u64>>,
    pub over_sessions: Mutex<Vec<(u64, bool)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            created_sessions: Mutex::new(Vec::new()),
            over_sessions: Mutex::new(Vec::new()),
        })
    }

    /// Next message the core sent, in order; panics after 5 s
    pub async fn recv(&self) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.notify.notified();
                if let Some((_admin, message)) = self.messages.lock().pop_front() {
                    return message;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for a message from the gateway")
    }

    pub fn pending(&self) -> usize {
        self.messages.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "Mock transport"
    }
    fn package(&self) -> &'static str {
        "transport.mock"
    }
    fn author(&self) -> &'static str {
        "tests"
    }
    fn description(&self) -> &'static str {
        "In-memory transport for tests"
    }
    fn version(&self) -> u32 {
        1
    }
    fn version_string(&self) -> &'static str {
        "0.0.1"
    }
    fn api_compatibility(&self) -> u32 {
        TRANSPORT_API_VERSION
    }

    async fn send_message(
        &self,
        _instance: &Arc<TransportSession>,
        _reply_token: Option<&ReplyToken>,
        admin: bool,
        message: Value,
    ) -> Result<()> {
        self.messages.lock().push_back((admin, message));
        self.notify.notify_waiters();
        Ok(())
    }

    fn session_created(&self, _instance: &Arc<TransportSession>, session_id: u64) {
        self.created_sessions.lock().push(session_id);
    }

    fn session_over(&self, _instance: &Arc<TransportSession>, session_id: u64, timeout: bool) {
        self.over_sessions.lock().push((session_id, timeout));
    }
}

/// ICE stack stand-in recording every call the core routes to it
pub struct MockIce {
    pub ready: AtomicBool,
    pub gathering: Mutex<GatheringState>,
    pub candidates: Mutex<Vec<Value>>,
    pub setups: Mutex<Vec<MediaCounts>>,
    pub restarts: AtomicUsize,
    pub resends: AtomicUsize,
    pub remote_setups: AtomicUsize,
    pub hangups: Mutex<Vec<String>>,
    pub relayed: Mutex<Vec<(&'static str, usize)>>,
    pub full_trickle: AtomicBool,
    pub debug: AtomicBool,
    pub sctp: AtomicBool,
}

impl MockIce {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ready: AtomicBool::new(false),
            gathering: Mutex::new(GatheringState::Done),
            candidates: Mutex::new(Vec::new()),
            setups: Mutex::new(Vec::new()),
            restarts: AtomicUsize::new(0),
            resends: AtomicUsize::new(0),
            remote_setups: AtomicUsize::new(0),
            hangups: Mutex::new(Vec::new()),
            relayed: Mutex::new(Vec::new()),
            full_trickle: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            sctp: AtomicBool::new(false),
        })
    }
}

impl IceStack for MockIce {
    fn setup_local(
        &self,
        _handle: &Arc<Handle>,
        _offer: bool,
        counts: MediaCounts,
        _trickle: bool,
    ) -> std::result::Result<IceAgentRef, String> {
        self.setups.lock().push(counts);
        self.ready.store(true, Ordering::Release);
        Ok(Arc::new(()))
    }

    fn restart(&self, _handle: &Arc<Handle>) {
        self.restarts.fetch_add(1, Ordering::AcqRel);
    }

    fn add_candidate(
        &self,
        _handle: &Arc<Handle>,
        candidate: &Value,
    ) -> std::result::Result<(), ApiError> {
        self.candidates.lock().push(candidate.clone());
        Ok(())
    }

    fn setup_remote_candidates(&self, _handle: &Arc<Handle>) {
        self.remote_setups.fetch_add(1, Ordering::AcqRel);
    }

    fn resend_trickles(&self, _handle: &Arc<Handle>) {
        self.resends.fetch_add(1, Ordering::AcqRel);
    }

    fn hangup(&self, _handle: &Arc<Handle>, reason: &str) {
        self.hangups.lock().push(reason.to_string());
    }

    fn gathering_state(&self, _handle: &Arc<Handle>) -> GatheringState {
        *self.gathering.lock()
    }

    fn stream_ready(&self, _handle: &Arc<Handle>) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn sctp_provisioned(&self, _handle: &Arc<Handle>) -> bool {
        self.sctp.load(Ordering::Acquire)
    }

    fn create_sctp(&self, _handle: &Arc<Handle>) {
        self.sctp.store(true, Ordering::Release);
    }

    fn full_trickle(&self) -> bool {
        self.full_trickle.load(Ordering::Acquire)
    }

    fn relay_rtp(&self, _handle: &Arc<Handle>, _video: bool, buf: &[u8]) {
        self.relayed.lock().push(("rtp", buf.len()));
    }

    fn relay_rtcp(&self, _handle: &Arc<Handle>, _video: bool, buf: &[u8]) {
        self.relayed.lock().push(("rtcp", buf.len()));
    }

    fn relay_data(&self, _handle: &Arc<Handle>, buf: &[u8]) {
        self.relayed.lock().push(("data", buf.len()));
    }

    fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Release);
    }

    fn is_debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Acquire)
    }

    fn stream_summary(&self, _handle: &Arc<Handle>) -> Option<Value> {
        Some(json!({ "ready": self.ready.load(Ordering::Acquire) }))
    }
}

/// SDP parser stand-in: counts m-lines, latches ICE_RESTART when the
/// ice-ufrag changes on a renegotiation
pub struct MockSdp {
    last_ufrag: Mutex<Option<String>>,
}

impl MockSdp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_ufrag: Mutex::new(None),
        })
    }
}

fn ufrag_of(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("a=ice-ufrag:"))
        .map(str::to_string)
}

impl SdpStack for MockSdp {
    fn preparse(&self, sdp: &str) -> std::result::Result<ParsedSdp, String> {
        if !sdp.starts_with("v=0") {
            return Err("Invalid SDP: missing version line".to_string());
        }
        let counts = MediaCounts {
            audio: sdp.matches("m=audio").count(),
            video: sdp.matches("m=video").count(),
            data: sdp.matches("m=application").count(),
        };
        Ok(ParsedSdp {
            sdp: sdp.to_string(),
            counts,
        })
    }

    fn process(
        &self,
        handle: &Arc<Handle>,
        parsed: &ParsedSdp,
        update: bool,
    ) -> std::result::Result<(), String> {
        let ufrag = ufrag_of(&parsed.sdp);
        let mut last = self.last_ufrag.lock();
        if update {
            if let (Some(old), Some(new)) = (last.as_ref(), ufrag.as_ref()) {
                if old != new {
                    handle.set_flags(WebRtcFlags::ICE_RESTART);
                }
            }
        }
        if ufrag.is_some() {
            *last = ufrag;
        }
        Ok(())
    }

    fn anonymize(&self, parsed: &ParsedSdp) -> std::result::Result<String, String> {
        Ok(parsed.sdp.clone())
    }

    fn merge(
        &self,
        _handle: &Arc<Handle>,
        parsed: &ParsedSdp,
        _offer: bool,
    ) -> std::result::Result<String, String> {
        Ok(format!("{}\r\na=fingerprint:mock", parsed.sdp))
    }
}

/// Scriptable plugin: records what it receives, returns a configured
/// result, optionally parks inside handle_message until released
pub struct TestPlugin {
    package: &'static str,
    pub sessions: Mutex<Vec<Arc<PluginSession>>>,
    pub destroyed: AtomicUsize,
    pub hangups: AtomicUsize,
    pub messages: Mutex<Vec<(String, Value, Option<Value>)>>,
    pub result: Mutex<PluginResult>,
    pub gate: Mutex<Option<Arc<Notify>>>,
    pub callbacks: Mutex<Option<Arc<dyn GatewayCallbacks>>>,
}

impl TestPlugin {
    pub fn new(package: &'static str) -> Arc<Self> {
        Arc::new(Self {
            package,
            sessions: Mutex::new(Vec::new()),
            destroyed: AtomicUsize::new(0),
            hangups: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
            result: Mutex::new(PluginResult::OkWait(Some("I'm taking my time".to_string()))),
            gate: Mutex::new(None),
            callbacks: Mutex::new(None),
        })
    }

    pub fn set_result(&self, result: PluginResult) {
        *self.result.lock() = result;
    }

    /// The plugin session created by the most recent attach
    pub fn last_session(&self) -> Arc<PluginSession> {
        self.sessions.lock().last().cloned().expect("no attach seen")
    }
}

#[async_trait]
impl Plugin for TestPlugin {
    fn name(&self) -> &'static str {
        "Test plugin"
    }
    fn package(&self) -> &'static str {
        self.package
    }
    fn author(&self) -> &'static str {
        "tests"
    }
    fn description(&self) -> &'static str {
        "Scriptable plugin for tests"
    }
    fn version(&self) -> u32 {
        1
    }
    fn version_string(&self) -> &'static str {
        "0.0.1"
    }
    fn api_compatibility(&self) -> u32 {
        PLUGIN_API_VERSION
    }

    fn init(&self, gateway: Arc<dyn GatewayCallbacks>) -> Result<()> {
        *self.callbacks.lock() = Some(gateway);
        Ok(())
    }

    fn create_session(&self, session: &Arc<PluginSession>) -> Result<()> {
        self.sessions.lock().push(Arc::clone(session));
        Ok(())
    }

    fn destroy_session(&self, _session: &Arc<PluginSession>) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn handle_message(
        &self,
        _session: &Arc<PluginSession>,
        transaction: &str,
        body: Value,
        jsep: Option<Value>,
    ) -> PluginResult {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.messages
            .lock()
            .push((transaction.to_string(), body, jsep));
        self.result.lock().clone()
    }

    fn hangup_media(&self, _session: &Arc<PluginSession>) {
        self.hangups.fetch_add(1, Ordering::AcqRel);
    }

    fn query_session(&self, _session: &Arc<PluginSession>) -> Value {
        json!({ "mock": true })
    }
}

/// Event sink stand-in
pub struct MockEventHandler {
    pub events: Mutex<Vec<Value>>,
}

impl MockEventHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn of_type(&self, kind: &str) -> Vec<Value> {
        self.events
            .lock()
            .iter()
            .filter(|e| e["type"] == kind)
            .cloned()
            .collect()
    }
}

impl EventHandler for MockEventHandler {
    fn name(&self) -> &'static str {
        "Mock event handler"
    }
    fn package(&self) -> &'static str {
        "eventhandler.mock"
    }
    fn author(&self) -> &'static str {
        "tests"
    }
    fn description(&self) -> &'static str {
        "In-memory event sink for tests"
    }
    fn version(&self) -> u32 {
        1
    }
    fn version_string(&self) -> &'static str {
        "0.0.1"
    }
    fn api_compatibility(&self) -> u32 {
        EVENT_HANDLER_API_VERSION
    }

    fn incoming_event(&self, event: Value) {
        self.events.lock().push(event);
    }

    fn handle_request(&self, request: Value) -> Option<Value> {
        Some(json!({ "echoed": request }))
    }
}

/// A started gateway plus every mock it talks to
pub struct TestContext {
    pub gateway: Arc<Gateway>,
    pub transport: Arc<MockTransport>,
    pub ice: Arc<MockIce>,
    pub sdp: Arc<MockSdp>,
    pub echo: Arc<TestPlugin>,
    pub video: Arc<TestPlugin>,
    pub events: Arc<MockEventHandler>,
    pub instance: Arc<TransportSession>,
}

impl TestContext {
    pub async fn start(config: Config) -> Self {
        let transport = MockTransport::new();
        let ice = MockIce::new();
        let sdp = MockSdp::new();
        let echo = TestPlugin::new("plugin.echo");
        let video = TestPlugin::new("plugin.video");
        let events = MockEventHandler::new();
        let gateway = Gateway::builder(config)
            .ice(ice.clone())
            .sdp(sdp.clone())
            .transport(transport.clone())
            .plugin(echo.clone())
            .plugin(video.clone())
            .event_handler(events.clone())
            .build()
            .expect("gateway build failed");
        gateway.start().expect("gateway start failed");
        let instance = TransportSession::new(Arc::new(()));
        Self {
            gateway,
            transport,
            ice,
            sdp,
            echo,
            video,
            events,
            instance,
        }
    }

    /// Enqueue a core-API request and await its reply
    pub async fn request(&self, payload: Value) -> Value {
        self.request_on(&self.instance, payload).await
    }

    pub async fn request_on(&self, instance: &Arc<TransportSession>, payload: Value) -> Value {
        self.gateway
            .incoming_request("transport.mock", instance, None, false, payload)
            .expect("incoming_request failed");
        self.transport.recv().await
    }

    /// Enqueue an admin-API request and await its reply
    pub async fn admin(&self, payload: Value) -> Value {
        self.gateway
            .incoming_request("transport.mock", &self.instance, None, true, payload)
            .expect("incoming_request failed");
        self.transport.recv().await
    }

    /// `create` and return the new session id
    pub async fn create_session(&self) -> u64 {
        let reply = self
            .request(json!({ "janus": "create", "transaction": "t-create" }))
            .await;
        assert_eq!(reply["janus"], "success", "create failed: {reply}");
        reply["data"]["id"].as_u64().expect("no session id")
    }

    /// `attach` to a plugin and return the new handle id
    pub async fn attach(&self, session_id: u64, plugin: &str) -> u64 {
        let reply = self
            .request(json!({
                "janus": "attach",
                "transaction": "t-attach",
                "session_id": session_id,
                "plugin": plugin,
            }))
            .await;
        assert_eq!(reply["janus"], "success", "attach failed: {reply}");
        reply["data"]["id"].as_u64().expect("no handle id")
    }
}

/// A minimal valid audio offer for the mock SDP parser
pub fn offer_sdp(ufrag: &str) -> String {
    format!("v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\na=ice-ufrag:{ufrag}\r\nm=audio 9 RTP/SAVPF 111\r\n")
}

pub fn answer_sdp(ufrag: &str) -> String {
    format!("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\na=ice-ufrag:{ufrag}\r\nm=audio 9 RTP/SAVPF 111\r\n")
}
