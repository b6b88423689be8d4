//! Core-API verb processing
//!
//! Parses, authorizes, and executes control verbs against the registry
//! and the collaborating plugins and media stacks, and drives the
//! per-handle signaling state machine. Every failure is serialized into
//! an error reply on the originating transport; nothing here ever aborts
//! the dispatcher.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::dispatch::Request;
use crate::error::{codes, ApiError};
use crate::events::event_type;
use crate::gateway::{Gateway, CLEANING_WAIT};
use crate::message::{envelope, optional_str, optional_u64, require_object, require_str};
use crate::session::{Handle, PendingTrickle, Session, TransportOrigin, WebRtcFlags};

/// Process one core-API request end to end
pub(crate) async fn process(gateway: &Arc<Gateway>, request: &Request) {
    let root = &request.payload;
    if !root.is_object() {
        let err = ApiError::new(codes::INVALID_JSON_OBJECT, "Request is not a JSON object");
        gateway.reply_error(request, 0, None, err).await;
        return;
    }

    let session_id = match optional_u64(root, "session_id") {
        Ok(id) => id,
        Err(err) => return gateway.reply_error(request, 0, None, err).await,
    };
    let handle_id = match optional_u64(root, "handle_id") {
        Ok(id) => id,
        Err(err) => {
            return gateway
                .reply_error(request, session_id.unwrap_or(0), None, err)
                .await
        }
    };
    let sid = session_id.unwrap_or(0);
    let hid = handle_id.unwrap_or(0);

    let transaction = match require_str(root, "transaction") {
        Ok(t) => t.to_string(),
        Err(err) => return gateway.reply_error(request, sid, None, err).await,
    };
    let transaction = transaction.as_str();
    let verb = match require_str(root, "janus") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(err) => return gateway.reply_error(request, sid, None, err).await,
    };

    if sid == 0 && hid == 0 {
        // Can only be a 'create', an 'info' or a 'ping' request
        match verb.as_str() {
            "info" => {
                gateway
                    .send_reply(request, gateway.server_info(Some(transaction)))
                    .await;
            }
            "ping" => {
                gateway
                    .send_reply(request, envelope("pong", 0, Some(transaction)))
                    .await;
            }
            "create" => process_create(gateway, request, transaction).await,
            _ => {
                let err = ApiError::new(
                    codes::INVALID_REQUEST_PATH,
                    format!("Unhandled request '{verb}' at this path"),
                );
                gateway.reply_error(request, sid, Some(transaction), err).await;
            }
        }
        return;
    }
    if sid == 0 {
        let err = ApiError::from_code(codes::SESSION_NOT_FOUND);
        return gateway.reply_error(request, sid, Some(transaction), err).await;
    }
    if handle_id == Some(0) {
        let err = ApiError::from_code(codes::SESSION_NOT_FOUND);
        return gateway.reply_error(request, sid, Some(transaction), err).await;
    }

    if !gateway.check_authorization(root) {
        let err = ApiError::from_code(codes::UNAUTHORIZED);
        return gateway.reply_error(request, sid, Some(transaction), err).await;
    }

    let Some(session) = gateway.registry().find(sid) else {
        let err = ApiError::new(codes::SESSION_NOT_FOUND, format!("No such session {sid}"));
        return gateway.reply_error(request, sid, Some(transaction), err).await;
    };
    // Update the last activity timer before anything verb-specific runs
    session.touch();

    let handle = if hid > 0 {
        match session.find_handle(hid) {
            Some(handle) => Some(handle),
            None => {
                let err = ApiError::new(
                    codes::HANDLE_NOT_FOUND,
                    format!("No such handle {hid} in session {sid}"),
                );
                return gateway.reply_error(request, sid, Some(transaction), err).await;
            }
        }
    } else {
        None
    };

    match verb.as_str() {
        "keepalive" => {
            if handle.is_some() {
                return path_error(gateway, request, sid, transaction, &verb).await;
            }
            debug!("Got a keep-alive on session {sid}");
            gateway
                .send_reply(request, envelope("ack", sid, Some(transaction)))
                .await;
        }
        "attach" => {
            if handle.is_some() {
                return path_error(gateway, request, sid, transaction, &verb).await;
            }
            process_attach(gateway, request, &session, transaction).await;
        }
        "destroy" => {
            if handle.is_some() {
                return path_error(gateway, request, sid, transaction, &verb).await;
            }
            process_destroy(gateway, request, &session, transaction).await;
        }
        "detach" => {
            let Some(handle) = handle else {
                return path_error(gateway, request, sid, transaction, &verb).await;
            };
            process_detach(gateway, request, &session, &handle, transaction).await;
        }
        "hangup" => {
            let Some(handle) = handle else {
                return path_error(gateway, request, sid, transaction, &verb).await;
            };
            if handle.binding().is_none() {
                let err = ApiError::new(codes::PLUGIN_DETACH, "No plugin attached");
                return gateway.reply_error(request, sid, Some(transaction), err).await;
            }
            gateway.webrtc_hangup(&handle, "API request");
            gateway
                .send_reply(request, envelope("success", sid, Some(transaction)))
                .await;
        }
        "message" => {
            let Some(handle) = handle else {
                return path_error(gateway, request, sid, transaction, &verb).await;
            };
            process_message(gateway, request, &session, &handle, transaction).await;
        }
        "trickle" => {
            let Some(handle) = handle else {
                return path_error(gateway, request, sid, transaction, &verb).await;
            };
            process_trickle(gateway, request, &session, &handle, transaction).await;
        }
        _ => {
            let err = ApiError::new(
                codes::UNKNOWN_REQUEST,
                format!("Unknown request '{verb}'"),
            );
            gateway.reply_error(request, sid, Some(transaction), err).await;
        }
    }
}

async fn path_error(
    gateway: &Arc<Gateway>,
    request: &Request,
    session_id: u64,
    transaction: &str,
    verb: &str,
) {
    let err = ApiError::new(
        codes::INVALID_REQUEST_PATH,
        format!("Unhandled request '{verb}' at this path"),
    );
    gateway
        .reply_error(request, session_id, Some(transaction), err)
        .await;
}

async fn process_create(gateway: &Arc<Gateway>, request: &Request, transaction: &str) {
    if !gateway.check_authorization(&request.payload) {
        let err = ApiError::from_code(codes::UNAUTHORIZED);
        return gateway.reply_error(request, 0, Some(transaction), err).await;
    }
    let requested_id = match optional_u64(&request.payload, "id") {
        Ok(id) => id,
        Err(err) => return gateway.reply_error(request, 0, Some(transaction), err).await,
    };
    let origin = TransportOrigin {
        transport: request.transport.clone(),
        instance: Arc::clone(&request.instance),
    };
    let session = match gateway.create_session(requested_id, origin) {
        Ok(session) => session,
        Err(err) => {
            return gateway
                .reply_error(request, requested_id.unwrap_or(0), Some(transaction), err)
                .await
        }
    };
    let session_id = session.id();

    // Notify the source that a new session has been created
    if let Some(transport) = gateway.transports().get(&request.transport) {
        transport.session_created(&request.instance, session_id);
    }
    gateway.notify_handlers(
        event_type::SESSION,
        json!({
            "session_id": session_id,
            "event": {
                "name": "created",
                "transport": {
                    "transport": request.transport,
                    "id": format!("{:?}", request.instance),
                },
            },
        }),
    );

    let mut reply = envelope("success", 0, Some(transaction));
    reply["data"] = json!({ "id": session_id });
    gateway.send_reply(request, reply).await;
}

async fn process_attach(
    gateway: &Arc<Gateway>,
    request: &Request,
    session: &Arc<Session>,
    transaction: &str,
) {
    let root = &request.payload;
    let session_id = session.id();
    let package = match require_str(root, "plugin") {
        Ok(p) => p,
        Err(err) => {
            return gateway
                .reply_error(request, session_id, Some(transaction), err)
                .await
        }
    };
    let Some(plugin) = gateway.plugin(package) else {
        let err = ApiError::new(codes::PLUGIN_NOT_FOUND, format!("No such plugin '{package}'"));
        return gateway
            .reply_error(request, session_id, Some(transaction), err)
            .await;
    };

    // Token holders may be limited to a subset of the plugins
    if gateway.auth().is_enabled() {
        if let Ok(Some(token)) = optional_str(root, "token") {
            if !gateway.auth().check_plugin(token, package) {
                warn!("Token can't access plugin '{package}'");
                let err = ApiError::new(
                    codes::UNAUTHORIZED_PLUGIN,
                    format!("Provided token can't access plugin '{package}'"),
                );
                return gateway
                    .reply_error(request, session_id, Some(transaction), err)
                    .await;
            }
        }
    }

    let opaque_id = match optional_str(root, "opaque_id") {
        Ok(opaque) => opaque.map(str::to_string),
        Err(err) => {
            return gateway
                .reply_error(request, session_id, Some(transaction), err)
                .await
        }
    };

    let handle = gateway.create_handle(session, opaque_id);
    let handle_id = handle.id();
    if let Err(e) = gateway.attach_plugin(&handle, &plugin) {
        session.remove_handle(handle_id);
        warn!("Couldn't attach to plugin '{package}': {e}");
        let err = ApiError::new(
            codes::PLUGIN_ATTACH,
            format!("Couldn't attach to plugin: {e}"),
        );
        return gateway
            .reply_error(request, session_id, Some(transaction), err)
            .await;
    }
    gateway.notify_handlers(
        event_type::HANDLE,
        json!({
            "session_id": session_id,
            "handle_id": handle_id,
            "opaque_id": handle.opaque_id(),
            "event": { "name": "attached", "plugin": package },
        }),
    );

    let mut reply = envelope("success", session_id, Some(transaction));
    reply["data"] = json!({ "id": handle_id });
    gateway.send_reply(request, reply).await;
}

async fn process_destroy(
    gateway: &Arc<Gateway>,
    request: &Request,
    session: &Arc<Session>,
    transaction: &str,
) {
    let session_id = session.id();
    gateway.registry().remove(session_id);
    // Notify the source that the session is over
    if let Some(transport) = gateway.transports().get(&session.origin().transport) {
        transport.session_over(&session.origin().instance, session_id, false);
    }
    gateway.destroy_session(session);

    gateway
        .send_reply(request, envelope("success", session_id, Some(transaction)))
        .await;
    gateway.notify_handlers(
        event_type::SESSION,
        json!({ "session_id": session_id, "event": { "name": "destroyed" } }),
    );
}

async fn process_detach(
    gateway: &Arc<Gateway>,
    request: &Request,
    session: &Arc<Session>,
    handle: &Arc<Handle>,
    transaction: &str,
) {
    let session_id = session.id();
    if handle.binding().is_none() {
        let err = ApiError::new(codes::PLUGIN_DETACH, "No plugin to detach from");
        return gateway
            .reply_error(request, session_id, Some(transaction), err)
            .await;
    }
    gateway.destroy_handle(session, handle);
    gateway.notify_handlers(
        event_type::HANDLE,
        json!({
            "session_id": session_id,
            "handle_id": handle.id(),
            "event": { "name": "detached" },
        }),
    );
    gateway
        .send_reply(request, envelope("success", session_id, Some(transaction)))
        .await;
}

async fn process_message(
    gateway: &Arc<Gateway>,
    request: &Request,
    session: &Arc<Session>,
    handle: &Arc<Handle>,
    transaction: &str,
) {
    let root = &request.payload;
    let session_id = session.id();
    let handle_id = handle.id();

    let Some((plugin, psession)) = handle.binding() else {
        let err = ApiError::new(codes::PLUGIN_MESSAGE, "No plugin to handle this message");
        return gateway
            .reply_error(request, session_id, Some(transaction), err)
            .await;
    };
    if !psession.is_alive() {
        let err = ApiError::new(codes::PLUGIN_MESSAGE, "No plugin to handle this message");
        return gateway
            .reply_error(request, session_id, Some(transaction), err)
            .await;
    }
    debug!("[{handle_id}] There's a message for {}", plugin.name());

    let body = match require_object(root, "body") {
        Ok(body) => body.clone(),
        Err(err) => {
            return gateway
                .reply_error(request, session_id, Some(transaction), err)
                .await
        }
    };

    // Is there an SDP attached?
    let mut body_jsep = None;
    if let Some(jsep) = root.get("jsep") {
        match process_inbound_jsep(gateway, session, handle, jsep).await {
            Ok(envelope) => body_jsep = Some(envelope),
            Err(err) => {
                return gateway
                    .reply_error(request, session_id, Some(transaction), err)
                    .await
            }
        }
    }

    // Make sure the plugin binding is still valid
    if !psession.is_alive() {
        handle.clear_flags(WebRtcFlags::PROCESSING_OFFER);
        let err = ApiError::new(codes::PLUGIN_MESSAGE, "No plugin to handle this message");
        return gateway
            .reply_error(request, session_id, Some(transaction), err)
            .await;
    }

    let result = plugin
        .handle_message(&psession, transaction, body, body_jsep)
        .await;
    match result {
        crate::plugin::PluginResult::Ok(content) => {
            // The plugin gave a result already (synchronous request/response)
            if content.is_null() {
                let err = ApiError::new(
                    codes::PLUGIN_MESSAGE,
                    "Plugin didn't provide any content for this synchronous response",
                );
                return gateway
                    .reply_error(request, session_id, Some(transaction), err)
                    .await;
            }
            if !content.is_object() {
                let err = ApiError::new(
                    codes::PLUGIN_MESSAGE,
                    "Plugin returned an invalid JSON response",
                );
                return gateway
                    .reply_error(request, session_id, Some(transaction), err)
                    .await;
            }
            let mut reply = envelope("success", session_id, Some(transaction));
            reply["sender"] = json!(handle_id);
            reply["plugindata"] = json!({
                "plugin": plugin.package(),
                "data": content,
            });
            gateway.send_reply(request, reply).await;
        }
        crate::plugin::PluginResult::OkWait(hint) => {
            // Taken for asynchronous processing: ack now, events follow
            let mut reply = envelope("ack", session_id, Some(transaction));
            if let Some(hint) = hint {
                reply["hint"] = json!(hint);
            }
            gateway.send_reply(request, reply).await;
        }
        crate::plugin::PluginResult::Err(text) => {
            let reason = if text.is_empty() {
                "Plugin returned a severe (unknown) error".to_string()
            } else {
                text
            };
            let err = ApiError::new(codes::PLUGIN_MESSAGE, reason);
            gateway
                .reply_error(request, session_id, Some(transaction), err)
                .await;
        }
    }
}

/// Inbound JSEP processing: validate, pre-parse, drive the flag machine,
/// and produce the anonymized envelope handed to the plugin.
async fn process_inbound_jsep(
    gateway: &Arc<Gateway>,
    session: &Arc<Session>,
    handle: &Arc<Handle>,
    jsep: &Value,
) -> Result<Value, ApiError> {
    let handle_id = handle.id();
    if !jsep.is_object() {
        return Err(ApiError::new(codes::INVALID_JSON_OBJECT, "Invalid jsep object"));
    }
    let jsep_type = require_str(jsep, "type")?.to_string();
    let sdp_str = require_str(jsep, "sdp")?.to_string();
    let do_trickle = jsep.get("trickle").and_then(Value::as_bool).unwrap_or(true);

    // Are we still cleaning up from a previous media session?
    if handle.is_set(WebRtcFlags::CLEANING) {
        debug!("[{handle_id}] Still cleaning up from a previous media session, waiting a bit...");
        if !handle.wait_until_clean(CLEANING_WAIT).await {
            return Err(ApiError::new(
                codes::WEBRTC_STATE,
                "Still cleaning a previous session",
            ));
        }
    }

    let _negotiation = handle.negotiation().lock().await;
    let offer = match jsep_type.as_str() {
        "offer" => {
            handle.set_flags(WebRtcFlags::PROCESSING_OFFER | WebRtcFlags::GOT_OFFER);
            handle.clear_flags(WebRtcFlags::GOT_ANSWER);
            true
        }
        "answer" => {
            handle.set_flags(WebRtcFlags::GOT_ANSWER);
            false
        }
        other => {
            return Err(ApiError::new(
                codes::JSEP_UNKNOWN_TYPE,
                format!("JSEP error: unknown message type '{other}'"),
            ));
        }
    };

    let parsed = match gateway.sdp_stack().preparse(&sdp_str) {
        Ok(parsed) => parsed,
        Err(e) => {
            handle.clear_flags(WebRtcFlags::PROCESSING_OFFER);
            return Err(ApiError::new(codes::JSEP_INVALID_SDP, e));
        }
    };
    gateway.notify_jsep_event(session.id(), handle, "remote", &jsep_type, &sdp_str);

    let counts = parsed.counts;
    debug!(
        "[{handle_id}] Audio {}, video {}, SCTP/DataChannels {} been negotiated",
        if counts.audio > 0 { "has" } else { "has NOT" },
        if counts.video > 0 { "has" } else { "has NOT" },
        if counts.data > 0 { "have" } else { "have NOT" },
    );
    if counts.audio > 1 {
        warn!("[{handle_id}] More than one audio line? only going to negotiate one...");
    }
    if counts.video > 1 {
        warn!("[{handle_id}] More than one video line? only going to negotiate one...");
    }
    if counts.data > 1 {
        warn!("[{handle_id}] More than one data line? only going to negotiate one...");
    }

    let mut renegotiation = false;
    if !handle.is_set(WebRtcFlags::READY) || handle.is_set(WebRtcFlags::ALERT) {
        // New media session
        if offer {
            match gateway.ice().setup_local(handle, true, counts, do_trickle) {
                Ok(agent) => handle.set_agent(agent),
                Err(e) => {
                    warn!("[{handle_id}] Error setting ICE locally: {e}");
                    handle.clear_flags(WebRtcFlags::PROCESSING_OFFER);
                    return Err(ApiError::new(codes::UNKNOWN, "Error setting ICE locally"));
                }
            }
            let mut caps = WebRtcFlags::empty();
            if counts.audio > 0 {
                caps |= WebRtcFlags::HAS_AUDIO;
            }
            if counts.video > 0 {
                caps |= WebRtcFlags::HAS_VIDEO;
            }
            if counts.data > 0 {
                caps |= WebRtcFlags::DATA_CHANNELS;
            }
            handle.set_flags(caps);
        } else if !handle.has_agent() {
            // Make sure we're waiting for an ANSWER in the first place
            warn!("[{handle_id}] Unexpected ANSWER (did we offer?)");
            handle.clear_flags(WebRtcFlags::PROCESSING_OFFER);
            return Err(ApiError::from_code(codes::UNEXPECTED_ANSWER));
        }
        if let Err(e) = gateway.sdp_stack().process(handle, &parsed, false) {
            warn!("[{handle_id}] Error processing SDP: {e}");
            handle.clear_flags(WebRtcFlags::PROCESSING_OFFER);
            return Err(ApiError::new(codes::JSEP_INVALID_SDP, "Error processing SDP"));
        }
        if !offer {
            // Set remote candidates now (we received an answer)
            handle.set_flags(WebRtcFlags::TRICKLE);
            gateway.handle_answer_ready(handle);
        }
    } else {
        // Renegotiation: simple media-direction changes and ICE restarts
        info!("[{handle_id}] Negotiation update, checking what changed...");
        if let Err(e) = gateway.sdp_stack().process(handle, &parsed, true) {
            warn!("[{handle_id}] Error processing SDP: {e}");
            handle.clear_flags(WebRtcFlags::PROCESSING_OFFER);
            return Err(ApiError::new(
                codes::UNEXPECTED_ANSWER,
                "Error processing SDP",
            ));
        }
        renegotiation = true;
        if handle.is_set(WebRtcFlags::ICE_RESTART) {
            info!("[{handle_id}] Restarting ICE...");
            if offer {
                gateway.ice().restart(handle);
            } else {
                handle.clear_flags(WebRtcFlags::ICE_RESTART);
            }
            // Full-trickle mode: our candidates must go out again
            if gateway.ice().full_trickle() {
                handle.set_flags(WebRtcFlags::RESEND_TRICKLES);
            }
        }
        if !offer
            && handle.is_set(WebRtcFlags::DATA_CHANNELS)
            && !gateway.ice().sctp_provisioned(handle)
        {
            info!("[{handle_id}] Creating datachannels...");
            gateway.ice().create_sctp(handle);
        }
    }
    handle.set_remote_sdp(sdp_str);

    // Anonymize before the plugin sees it
    let anonymized = match gateway.sdp_stack().anonymize(&parsed) {
        Ok(anonymized) => anonymized,
        Err(_) => {
            handle.clear_flags(WebRtcFlags::PROCESSING_OFFER);
            return Err(ApiError::new(
                codes::JSEP_INVALID_SDP,
                "JSEP error: invalid SDP",
            ));
        }
    };
    let mut body_jsep = json!({ "type": jsep_type, "sdp": anonymized });
    if handle.is_set(WebRtcFlags::HAS_VIDEO) {
        let ssrcs = gateway.ice().peer_simulcast_ssrcs(handle);
        if ssrcs.len() >= 2 {
            let mut simulcast = serde_json::Map::new();
            for (i, ssrc) in ssrcs.iter().take(3).enumerate() {
                simulcast.insert(format!("ssrc-{i}"), json!(ssrc));
            }
            body_jsep["simulcast"] = Value::Object(simulcast);
        }
    }
    if renegotiation {
        body_jsep["update"] = json!(true);
    }
    handle.clear_flags(WebRtcFlags::PROCESSING_OFFER);
    Ok(body_jsep)
}

async fn process_trickle(
    gateway: &Arc<Gateway>,
    request: &Request,
    session: &Arc<Session>,
    handle: &Arc<Handle>,
    transaction: &str,
) {
    let root = &request.payload;
    let session_id = session.id();
    let handle_id = handle.id();

    let alive = handle
        .plugin_session()
        .map(|p| p.is_alive())
        .unwrap_or(false);
    if !alive {
        let err = ApiError::new(
            codes::PLUGIN_MESSAGE,
            "No plugin to handle this trickle candidate",
        );
        return gateway
            .reply_error(request, session_id, Some(transaction), err)
            .await;
    }

    let candidate = root.get("candidate");
    let candidates = root.get("candidates");
    if candidate.is_none() && candidates.is_none() {
        let err = ApiError::new(
            codes::MISSING_MANDATORY_ELEMENT,
            "Missing mandatory element (candidate|candidates)",
        );
        return gateway
            .reply_error(request, session_id, Some(transaction), err)
            .await;
    }
    if candidate.is_some() && candidates.is_some() {
        let err = ApiError::new(
            codes::INVALID_JSON,
            "Can't have both candidate and candidates",
        );
        return gateway
            .reply_error(request, session_id, Some(transaction), err)
            .await;
    }
    if handle.is_set(WebRtcFlags::CLEANING) {
        warn!("[{handle_id}] Received a trickle, but still cleaning a previous session");
        let err = ApiError::new(codes::WEBRTC_STATE, "Still cleaning a previous session");
        return gateway
            .reply_error(request, session_id, Some(transaction), err)
            .await;
    }

    let _negotiation = handle.negotiation().lock().await;
    if !handle.is_set(WebRtcFlags::TRICKLE) {
        // It looks like this peer supports trickle, after all
        debug!("Handle {handle_id} supports trickle even if it didn't negotiate it...");
        handle.set_flags(WebRtcFlags::TRICKLE);
    }

    // This trickle may get here before the SDP it relates to
    if !gateway.ice().stream_ready(handle) {
        warn!("[{handle_id}] No stream, queueing this trickle as it got here before the SDP...");
        let payload = candidate.or(candidates).cloned().unwrap_or(Value::Null);
        handle.queue_trickle(PendingTrickle::new(transaction, payload));
        // Ack right away; an event reports any later failure
        return gateway
            .send_reply(request, envelope("ack", session_id, Some(transaction)))
            .await;
    }

    // Is the ICE stack ready already?
    let flags = handle.flags();
    if flags.contains(WebRtcFlags::PROCESSING_OFFER)
        || !flags.contains(WebRtcFlags::GOT_OFFER)
        || !flags.contains(WebRtcFlags::GOT_ANSWER)
    {
        let cause = if flags.contains(WebRtcFlags::PROCESSING_OFFER) {
            "processing the offer"
        } else if !flags.contains(WebRtcFlags::GOT_ANSWER) {
            "waiting for the answer"
        } else {
            "waiting for the offer"
        };
        debug!("[{handle_id}] Still {cause}, queueing this trickle until we're done there...");
        let payload = candidate.or(candidates).cloned().unwrap_or(Value::Null);
        handle.queue_trickle(PendingTrickle::new(transaction, payload));
        return gateway
            .send_reply(request, envelope("ack", session_id, Some(transaction)))
            .await;
    }

    if let Some(candidate) = candidate {
        // We got a single candidate
        if let Err(err) = gateway.ice().add_candidate(handle, candidate) {
            return gateway
                .reply_error(request, session_id, Some(transaction), err)
                .await;
        }
    } else if let Some(candidates) = candidates {
        // We got multiple candidates in an array
        let Some(list) = candidates.as_array() else {
            let err = ApiError::new(codes::INVALID_ELEMENT_TYPE, "candidates is not an array");
            return gateway
                .reply_error(request, session_id, Some(transaction), err)
                .await;
        };
        debug!("Got multiple candidates ({})", list.len());
        for candidate in list {
            // Individual failures in a batch are not reported
            let _ = gateway.ice().add_candidate(handle, candidate);
        }
    }

    // Reply right away, not to block the transport
    gateway
        .send_reply(request, envelope("ack", session_id, Some(transaction)))
        .await;
}
