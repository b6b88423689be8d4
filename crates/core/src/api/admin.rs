//! Admin-API verb processing
//!
//! Same intake pipeline as the core API, different verb set:
//! introspection (sessions, handles, per-handle state), runtime settings,
//! token ACL management, and per-handle packet capture. Every mutator is
//! guarded by the admin secret when one is configured.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use crate::capture::PacketCapture;
use crate::dispatch::Request;
use crate::error::{codes, ApiError};
use crate::gateway::Gateway;
use crate::message::{
    envelope, optional_str, optional_u64, require_bool, require_str, require_u64,
};
use crate::session::{Handle, Session, WebRtcFlags};

/// Log levels accepted by `set_log_level`
const LOG_LEVEL_MAX: u64 = 7;

/// Process one admin-API request end to end
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
        // General settings manipulation, or an info/status query
        if verb == "info" {
            // The generic info request needs no secret
            return gateway
                .send_reply(request, gateway.server_info(Some(transaction)))
                .await;
        }
        if !gateway.check_admin_secret(root) {
            let err = ApiError::from_code(codes::UNAUTHORIZED);
            return gateway.reply_error(request, 0, Some(transaction), err).await;
        }
        return process_global(gateway, request, transaction, &verb).await;
    }
    if sid == 0 || handle_id == Some(0) {
        let err = ApiError::from_code(codes::SESSION_NOT_FOUND);
        return gateway.reply_error(request, sid, Some(transaction), err).await;
    }

    if !gateway.check_admin_secret(root) {
        let err = ApiError::from_code(codes::UNAUTHORIZED);
        return gateway.reply_error(request, sid, Some(transaction), err).await;
    }

    let Some(session) = gateway.registry().find(sid) else {
        let err = ApiError::new(codes::SESSION_NOT_FOUND, format!("No such session {sid}"));
        return gateway.reply_error(request, sid, Some(transaction), err).await;
    };
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

    match handle {
        None => {
            // Session-related: only the handle listing lives here
            if verb != "list_handles" {
                let err = ApiError::new(
                    codes::INVALID_REQUEST_PATH,
                    format!("Unhandled request '{verb}' at this path"),
                );
                return gateway.reply_error(request, sid, Some(transaction), err).await;
            }
            let mut reply = envelope("success", sid, Some(transaction));
            reply["handles"] = json!(session.handle_ids());
            gateway.send_reply(request, reply).await;
        }
        Some(handle) => {
            process_handle_scope(gateway, request, &session, &handle, transaction, &verb).await;
        }
    }
}

async fn process_global(
    gateway: &Arc<Gateway>,
    request: &Request,
    transaction: &str,
    verb: &str,
) {
    let root = &request.payload;
    match verb {
        "get_status" => {
            let settings = gateway.settings();
            let mut reply = envelope("success", 0, Some(transaction));
            reply["status"] = json!({
                "token_auth": gateway.auth().is_enabled(),
                "session_timeout": settings.session_timeout(),
                "log_level": settings.log_level(),
                "log_timestamps": settings.log_timestamps(),
                "log_colors": settings.log_colors(),
                "locking_debug": settings.locking_debug(),
                "refcount_debug": settings.refcount_debug(),
                "libnice_debug": gateway.ice().is_debug_enabled(),
                "max_nack_queue": settings.max_nack_queue(),
                "no_media_timer": settings.no_media_timer(),
            });
            gateway.send_reply(request, reply).await;
        }
        "set_session_timeout" => {
            let timeout = match require_u64(root, "timeout") {
                Ok(t) => t,
                Err(err) => return gateway.reply_error(request, 0, Some(transaction), err).await,
            };
            gateway.settings().set_session_timeout(timeout);
            let mut reply = envelope("success", 0, Some(transaction));
            reply["timeout"] = json!(gateway.settings().session_timeout());
            gateway.send_reply(request, reply).await;
        }
        "set_log_level" => {
            let level = match require_u64(root, "level") {
                Ok(l) => l,
                Err(err) => return gateway.reply_error(request, 0, Some(transaction), err).await,
            };
            if level > LOG_LEVEL_MAX {
                let err = ApiError::new(
                    codes::INVALID_ELEMENT_TYPE,
                    format!("Invalid element type (level should be between 0 and {LOG_LEVEL_MAX})"),
                );
                return gateway.reply_error(request, 0, Some(transaction), err).await;
            }
            gateway.apply_log_level(level as u32);
            let mut reply = envelope("success", 0, Some(transaction));
            reply["level"] = json!(gateway.settings().log_level());
            gateway.send_reply(request, reply).await;
        }
        "set_log_timestamps" => {
            match require_bool(root,"timestamps") {
                Ok(enabled) => {
                    gateway.settings().set_log_timestamps(enabled);
                    let mut reply = envelope("success", 0, Some(transaction));
                    reply["log_timestamps"] = json!(gateway.settings().log_timestamps());
                    gateway.send_reply(request, reply).await;
                }
                Err(err) => gateway.reply_error(request, 0, Some(transaction), err).await,
            }
        }
        "set_log_colors" => {
            match require_bool(root,"colors") {
                Ok(enabled) => {
                    gateway.settings().set_log_colors(enabled);
                    let mut reply = envelope("success", 0, Some(transaction));
                    reply["log_colors"] = json!(gateway.settings().log_colors());
                    gateway.send_reply(request, reply).await;
                }
                Err(err) => gateway.reply_error(request, 0, Some(transaction), err).await,
            }
        }
        "set_locking_debug" => {
            match require_bool(root,"debug") {
                Ok(enabled) => {
                    gateway.settings().set_locking_debug(enabled);
                    let mut reply = envelope("success", 0, Some(transaction));
                    reply["locking_debug"] = json!(gateway.settings().locking_debug());
                    gateway.send_reply(request, reply).await;
                }
                Err(err) => gateway.reply_error(request, 0, Some(transaction), err).await,
            }
        }
        "set_refcount_debug" => {
            match require_bool(root,"debug") {
                Ok(enabled) => {
                    gateway.set_refcount_debug(enabled);
                    let mut reply = envelope("success", 0, Some(transaction));
                    reply["refcount_debug"] = json!(gateway.settings().refcount_debug());
                    gateway.send_reply(request, reply).await;
                }
                Err(err) => gateway.reply_error(request, 0, Some(transaction), err).await,
            }
        }
        "set_libnice_debug" => {
            match require_bool(root,"debug") {
                Ok(enabled) => {
                    gateway.ice().set_debug(enabled);
                    let mut reply = envelope("success", 0, Some(transaction));
                    reply["libnice_debug"] = json!(gateway.ice().is_debug_enabled());
                    gateway.send_reply(request, reply).await;
                }
                Err(err) => gateway.reply_error(request, 0, Some(transaction), err).await,
            }
        }
        "set_max_nack_queue" => {
            let value = match require_u64(root, "max_nack_queue") {
                Ok(v) => v,
                Err(err) => return gateway.reply_error(request, 0, Some(transaction), err).await,
            };
            if value > 0 && value < 200 {
                let err = ApiError::new(
                    codes::INVALID_ELEMENT_TYPE,
                    "Invalid element type (max_nack_queue, if provided, should be greater than 200)",
                );
                return gateway.reply_error(request, 0, Some(transaction), err).await;
            }
            gateway.settings().set_max_nack_queue(value as usize);
            let mut reply = envelope("success", 0, Some(transaction));
            reply["max_nack_queue"] = json!(gateway.settings().max_nack_queue());
            gateway.send_reply(request, reply).await;
        }
        "set_no_media_timer" => {
            let value = match require_u64(root, "no_media_timer") {
                Ok(v) => v,
                Err(err) => return gateway.reply_error(request, 0, Some(transaction), err).await,
            };
            gateway.settings().set_no_media_timer(value);
            let mut reply = envelope("success", 0, Some(transaction));
            reply["no_media_timer"] = json!(gateway.settings().no_media_timer());
            gateway.send_reply(request, reply).await;
        }
        "query_eventhandler" => {
            let package = match require_str(root, "handler") {
                Ok(p) => p,
                Err(err) => return gateway.reply_error(request, 0, Some(transaction), err).await,
            };
            let Some(handler) = gateway.event_handlers().get(package) else {
                let err = ApiError::new(codes::PLUGIN_NOT_FOUND, "Invalid event handler");
                return gateway.reply_error(request, 0, Some(transaction), err).await;
            };
            let query = root.get("request").cloned().unwrap_or_else(|| json!({}));
            match handler.handle_request(query) {
                Some(response) => {
                    let mut reply = envelope("success", 0, Some(transaction));
                    reply["response"] = response;
                    gateway.send_reply(request, reply).await;
                }
                None => {
                    let err =
                        ApiError::new(codes::UNKNOWN, "Event handler doesn't support queries");
                    gateway.reply_error(request, 0, Some(transaction), err).await;
                }
            }
        }
        "list_sessions" => {
            let mut reply = envelope("success", 0, Some(transaction));
            reply["sessions"] = json!(gateway.registry().ids());
            gateway.send_reply(request, reply).await;
        }
        "add_token" => process_allow_token(gateway, request, transaction, true, true).await,
        "allow_token" => process_allow_token(gateway, request, transaction, true, false).await,
        "disallow_token" => process_allow_token(gateway, request, transaction, false, false).await,
        "list_tokens" => {
            if !gateway.auth().is_enabled() {
                let err = ApiError::new(codes::UNKNOWN, "Token based authentication disabled");
                return gateway.reply_error(request, 0, Some(transaction), err).await;
            }
            let mut tokens = Vec::new();
            for token in gateway.auth().list_tokens() {
                let plugins = gateway.auth().allowed_plugins(&token);
                if plugins.is_empty() {
                    continue;
                }
                tokens.push(json!({ "token": token, "allowed_plugins": plugins }));
            }
            let mut reply = envelope("success", 0, Some(transaction));
            reply["data"] = json!({ "tokens": tokens });
            gateway.send_reply(request, reply).await;
        }
        "remove_token" => {
            if !gateway.auth().is_enabled() {
                let err = ApiError::new(codes::UNKNOWN, "Token based authentication disabled");
                return gateway.reply_error(request, 0, Some(transaction), err).await;
            }
            let token = match require_str(root, "token") {
                Ok(t) => t,
                Err(err) => return gateway.reply_error(request, 0, Some(transaction), err).await,
            };
            if !gateway.auth().remove_token(token) {
                let err = ApiError::new(codes::UNKNOWN, "Error removing token");
                return gateway.reply_error(request, 0, Some(transaction), err).await;
            }
            gateway
                .send_reply(request, envelope("success", 0, Some(transaction)))
                .await;
        }
        _ => {
            let err = ApiError::new(
                codes::INVALID_REQUEST_PATH,
                format!("Unhandled request '{verb}' at this path"),
            );
            gateway.reply_error(request, 0, Some(transaction), err).await;
        }
    }
}

/// add_token / allow_token / disallow_token share one implementation
async fn process_allow_token(
    gateway: &Arc<Gateway>,
    request: &Request,
    transaction: &str,
    allow: bool,
    add: bool,
) {
    let root = &request.payload;
    if !gateway.auth().is_enabled() {
        let err = ApiError::new(codes::UNKNOWN, "Token based authentication disabled");
        return gateway.reply_error(request, 0, Some(transaction), err).await;
    }
    let token = match require_str(root, "token") {
        Ok(t) => t,
        Err(err) => return gateway.reply_error(request, 0, Some(transaction), err).await,
    };

    // Any plugin this token should be limited to?
    let plugins_field = root.get("plugins");
    let plugins_list = match plugins_field {
        None | Some(Value::Null) => None,
        Some(Value::Array(list)) => Some(list),
        Some(_) => {
            let err = ApiError::new(
                codes::INVALID_ELEMENT_TYPE,
                "Invalid element type (plugins should be an array)",
            );
            return gateway.reply_error(request, 0, Some(transaction), err).await;
        }
    };
    if !add && plugins_list.map(Vec::len).unwrap_or(0) == 0 {
        let err = ApiError::new(
            codes::INVALID_ELEMENT_TYPE,
            "Invalid element type (plugins should be a non-empty array)",
        );
        return gateway.reply_error(request, 0, Some(transaction), err).await;
    }

    if add {
        if !gateway.auth().add_token(token) {
            let err = ApiError::new(codes::UNKNOWN, "Error adding token");
            return gateway.reply_error(request, 0, Some(transaction), err).await;
        }
    } else if !gateway.auth().check_token(token) {
        let err = ApiError::new(codes::TOKEN_NOT_FOUND, format!("Token {token} not found"));
        return gateway.reply_error(request, 0, Some(transaction), err).await;
    }

    match plugins_list {
        Some(list) if !list.is_empty() => {
            // Validate the whole batch first
            let mut packages = Vec::new();
            for item in list {
                let Some(package) = item.as_str() else {
                    if add {
                        warn!("Invalid plugin passed to the token request, skipping...");
                        continue;
                    }
                    let err = ApiError::new(
                        codes::INVALID_ELEMENT_TYPE,
                        "Invalid element type (some of the provided plugins are invalid)",
                    );
                    return gateway.reply_error(request, 0, Some(transaction), err).await;
                };
                if gateway.plugin(package).is_none() {
                    if add {
                        warn!("No such plugin '{package}' passed to the token request, skipping...");
                        continue;
                    }
                    let err = ApiError::new(
                        codes::INVALID_ELEMENT_TYPE,
                        "Invalid element type (some of the provided plugins are invalid)",
                    );
                    return gateway.reply_error(request, 0, Some(transaction), err).await;
                }
                packages.push(package);
            }
            for package in packages {
                let done = if allow {
                    gateway.auth().allow_plugin(token, package)
                } else {
                    gateway.auth().disallow_plugin(token, package)
                };
                if !done {
                    warn!("Error updating access to '{package}' for the token");
                }
            }
        }
        _ => {
            // No plugin limitation specified, allow all plugins
            for package in gateway.plugins().keys() {
                if !gateway.auth().allow_plugin(token, package) {
                    warn!("Error allowing access to '{package}' to the new token");
                }
            }
        }
    }

    let mut reply = envelope("success", 0, Some(transaction));
    reply["data"] = json!({ "plugins": gateway.auth().allowed_plugins(token) });
    gateway.send_reply(request, reply).await;
}

async fn process_handle_scope(
    gateway: &Arc<Gateway>,
    request: &Request,
    session: &Arc<Session>,
    handle: &Arc<Handle>,
    transaction: &str,
    verb: &str,
) {
    let root = &request.payload;
    let session_id = session.id();
    match verb {
        "start_text2pcap" => {
            let folder = match optional_str(root, "folder") {
                Ok(f) => f,
                Err(err) => {
                    return gateway
                        .reply_error(request, session_id, Some(transaction), err)
                        .await
                }
            };
            let filename = match optional_str(root, "filename") {
                Ok(f) => f,
                Err(err) => {
                    return gateway
                        .reply_error(request, session_id, Some(transaction), err)
                        .await
                }
            };
            let truncate = root
                .get("truncate")
                .and_then(Value::as_u64)
                .unwrap_or(0)
                > 0;
            if handle.dump_enabled() {
                let err = ApiError::new(codes::UNKNOWN, "text2pcap already started");
                return gateway
                    .reply_error(request, session_id, Some(transaction), err)
                    .await;
            }
            let capture = match PacketCapture::create(folder, filename, truncate) {
                Ok(capture) => Arc::new(capture),
                Err(e) => {
                    warn!("[{}] Error starting text2pcap dump: {e}", handle.id());
                    let err = ApiError::new(codes::UNKNOWN, "Error starting text2pcap dump");
                    return gateway
                        .reply_error(request, session_id, Some(transaction), err)
                        .await;
                }
            };
            if let Err(e) = handle.start_capture(capture) {
                let err = ApiError::new(codes::UNKNOWN, e);
                return gateway
                    .reply_error(request, session_id, Some(transaction), err)
                    .await;
            }
            gateway
                .send_reply(request, envelope("success", session_id, Some(transaction)))
                .await;
        }
        "stop_text2pcap" => {
            if let Err(e) = handle.stop_capture() {
                let err = ApiError::new(codes::UNKNOWN, e);
                return gateway
                    .reply_error(request, session_id, Some(transaction), err)
                    .await;
            }
            gateway
                .send_reply(request, envelope("success", session_id, Some(transaction)))
                .await;
        }
        "handle_info" => {
            let mut reply = envelope("success", session_id, Some(transaction));
            reply["handle_id"] = json!(handle.id());
            reply["info"] = handle_info(gateway, session, handle);
            gateway.send_reply(request, reply).await;
        }
        _ => {
            let err = ApiError::new(
                codes::INVALID_REQUEST_PATH,
                format!("Unhandled request '{verb}' at this path"),
            );
            gateway
                .reply_error(request, session_id, Some(transaction), err)
                .await;
        }
    }
}

/// Full per-handle state dump: flags, SDPs, stream summary
fn handle_info(gateway: &Arc<Gateway>, session: &Arc<Session>, handle: &Arc<Handle>) -> Value {
    let mut info = json!({
        "session_id": session.id(),
        "session_last_activity": session.idle_for().as_micros() as u64,
        "session_transport": session.origin().transport,
        "handle_id": handle.id(),
        "created": handle.created().timestamp_micros(),
        "current_time": chrono::Utc::now().timestamp_micros(),
    });
    if let Some(opaque) = handle.opaque_id() {
        info["opaque_id"] = json!(opaque);
    }
    if let Some((plugin, psession)) = handle.binding() {
        if psession.is_alive() {
            info["plugin"] = json!(plugin.package());
            let query = plugin.query_session(&psession);
            if query.is_object() {
                info["plugin_specific"] = query;
            } else {
                warn!("Ignoring invalid query response from the plugin (not an object)");
            }
        }
    }
    let flags = handle.flags();
    info["flags"] = json!({
        "got-offer": flags.contains(WebRtcFlags::GOT_OFFER),
        "got-answer": flags.contains(WebRtcFlags::GOT_ANSWER),
        "processing-offer": flags.contains(WebRtcFlags::PROCESSING_OFFER),
        "starting": flags.contains(WebRtcFlags::START),
        "ice-restart": flags.contains(WebRtcFlags::ICE_RESTART),
        "ready": flags.contains(WebRtcFlags::READY),
        "stopped": flags.contains(WebRtcFlags::STOP),
        "alert": flags.contains(WebRtcFlags::ALERT),
        "trickle": flags.contains(WebRtcFlags::TRICKLE),
        "all-trickles": flags.contains(WebRtcFlags::ALL_TRICKLES),
        "resend-trickles": flags.contains(WebRtcFlags::RESEND_TRICKLES),
        "trickle-synced": flags.contains(WebRtcFlags::TRICKLE_SYNCED),
        "data-channels": flags.contains(WebRtcFlags::DATA_CHANNELS),
        "has-audio": flags.contains(WebRtcFlags::HAS_AUDIO),
        "has-video": flags.contains(WebRtcFlags::HAS_VIDEO),
        "rfc4588-rtx": flags.contains(WebRtcFlags::RFC4588_RTX),
        "cleaning": flags.contains(WebRtcFlags::CLEANING),
    });
    let mut sdps = json!({});
    if let Some(local) = handle.local_sdp() {
        sdps["local"] = json!(local);
    }
    if let Some(remote) = handle.remote_sdp() {
        sdps["remote"] = json!(remote);
    }
    info["sdps"] = sdps;
    if handle.pending_trickle_count() > 0 {
        info["pending-trickles"] = json!(handle.pending_trickle_count());
    }
    if handle.dump_enabled() {
        info["dump-to-text2pcap"] = json!(true);
        if let Some(capture) = handle.capture() {
            info["text2pcap-file"] = json!(capture.path().display().to_string());
        }
    }
    let mut streams = Vec::new();
    if let Some(summary) = gateway.ice().stream_summary(handle) {
        streams.push(summary);
    }
    info["streams"] = json!(streams);
    info
}
