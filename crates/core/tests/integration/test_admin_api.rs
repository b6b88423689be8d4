//! Admin-API behavior: introspection, runtime settings, token ACLs,
//! packet capture

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::{MockEventHandler, MockIce, MockSdp, MockTransport, TestContext, TestPlugin};
use serde_json::json;

use rtcgate_core::{Config, Gateway, GatewayCallbacks};

fn admin_config() -> Config {
    let mut config = Config::default();
    config.admin.admin_secret = Some("adminpw".to_string());
    config
}

fn with_secret(mut payload: serde_json::Value) -> serde_json::Value {
    payload["admin_secret"] = json!("adminpw");
    payload
}

#[tokio::test]
async fn test_admin_secret_is_enforced() {
    let ctx = TestContext::start(admin_config()).await;

    let reply = ctx
        .admin(json!({ "janus": "get_status", "transaction": "a1" }))
        .await;
    assert_eq!(reply["error"]["code"], 403);

    let reply = ctx
        .admin(json!({
            "janus": "get_status", "transaction": "a2", "admin_secret": "wrong",
        }))
        .await;
    assert_eq!(reply["error"]["code"], 403);

    let reply = ctx
        .admin(with_secret(json!({ "janus": "get_status", "transaction": "a3" })))
        .await;
    assert_eq!(reply["janus"], "success");

    // info is the one unguarded admin verb
    let reply = ctx
        .admin(json!({ "janus": "info", "transaction": "a4" }))
        .await;
    assert_eq!(reply["janus"], "server_info");
}

#[tokio::test]
async fn test_get_status_and_setting_mutators() {
    let ctx = TestContext::start(admin_config()).await;

    let reply = ctx
        .admin(with_secret(json!({ "janus": "get_status", "transaction": "a1" })))
        .await;
    let status = &reply["status"];
    assert_eq!(status["session_timeout"], 60);
    assert_eq!(status["token_auth"], false);
    assert_eq!(status["libnice_debug"], false);
    assert_eq!(status["max_nack_queue"], 500);

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "set_session_timeout", "transaction": "a2", "timeout": 120,
        })))
        .await;
    assert_eq!(reply["timeout"], 120);

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "set_libnice_debug", "transaction": "a3", "debug": true,
        })))
        .await;
    assert_eq!(reply["libnice_debug"], true);
    assert!(ctx.ice.debug.load(Ordering::Acquire));

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "set_log_timestamps", "transaction": "a4", "timestamps": true,
        })))
        .await;
    assert_eq!(reply["log_timestamps"], true);

    let reply = ctx
        .admin(with_secret(json!({ "janus": "get_status", "transaction": "a5" })))
        .await;
    assert_eq!(reply["status"]["session_timeout"], 120);
    assert_eq!(reply["status"]["log_timestamps"], true);
    assert_eq!(reply["status"]["libnice_debug"], true);
}

#[tokio::test]
async fn test_set_max_nack_queue_window() {
    let ctx = TestContext::start(admin_config()).await;

    for value in [1, 100, 199] {
        let reply = ctx
            .admin(with_secret(json!({
                "janus": "set_max_nack_queue", "transaction": "a1", "max_nack_queue": value,
            })))
            .await;
        assert_eq!(reply["error"]["code"], 467, "value {value} should be refused");
    }
    for value in [0, 200, 1000] {
        let reply = ctx
            .admin(with_secret(json!({
                "janus": "set_max_nack_queue", "transaction": "a2", "max_nack_queue": value,
            })))
            .await;
        assert_eq!(reply["max_nack_queue"], value, "value {value} should be accepted");
    }
}

#[tokio::test]
async fn test_set_log_level_calls_hook() {
    let seen = Arc::new(AtomicU32::new(99));
    let seen_hook = Arc::clone(&seen);

    let transport = MockTransport::new();
    let gateway = Gateway::builder(admin_config())
        .ice(MockIce::new())
        .sdp(MockSdp::new())
        .transport(transport.clone())
        .plugin(TestPlugin::new("plugin.echo"))
        .event_handler(MockEventHandler::new())
        .on_log_level_change(Box::new(move |level| {
            seen_hook.store(level, Ordering::Release);
        }))
        .build()
        .unwrap();
    gateway.start().unwrap();
    let instance = rtcgate_core::TransportSession::new(Arc::new(()));

    gateway
        .incoming_request(
            "transport.mock",
            &instance,
            None,
            true,
            with_secret(json!({ "janus": "set_log_level", "transaction": "a1", "level": 6 })),
        )
        .unwrap();
    let reply = transport.recv().await;
    assert_eq!(reply["level"], 6);
    assert_eq!(seen.load(Ordering::Acquire), 6);

    gateway
        .incoming_request(
            "transport.mock",
            &instance,
            None,
            true,
            with_secret(json!({ "janus": "set_log_level", "transaction": "a2", "level": 11 })),
        )
        .unwrap();
    let reply = transport.recv().await;
    assert_eq!(reply["error"]["code"], 467);
}

#[tokio::test]
async fn test_token_acl_round_trip() {
    let mut config = admin_config();
    config.general.token_auth = true;
    let ctx = TestContext::start(config).await;

    // Pre-state: one unrelated token
    ctx.admin(with_secret(json!({
        "janus": "add_token", "transaction": "a0", "token": "t0",
    })))
    .await;
    let reply = ctx
        .admin(with_secret(json!({ "janus": "list_tokens", "transaction": "a1" })))
        .await;
    let before = reply["data"]["tokens"].clone();
    assert_eq!(before.as_array().unwrap().len(), 1);

    // add_token with no plugin list grants every loaded plugin
    let reply = ctx
        .admin(with_secret(json!({
            "janus": "add_token", "transaction": "a2", "token": "t1",
        })))
        .await;
    let plugins = reply["data"]["plugins"].as_array().unwrap();
    assert_eq!(plugins.len(), 2);

    // disallow one of them
    let reply = ctx
        .admin(with_secret(json!({
            "janus": "disallow_token", "transaction": "a3",
            "token": "t1", "plugins": ["plugin.video"],
        })))
        .await;
    assert_eq!(reply["data"]["plugins"], json!(["plugin.echo"]));

    // disallow with no plugin list is refused
    let reply = ctx
        .admin(with_secret(json!({
            "janus": "disallow_token", "transaction": "a4", "token": "t1",
        })))
        .await;
    assert_eq!(reply["error"]["code"], 467);

    // allow_token on an unknown token
    let reply = ctx
        .admin(with_secret(json!({
            "janus": "allow_token", "transaction": "a5",
            "token": "ghost", "plugins": ["plugin.echo"],
        })))
        .await;
    assert_eq!(reply["error"]["code"], 470);

    // allow_token with an unknown plugin
    let reply = ctx
        .admin(with_secret(json!({
            "janus": "allow_token", "transaction": "a6",
            "token": "t1", "plugins": ["plugin.ghost"],
        })))
        .await;
    assert_eq!(reply["error"]["code"], 467);

    // remove_token restores the pre-state
    let reply = ctx
        .admin(with_secret(json!({
            "janus": "remove_token", "transaction": "a7", "token": "t1",
        })))
        .await;
    assert_eq!(reply["janus"], "success");
    let reply = ctx
        .admin(with_secret(json!({ "janus": "list_tokens", "transaction": "a8" })))
        .await;
    assert_eq!(reply["data"]["tokens"], before);

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "remove_token", "transaction": "a9", "token": "t1",
        })))
        .await;
    assert_eq!(reply["error"]["code"], 490);
}

#[tokio::test]
async fn test_token_verbs_require_token_auth() {
    let ctx = TestContext::start(admin_config()).await;
    for verb in ["add_token", "list_tokens", "remove_token"] {
        let reply = ctx
            .admin(with_secret(json!({
                "janus": verb, "transaction": "a1", "token": "t",
            })))
            .await;
        assert_eq!(reply["error"]["code"], 490, "verb {verb}");
    }
}

#[tokio::test]
async fn test_list_sessions_and_handles() {
    let ctx = TestContext::start(admin_config()).await;
    let sid = ctx.create_session().await;
    let hid = ctx.attach(sid, "plugin.echo").await;

    let reply = ctx
        .admin(with_secret(json!({ "janus": "list_sessions", "transaction": "a1" })))
        .await;
    let sessions = reply["sessions"].as_array().unwrap();
    assert!(sessions.contains(&json!(sid)));

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "list_handles", "transaction": "a2", "session_id": sid,
        })))
        .await;
    assert_eq!(reply["handles"], json!([hid]));

    // Any other verb at session scope is a path error
    let reply = ctx
        .admin(with_secret(json!({
            "janus": "get_status", "transaction": "a3", "session_id": sid,
        })))
        .await;
    assert_eq!(reply["error"]["code"], 457);
}

#[tokio::test]
async fn test_handle_info() {
    let ctx = TestContext::start(admin_config()).await;
    let sid = ctx.create_session().await;
    let reply = ctx
        .request(json!({
            "janus": "attach", "transaction": "t1", "session_id": sid,
            "plugin": "plugin.echo", "opaque_id": "client-42",
        }))
        .await;
    let hid = reply["data"]["id"].as_u64().unwrap();

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "handle_info", "transaction": "a1",
            "session_id": sid, "handle_id": hid,
        })))
        .await;
    assert_eq!(reply["janus"], "success");
    assert_eq!(reply["handle_id"], hid);
    let info = &reply["info"];
    assert_eq!(info["session_id"], sid);
    assert_eq!(info["session_transport"], "transport.mock");
    assert_eq!(info["opaque_id"], "client-42");
    assert_eq!(info["plugin"], "plugin.echo");
    assert_eq!(info["plugin_specific"]["mock"], true);
    assert_eq!(info["flags"]["got-offer"], false);
    assert_eq!(info["flags"]["cleaning"], false);
    assert!(info["streams"].is_array());
}

#[tokio::test]
async fn test_query_eventhandler() {
    let ctx = TestContext::start(admin_config()).await;

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "query_eventhandler", "transaction": "a1",
            "handler": "eventhandler.mock", "request": { "q": 1 },
        })))
        .await;
    assert_eq!(reply["janus"], "success");
    assert_eq!(reply["response"]["echoed"]["q"], 1);

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "query_eventhandler", "transaction": "a2", "handler": "nope",
        })))
        .await;
    assert_eq!(reply["error"]["code"], 460);
}

#[tokio::test]
async fn test_text2pcap_capture() {
    let ctx = TestContext::start(admin_config()).await;
    let sid = ctx.create_session().await;
    let hid = ctx.attach(sid, "plugin.echo").await;
    let dir = tempfile::tempdir().unwrap();

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "start_text2pcap", "transaction": "a1",
            "session_id": sid, "handle_id": hid,
            "folder": dir.path().to_str().unwrap(), "filename": "dump.txt",
            "truncate": 1,
        })))
        .await;
    assert_eq!(reply["janus"], "success");

    // Starting twice is refused
    let reply = ctx
        .admin(with_secret(json!({
            "janus": "start_text2pcap", "transaction": "a2",
            "session_id": sid, "handle_id": hid,
        })))
        .await;
    assert_eq!(reply["error"]["code"], 490);

    // Relayed media lands in the dump
    let psession = ctx.echo.last_session();
    ctx.gateway.relay_rtp(&psession, false, &[0x80, 0x12, 0x34]);
    let contents = std::fs::read_to_string(dir.path().join("dump.txt")).unwrap();
    assert!(contents.contains("80 12 34"));

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "stop_text2pcap", "transaction": "a3",
            "session_id": sid, "handle_id": hid,
        })))
        .await;
    assert_eq!(reply["janus"], "success");

    let reply = ctx
        .admin(with_secret(json!({
            "janus": "stop_text2pcap", "transaction": "a4",
            "session_id": sid, "handle_id": hid,
        })))
        .await;
    assert_eq!(reply["error"]["code"], 490);
}
