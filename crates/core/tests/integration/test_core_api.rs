//! Core-API verb behavior: intake validation, authorization, session and
//! handle lifecycle, error paths

mod common;

use common::TestContext;
use serde_json::json;

use rtcgate_core::Config;

#[tokio::test]
async fn test_ping_pong_echoes_transaction() {
    let ctx = TestContext::start(Config::default()).await;
    let reply = ctx
        .request(json!({ "janus": "ping", "transaction": "t-ping" }))
        .await;
    assert_eq!(reply["janus"], "pong");
    assert_eq!(reply["transaction"], "t-ping");
}

#[tokio::test]
async fn test_info_needs_no_auth() {
    let mut config = Config::default();
    config.general.api_secret = Some("s3cret".to_string());
    let ctx = TestContext::start(config).await;

    let reply = ctx
        .request(json!({ "janus": "info", "transaction": "t-info" }))
        .await;
    assert_eq!(reply["janus"], "server_info");
    assert_eq!(reply["name"], "rtcgate");
    assert!(reply["plugins"]["plugin.echo"].is_object());
    assert!(reply["transports"]["transport.mock"].is_object());
    assert_eq!(reply["api_secret"], true);
}

#[tokio::test]
async fn test_missing_transaction_is_rejected() {
    let ctx = TestContext::start(Config::default()).await;
    let reply = ctx.request(json!({ "janus": "ping" })).await;
    assert_eq!(reply["janus"], "error");
    assert_eq!(reply["error"]["code"], 456);
}

#[tokio::test]
async fn test_unknown_verb_and_bad_paths() {
    let ctx = TestContext::start(Config::default()).await;

    // Unknown verb at the root path
    let reply = ctx
        .request(json!({ "janus": "frobnicate", "transaction": "t1" }))
        .await;
    assert_eq!(reply["error"]["code"], 457);

    // Session-level verb with no session addressed
    let reply = ctx
        .request(json!({ "janus": "keepalive", "transaction": "t2" }))
        .await;
    assert_eq!(reply["error"]["code"], 457);

    let sid = ctx.create_session().await;

    // Unknown verb at session scope
    let reply = ctx
        .request(json!({ "janus": "frobnicate", "transaction": "t3", "session_id": sid }))
        .await;
    assert_eq!(reply["error"]["code"], 453);

    // Handle-level verb without a handle
    let reply = ctx
        .request(json!({ "janus": "detach", "transaction": "t4", "session_id": sid }))
        .await;
    assert_eq!(reply["error"]["code"], 457);

    // Session-level verb with a handle id
    let hid = ctx.attach(sid, "plugin.echo").await;
    let reply = ctx
        .request(json!({
            "janus": "keepalive", "transaction": "t5",
            "session_id": sid, "handle_id": hid,
        }))
        .await;
    assert_eq!(reply["error"]["code"], 457);
}

#[tokio::test]
async fn test_api_secret_authorization() {
    let mut config = Config::default();
    config.general.api_secret = Some("s3cret".to_string());
    let ctx = TestContext::start(config).await;

    // Missing secret
    let reply = ctx
        .request(json!({ "janus": "create", "transaction": "t1" }))
        .await;
    assert_eq!(reply["error"]["code"], 403);

    // Wrong secret
    let reply = ctx
        .request(json!({ "janus": "create", "transaction": "t2", "apisecret": "nope" }))
        .await;
    assert_eq!(reply["error"]["code"], 403);

    // Right secret
    let reply = ctx
        .request(json!({ "janus": "create", "transaction": "t3", "apisecret": "s3cret" }))
        .await;
    assert_eq!(reply["janus"], "success");
}

#[tokio::test]
async fn test_create_with_caller_id_and_conflict() {
    let ctx = TestContext::start(Config::default()).await;

    let reply = ctx
        .request(json!({ "janus": "create", "transaction": "t1", "id": 4242 }))
        .await;
    assert_eq!(reply["janus"], "success");
    assert_eq!(reply["data"]["id"], 4242);
    assert_eq!(*ctx.transport.created_sessions.lock(), vec![4242u64]);

    let reply = ctx
        .request(json!({ "janus": "create", "transaction": "t2", "id": 4242 }))
        .await;
    assert_eq!(reply["janus"], "error");
    assert_eq!(reply["error"]["code"], 468);
}

#[tokio::test]
async fn test_keepalive_acks() {
    let ctx = TestContext::start(Config::default()).await;
    let sid = ctx.create_session().await;

    let reply = ctx
        .request(json!({ "janus": "keepalive", "transaction": "t-ka", "session_id": sid }))
        .await;
    assert_eq!(reply["janus"], "ack");
    assert_eq!(reply["session_id"], sid);
    assert_eq!(reply["transaction"], "t-ka");
}

#[tokio::test]
async fn test_attach_detach_lifecycle() {
    let ctx = TestContext::start(Config::default()).await;
    let sid = ctx.create_session().await;

    // Unknown plugin
    let reply = ctx
        .request(json!({
            "janus": "attach", "transaction": "t1",
            "session_id": sid, "plugin": "plugin.ghost",
        }))
        .await;
    assert_eq!(reply["error"]["code"], 460);

    let hid = ctx.attach(sid, "plugin.echo").await;
    assert!(hid > 0);
    assert_eq!(ctx.echo.sessions.lock().len(), 1);

    let reply = ctx
        .request(json!({
            "janus": "detach", "transaction": "t2",
            "session_id": sid, "handle_id": hid,
        }))
        .await;
    assert_eq!(reply["janus"], "success");
    assert_eq!(ctx.echo.destroyed.load(std::sync::atomic::Ordering::Acquire), 1);

    // The handle is gone now
    let reply = ctx
        .request(json!({
            "janus": "detach", "transaction": "t3",
            "session_id": sid, "handle_id": hid,
        }))
        .await;
    assert_eq!(reply["error"]["code"], 459);
}

#[tokio::test]
async fn test_unauthorized_plugin_attach_creates_no_handle() {
    let mut config = Config::default();
    config.general.token_auth = true;
    config.admin.admin_secret = Some("adminpw".to_string());
    let ctx = TestContext::start(config).await;

    // Provision a token that may only talk to the echo plugin
    let reply = ctx
        .admin(json!({
            "janus": "add_token", "transaction": "a1",
            "admin_secret": "adminpw", "token": "tokenX",
            "plugins": ["plugin.echo"],
        }))
        .await;
    assert_eq!(reply["janus"], "success");

    let reply = ctx
        .request(json!({ "janus": "create", "transaction": "t1", "token": "tokenX" }))
        .await;
    let sid = reply["data"]["id"].as_u64().unwrap();

    let reply = ctx
        .request(json!({
            "janus": "attach", "transaction": "t2", "session_id": sid,
            "plugin": "plugin.video", "token": "tokenX",
        }))
        .await;
    assert_eq!(reply["error"]["code"], 405);
    assert!(ctx.video.sessions.lock().is_empty());

    // The allowed plugin still works
    let reply = ctx
        .request(json!({
            "janus": "attach", "transaction": "t3", "session_id": sid,
            "plugin": "plugin.echo", "token": "tokenX",
        }))
        .await;
    assert_eq!(reply["janus"], "success");
}

#[tokio::test]
async fn test_double_destroy() {
    let ctx = TestContext::start(Config::default()).await;
    let sid = ctx.create_session().await;

    let reply = ctx
        .request(json!({ "janus": "destroy", "transaction": "t1", "session_id": sid }))
        .await;
    assert_eq!(reply["janus"], "success");
    assert_eq!(*ctx.transport.over_sessions.lock(), vec![(sid, false)]);

    let reply = ctx
        .request(json!({ "janus": "destroy", "transaction": "t2", "session_id": sid }))
        .await;
    assert_eq!(reply["error"]["code"], 458);
}

#[tokio::test]
async fn test_destroy_tears_down_handles() {
    let ctx = TestContext::start(Config::default()).await;
    let sid = ctx.create_session().await;
    ctx.attach(sid, "plugin.echo").await;
    ctx.attach(sid, "plugin.echo").await;

    let reply = ctx
        .request(json!({ "janus": "destroy", "transaction": "t1", "session_id": sid }))
        .await;
    assert_eq!(reply["janus"], "success");
    assert_eq!(ctx.echo.destroyed.load(std::sync::atomic::Ordering::Acquire), 2);
}

#[tokio::test]
async fn test_message_requires_body() {
    let ctx = TestContext::start(Config::default()).await;
    let sid = ctx.create_session().await;
    let hid = ctx.attach(sid, "plugin.echo").await;

    let reply = ctx
        .request(json!({
            "janus": "message", "transaction": "t1",
            "session_id": sid, "handle_id": hid,
        }))
        .await;
    assert_eq!(reply["error"]["code"], 456);

    let reply = ctx
        .request(json!({
            "janus": "message", "transaction": "t2",
            "session_id": sid, "handle_id": hid, "body": "not an object",
        }))
        .await;
    assert_eq!(reply["error"]["code"], 467);
}

#[tokio::test]
async fn test_hangup_requires_plugin() {
    let ctx = TestContext::start(Config::default()).await;
    let sid = ctx.create_session().await;
    let hid = ctx.attach(sid, "plugin.echo").await;

    // No PeerConnection yet: hangup succeeds but is a no-op
    let reply = ctx
        .request(json!({
            "janus": "hangup", "transaction": "t1",
            "session_id": sid, "handle_id": hid,
        }))
        .await;
    assert_eq!(reply["janus"], "success");
    assert!(ctx.ice.hangups.lock().is_empty());
}

#[tokio::test]
async fn test_session_event_records() {
    let ctx = TestContext::start(Config::default()).await;
    let sid = ctx.create_session().await;
    ctx.request(json!({ "janus": "destroy", "transaction": "t1", "session_id": sid }))
        .await;

    let session_events = ctx.events.of_type("session");
    let names: Vec<String> = session_events
        .iter()
        .map(|e| e["event"]["name"].as_str().unwrap_or_default().to_string())
        .collect();
    assert!(names.contains(&"created".to_string()), "events: {names:?}");
    assert!(names.contains(&"destroyed".to_string()), "events: {names:?}");
}
