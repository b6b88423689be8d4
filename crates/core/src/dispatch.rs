//! Request intake and dispatch
//!
//! Transports enqueue [`Request`]s onto one unbounded FIFO; a dedicated
//! dispatcher task pops them serially. Admin requests and cheap control
//! verbs run inline so their ordering is preserved; plugin-bound
//! `message` verbs are handed to a bounded worker pool because plugin
//! handlers may block or be slow.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, trace};

use crate::error::{codes, ApiError};
use crate::gateway::Gateway;
use crate::plugin::PluginSession;
use crate::transport::{ReplyToken, TransportSession};

/// Immutable description of one inbound API call
pub struct Request {
    /// Package name of the originating transport
    pub transport: String,
    /// The connection instance the request arrived on
    pub instance: Arc<TransportSession>,
    /// Opaque reply correlation token, echoed back with the response
    pub reply_token: Option<ReplyToken>,
    /// Whether this is an admin-API request
    pub admin: bool,
    /// The parsed JSON body
    pub payload: Value,
}

/// Queue items; the sentinel stops the dispatcher
pub(crate) enum QueueItem {
    Request(Request),
    Shutdown,
}

/// Teardown work plugins trigger; always executed on the timer loop so
/// the plugin's calling task never runs session destruction itself.
pub(crate) enum DeferredJob {
    ClosePc(Arc<PluginSession>),
    EndSession(Arc<PluginSession>),
}

/// Dispatcher loop: drains the request queue until the shutdown sentinel
pub(crate) async fn run(gateway: Arc<Gateway>, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
    info!("Requests dispatcher started");
    while let Some(item) = rx.recv().await {
        let request = match item {
            QueueItem::Shutdown => break,
            QueueItem::Request(request) => request,
        };
        if request.admin {
            // Admin requests are always handled inline
            gateway.process_incoming_admin_request(&request).await;
            continue;
        }
        let verb = request
            .payload
            .get("janus")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        if verb == "message" {
            // Plugin handlers may block: hand off to the worker pool and
            // keep draining the queue.
            match Arc::clone(gateway.message_workers()).try_acquire_owned() {
                Ok(permit) => {
                    let gateway = Arc::clone(&gateway);
                    tokio::spawn(async move {
                        trace!("Message worker serving request");
                        gateway.process_incoming_request(&request).await;
                        drop(permit);
                    });
                }
                Err(_) => {
                    error!("Message worker pool saturated, rejecting request");
                    let transaction = request
                        .payload
                        .get("transaction")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    gateway
                        .reply_error(
                            &request,
                            0,
                            transaction.as_deref(),
                            ApiError::new(codes::UNKNOWN, "Thread pool error"),
                        )
                        .await;
                }
            }
        } else {
            gateway.process_incoming_request(&request).await;
        }
    }
    info!("Requests dispatcher stopped");
}
