//! `conduit serve`: a WebSocket front end for the orchestrator.
//!
//! Each connection is one outbound channel. Clients send JSON messages
//! tagged by `type` (`invoke`, `cancel`, `input`, `close-input`); events of
//! every invocation started on the connection are written back as text
//! frames, told apart by their correlation token.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use conduit_core::{
    CanonicalEvent, EntryId, EventSink, InvocationRequest, Orchestrator, OutboundEvent,
};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Invoke(InvocationRequest),
    Cancel { session_id: String },
    Input { session_id: String, text: String },
    CloseInput { session_id: String },
}

/// Replies to control messages. Serialized with a `type` tag so clients can
/// tell them from events, which carry `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Reply {
    CancelResult {
        session_id: String,
        cancelled: bool,
    },
    InputResult {
        session_id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Rejected {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Event(OutboundEvent),
    Reply(Reply),
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_processes: usize,
}

/// Forwards events into a connection's writer queue.
struct ConnectionSink {
    frames: mpsc::Sender<ServerFrame>,
}

#[async_trait]
impl EventSink for ConnectionSink {
    async fn emit(&self, event: OutboundEvent) -> bool {
        self.frames.send(ServerFrame::Event(event)).await.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(orchestrator: Orchestrator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(orchestrator)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(orchestrator: Orchestrator, bind: &str, port: u16) -> Result<()> {
    let app = build_router(orchestrator);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;
    info!("conduit serve listening on ws://{addr}/ws");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("conduit serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; serving until killed");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(orchestrator): State<Orchestrator>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_processes: orchestrator.supervisor().registry().len().await,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(orchestrator): State<Orchestrator>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, orchestrator))
}

async fn handle_socket(socket: WebSocket, orchestrator: Orchestrator) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(orchestrator.config().event_buffer.max(1));

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to serialize frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let sink: Arc<dyn EventSink> = Arc::new(ConnectionSink { frames: tx.clone() });
    let mut owned = Vec::new();

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "websocket receive failed");
                break;
            }
        };
        if let Some(frame) = dispatch(&orchestrator, &sink, text.as_str(), &mut owned).await {
            if tx.send(frame).await.is_err() {
                break;
            }
        }
    }

    cancel_owned(&orchestrator, owned).await;
    writer.abort();
}

/// Cancel what a closed connection left running. Nobody is left to read
/// its output.
async fn cancel_owned(orchestrator: &Orchestrator, owned: Vec<EntryId>) {
    for entry in owned {
        if orchestrator.cancel_entry(entry).await {
            info!(entry_id = entry, "cancelled invocation of closed connection");
        }
    }
}

/// Forget processes of this connection that have already exited.
async fn prune_finished(orchestrator: &Orchestrator, owned: &mut Vec<EntryId>) {
    let mut live = Vec::with_capacity(owned.len());
    for entry in owned.drain(..) {
        if orchestrator.is_active(entry).await {
            live.push(entry);
        }
    }
    *owned = live;
}

/// Handle one client message. Returns the frame to send back, if any;
/// invocation events reach the client through `sink`.
///
/// `owned` holds the registry ids of the processes this connection started
/// that are still running.
pub async fn dispatch(
    orchestrator: &Orchestrator,
    sink: &Arc<dyn EventSink>,
    text: &str,
    owned: &mut Vec<EntryId>,
) -> Option<ServerFrame> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "rejecting client message");
            return Some(ServerFrame::Reply(Reply::Rejected {
                message: format!("invalid message: {e}"),
            }));
        }
    };

    let reply = match message {
        ClientMessage::Invoke(request) => {
            prune_finished(orchestrator, owned).await;
            let token = request.correlation_token.clone();
            return match orchestrator.invoke(request, Arc::clone(sink)).await {
                Ok(handle) => {
                    owned.push(handle.entry_id());
                    None
                }
                Err(e) => {
                    warn!(correlation_token = %token, error = %e, "invocation rejected");
                    Some(ServerFrame::Event(OutboundEvent::new(
                        token,
                        CanonicalEvent::Error {
                            session_id: None,
                            message: e.to_string(),
                        },
                    )))
                }
            };
        }
        ClientMessage::Cancel { session_id } => Reply::CancelResult {
            cancelled: orchestrator.cancel(&session_id).await,
            session_id,
        },
        ClientMessage::Input { session_id, text } => {
            input_result(session_id.clone(), orchestrator.send(&session_id, &text).await)
        }
        ClientMessage::CloseInput { session_id } => {
            input_result(session_id.clone(), orchestrator.close_input(&session_id).await)
        }
    };
    Some(ServerFrame::Reply(reply))
}

fn input_result<E: std::fmt::Display>(session_id: String, result: Result<(), E>) -> Reply {
    match result {
        Ok(()) => Reply::InputResult {
            session_id,
            ok: true,
            error: None,
        },
        Err(e) => Reply::InputResult {
            session_id,
            ok: false,
            error: Some(e.to_string()),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
