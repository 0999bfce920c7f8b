//! WebSocket transport: admission, session wiring, reader/writer split.
//!
//! Each accepted socket gets three tasks: the reader (this handler's own
//! future), a writer draining the session's outbound queue, and a per-session
//! scheduler. All three stop when the session's cancellation signal fires.
use crate::AppState;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use skiff_common::unix_millis;
use skiff_stream::{AdmissionPermit, SessionHandle, SessionReceivers, scheduler};
use skiff_wire::{ClientMessage, ServerMessage, decode_client, encode_server};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const SERVER_FEATURES: &[&str] = &["delta", "fields", "filters"];

/// `GET /ws`: admit-or-reject before the upgrade so a full server answers
/// with plain HTTP 503 instead of an opened-then-closed socket. Admission
/// reserves the capacity slot up front; the permit travels with the upgrade
/// so a racing request cannot claim the same slot.
pub async fn ws_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let Some(permit) = state.manager.try_admit() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "session limit reached").into_response();
    };
    upgrade.on_upgrade(move |socket| handle_session(state, permit, socket))
}

async fn handle_session(state: AppState, permit: AdmissionPermit, socket: WebSocket) {
    let (session, receivers) = SessionHandle::new(state.config.outbound_queue_capacity);
    state.manager.register(session.clone(), permit);
    let session_id = session.id();
    tracing::info!(session = %session_id, "session opened");

    let (sink, stream) = socket.split();
    let SessionReceivers { outbound, cancel } = receivers;
    let writer = tokio::spawn(run_writer(
        sink,
        outbound,
        cancel,
        state.config.keep_alive(),
    ));
    let scheduler = tokio::spawn(scheduler::run_session_scheduler(
        state.store.clone(),
        session.clone(),
        state.config.scheduler_tick(),
        session.cancelled(),
    ));

    run_reader(&session, stream, state.config.read_deadline()).await;

    state.manager.remove(session_id);
    let _ = writer.await;
    let _ = scheduler.await;
    tracing::info!(session = %session_id, "session closed");
}

/// Consumes inbound frames until close, error, deadline, or cancellation.
/// Any inbound frame refreshes the read deadline.
async fn run_reader(
    session: &Arc<SessionHandle>,
    mut stream: SplitStream<WebSocket>,
    read_deadline: Duration,
) {
    let mut cancel = session.cancelled();
    loop {
        let frame = tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
                continue;
            }
            frame = tokio::time::timeout(read_deadline, stream.next()) => frame,
        };
        match frame {
            Ok(Some(Ok(Message::Text(text)))) => handle_control(session, text.as_str()),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(Some(Ok(Message::Binary(_)))) => {
                metrics::counter!("skiff_ws_malformed_total").increment(1);
                tracing::warn!(session = %session.id(), "binary frame on text protocol");
            }
            Ok(Some(Ok(Message::Close(_))) | Some(Err(_)) | None) => break,
            Err(_) => {
                tracing::debug!(session = %session.id(), "read deadline expired");
                break;
            }
        }
    }
    session.close();
}

/// Dispatches one inbound control message. Malformed input is counted and
/// dropped; it never terminates the session.
fn handle_control(session: &Arc<SessionHandle>, text: &str) {
    let message = match decode_client(text) {
        Ok(message) => message,
        Err(err) => {
            metrics::counter!("skiff_ws_malformed_total").increment(1);
            tracing::warn!(session = %session.id(), error = %err, "dropping malformed message");
            return;
        }
    };
    let reply = match message {
        ClientMessage::Connect {
            client,
            capabilities,
        } => {
            if !session.connect(client, capabilities) {
                tracing::debug!(session = %session.id(), "repeated connect ignored");
            }
            ServerMessage::Connected {
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                features: SERVER_FEATURES.iter().map(|f| f.to_string()).collect(),
            }
        }
        ClientMessage::Subscribe { channels } => ServerMessage::Subscribed {
            channels: session.subscribe(channels),
        },
        ClientMessage::Unsubscribe { channels } => {
            session.unsubscribe(&channels);
            return;
        }
        ClientMessage::Ping => ServerMessage::Pong {
            timestamp: unix_millis(),
        },
    };
    if let Err(err) = session.enqueue(reply) {
        tracing::warn!(session = %session.id(), error = %err, "ack dropped");
    }
}

/// Drains the outbound queue onto the socket and emits protocol-level pings
/// on the keep-alive period. Any write failure ends the session.
async fn run_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut cancel: watch::Receiver<bool>,
    keep_alive: Duration,
) {
    let mut ticker = tokio::time::interval(keep_alive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.reset();
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let text = match encode_server(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::error!(error = %err, "unencodable server message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
