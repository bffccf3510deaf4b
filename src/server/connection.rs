//! Per-connection lifecycle: handshake, sibling workers, heartbeat.
//!
//! Each accepted WebSocket gets two sibling workers sharing a cancellation
//! token: the inbound worker decodes frames and dispatches them to the
//! session, the outbound worker serializes queued frames and drives the
//! heartbeat. Either worker failing cancels the other. Closing a connection
//! never destroys its session — reconnects rebind.

use crate::error::GatewayError;
use crate::protocol::{self, Payload};
use crate::server::AppState;
use crate::session::Session;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decrements the connection gauge when the connection ends.
struct ConnectionGuard(Arc<std::sync::atomic::AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drive one accepted WebSocket until either side closes.
pub(crate) async fn handle_socket(
    mut socket: WebSocket,
    requested_id: Option<String>,
    state: AppState,
) {
    let server_config = &state.config.server;
    let previous = state.connections.fetch_add(1, Ordering::SeqCst);
    let _guard = ConnectionGuard(Arc::clone(&state.connections));

    if previous >= server_config.max_connections {
        // Refuse: one classified error frame, then close.
        let err = GatewayError::Capacity(format!(
            "connection cap of {} reached",
            server_config.max_connections
        ));
        warn!("{err}");
        let refused_id = requested_id.unwrap_or_else(|| "unassigned".to_owned());
        let payload = Payload::Error(protocol::ErrorPayload::from(&err));
        if let Ok(text) = protocol::encode(&refused_id, &payload) {
            let _ = socket.send(Message::Text(text.into())).await;
        }
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    let (outbound_tx, outbound_rx) = mpsc::channel(server_config.outbound_queue);
    let (session, rebound) = state.registry.bind(requested_id, outbound_tx).await;
    let session_id = session.id().to_owned();
    info!(session_id = %session_id, rebound, "connection established");

    // Child of the server-wide shutdown token: either worker failing or a
    // server shutdown unwinds both siblings.
    let cancel = state.shutdown.child_token();
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let (sink, stream) = socket.split();
    let outbound = tokio::spawn(outbound_worker(
        sink,
        outbound_rx,
        session_id.clone(),
        cancel.clone(),
        Duration::from_secs(server_config.ping_period_secs),
        Duration::from_secs(server_config.pong_wait_secs),
        Arc::clone(&last_pong),
    ));

    inbound_worker(stream, &session, &cancel, &last_pong).await;

    cancel.cancel();
    let _ = outbound.await;
    info!(session_id = %session_id, "connection closed");
}

/// Read frames, decode, dispatch to the session.
async fn inbound_worker(
    mut stream: SplitStream<WebSocket>,
    session: &Arc<Session>,
    cancel: &CancellationToken,
    last_pong: &Arc<Mutex<Instant>>,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => message,
        };
        let Some(Ok(message)) = message else {
            // Client closed or the read failed; signal the sibling.
            break;
        };
        match message {
            Message::Text(text) => match protocol::decode(text.as_str()) {
                Ok(frame) => {
                    if frame.session_id != session.id() {
                        debug!(
                            frame_session = %frame.session_id,
                            bound_session = %session.id(),
                            "frame session_id differs from bound session"
                        );
                    }
                    session.handle_frame(frame).await;
                }
                Err(err) => {
                    // Malformed frames are surfaced and the session state is
                    // left untouched.
                    session.report_error(&err).await;
                }
            },
            Message::Binary(_) => {
                let err = GatewayError::Protocol(
                    "binary frames are not negotiated on this channel".to_owned(),
                );
                session.report_error(&err).await;
            }
            Message::Pong(_) => {
                if let Ok(mut at) = last_pong.lock() {
                    *at = Instant::now();
                }
            }
            // The websocket layer answers pings for us.
            Message::Ping(_) => {}
            Message::Close(_) => break,
        }
    }
    cancel.cancel();
}

/// Serialize queued frames, send pings, enforce the pong deadline.
async fn outbound_worker(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Payload>,
    session_id: String,
    cancel: CancellationToken,
    ping_period: Duration,
    pong_wait: Duration,
    last_pong: Arc<Mutex<Instant>>,
) {
    let mut ping = tokio::time::interval(ping_period);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the deadline starts fresh.
    ping.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            frame = outbound_rx.recv() => {
                let Some(payload) = frame else {
                    // Session torn down or rebound to a newer connection.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                match protocol::encode(&session_id, &payload) {
                    Ok(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(session_id = %session_id, "dropping unencodable frame: {err}"),
                }
            }
            _ = ping.tick() => {
                let deadline_missed = last_pong
                    .lock()
                    .map(|at| at.elapsed() > pong_wait)
                    .unwrap_or(false);
                if deadline_missed {
                    warn!(session_id = %session_id, "pong deadline missed, closing connection");
                    break;
                }
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    cancel.cancel();
}
