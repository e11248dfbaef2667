//! Per-connection protocol handling.
//!
//! Each connection is a small state machine:
//!
//! ```text
//! Connecting -> Authenticated -> InSession -> (closed)
//!                    ^               |
//!                    +---- leave ----+
//! ```
//!
//! `InSession` is re-entrant: a peer may leave and join again without
//! dropping the WebSocket. Every operation except keep-alive is gated by the
//! rate limiter before any registry or session work happens. Explicit leave,
//! connection drop, and reaper eviction all converge on the same leave path.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use signal_protocol::{ClientMessage, ErrorCode, ServerMessage};

use crate::actors::SessionHandle;
use crate::ratelimit::EndpointCategory;

use super::SignalHub;

/// Outbound queue size per connection.
const OUTBOUND_CHANNEL_BUFFER: usize = 200;

/// Connection lifecycle state.
enum ConnState {
    /// Waiting for the credential.
    Connecting,
    /// Credential accepted, not in a session.
    Authenticated { identity: String },
    /// Joined a session as `peer_identity`.
    InSession {
        identity: String,
        peer_identity: String,
        session: SessionHandle,
    },
}

/// Drive one WebSocket connection to completion.
pub(super) async fn handle_connection(
    hub: Arc<SignalHub>,
    stream: TcpStream,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), tungstenite::Error> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let connection_id = Uuid::new_v4().to_string();
    let last_seen = hub.register_connection(&connection_id, cancel.clone());

    debug!(
        target: "hub.connection",
        connection_id = %connection_id,
        peer_addr = %peer_addr,
        "Connection established"
    );

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CHANNEL_BUFFER);

    // Writer task: drains the outbound queue into the socket. Cancelling the
    // connection token stops it, which in turn fails pending sends upstream.
    let writer_token = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                () = writer_token.cancelled() => break,
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { break };
                    let Ok(json) = msg.to_json() else { continue };
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        writer_token.cancel();
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut state = ConnState::Connecting;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(
                    target: "hub.connection",
                    connection_id = %connection_id,
                    "Connection cancelled"
                );
                break;
            }

            frame = ws_receiver.next() => {
                match frame {
                    None => break,
                    Some(Err(e)) => {
                        debug!(
                            target: "hub.connection",
                            connection_id = %connection_id,
                            error = %e,
                            "WebSocket read error"
                        );
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_seen.store(hub.now_ms(), Ordering::Relaxed);
                        if handle_frame(&hub, &connection_id, &out_tx, &mut state, &text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen.store(hub.now_ms(), Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Network failure, eviction, and client close all land here: the peer
    // leaves its session and the rest of the session sees a normal departure.
    if let ConnState::InSession {
        peer_identity,
        session,
        ..
    } = state
    {
        match session
            .leave(peer_identity.clone(), Some(connection_id.clone()))
            .await
        {
            Ok(removed) => {
                if removed {
                    debug!(
                        target: "hub.connection",
                        connection_id = %connection_id,
                        peer_identity = %peer_identity,
                        "Peer removed on disconnect"
                    );
                }
            }
            Err(e) => {
                debug!(
                    target: "hub.connection",
                    connection_id = %connection_id,
                    error = %e,
                    "Leave on disconnect failed (session gone)"
                );
            }
        }
    }

    cancel.cancel();
    let _ = writer.await;
    hub.unregister_connection(&connection_id);

    info!(
        target: "hub.connection",
        connection_id = %connection_id,
        "Connection closed"
    );
    Ok(())
}

/// Push a message to this connection. Returns true when the connection is
/// gone and the caller should stop.
async fn send(out_tx: &mpsc::Sender<ServerMessage>, message: ServerMessage) -> bool {
    out_tx.send(message).await.is_err()
}

/// Admission gate. Returns the rejection to push when the caller is over
/// budget; the operation itself must not run in that case.
fn gate(hub: &SignalHub, identity: &str, category: EndpointCategory) -> Option<ServerMessage> {
    let decision = hub.limiter.check(identity, category);
    if decision.allowed {
        None
    } else {
        hub.metrics.request_rate_limited(category.as_str());
        Some(ServerMessage::RateLimited {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
        })
    }
}

/// Handle one inbound frame. Returns true if the connection should close.
async fn handle_frame(
    hub: &SignalHub,
    connection_id: &str,
    out_tx: &mpsc::Sender<ServerMessage>,
    state: &mut ConnState,
    text: &str,
) -> bool {
    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(
                target: "hub.connection",
                connection_id = %connection_id,
                error = %e,
                "Malformed frame"
            );
            return send(
                out_tx,
                ServerMessage::error(ErrorCode::MalformedMessage, "Could not parse message"),
            )
            .await;
        }
    };

    match message {
        // Keep-alive is exempt from admission control by policy.
        ClientMessage::Ping { timestamp } => send(out_tx, ServerMessage::Pong { timestamp }).await,

        ClientMessage::Authenticate { token } => {
            handle_authenticate(hub, connection_id, out_tx, state, &token).await
        }

        ClientMessage::Join {
            session_id,
            identity: peer_identity,
            relay_capable,
        } => {
            handle_join(
                hub,
                connection_id,
                out_tx,
                state,
                session_id,
                peer_identity,
                relay_capable,
            )
            .await
        }

        ClientMessage::Leave => handle_leave(hub, connection_id, out_tx, state).await,

        ClientMessage::Signal { target, payload } => match state {
            ConnState::InSession {
                identity,
                peer_identity,
                session,
            } => {
                if let Some(rejection) = gate(hub, identity, EndpointCategory::Signal) {
                    return send(out_tx, rejection).await;
                }
                if let Err(e) = session
                    .relay_signal(peer_identity.clone(), target, payload)
                    .await
                {
                    debug!(
                        target: "hub.connection",
                        connection_id = %connection_id,
                        error = %e,
                        "Signal relay failed (session gone)"
                    );
                }
                false
            }
            _ => {
                send(
                    out_tx,
                    ServerMessage::error(ErrorCode::NotInSession, "Join a session first"),
                )
                .await
            }
        },

        ClientMessage::ReportLatency { peer, millis } => match state {
            ConnState::InSession {
                identity,
                peer_identity,
                session,
            } => {
                if let Some(rejection) = gate(hub, identity, EndpointCategory::Default) {
                    return send(out_tx, rejection).await;
                }
                let _ = session
                    .report_latency(peer_identity.clone(), peer, millis)
                    .await;
                false
            }
            _ => {
                send(
                    out_tx,
                    ServerMessage::error(ErrorCode::NotInSession, "Join a session first"),
                )
                .await
            }
        },
    }
}

async fn handle_authenticate(
    hub: &SignalHub,
    connection_id: &str,
    out_tx: &mpsc::Sender<ServerMessage>,
    state: &mut ConnState,
    token: &str,
) -> bool {
    match state {
        ConnState::Connecting => {
            // No verified identity yet: the anonymous bucket carries the cost.
            if let Some(rejection) = gate(hub, "", EndpointCategory::SessionControl) {
                return send(out_tx, rejection).await;
            }

            match hub.verifier.verify(token) {
                Ok(identity) => {
                    info!(
                        target: "hub.connection",
                        connection_id = %connection_id,
                        identity = %identity,
                        "Connection authenticated"
                    );
                    *state = ConnState::Authenticated {
                        identity: identity.clone(),
                    };
                    send(out_tx, ServerMessage::Authenticated { identity }).await
                }
                Err(e) => {
                    warn!(
                        target: "hub.connection",
                        connection_id = %connection_id,
                        "Credential rejected"
                    );
                    let _ = send(
                        out_tx,
                        ServerMessage::error(e.error_code(), e.client_message()),
                    )
                    .await;
                    true
                }
            }
        }
        _ => {
            send(
                out_tx,
                ServerMessage::error(ErrorCode::MalformedMessage, "Already authenticated"),
            )
            .await
        }
    }
}

async fn handle_join(
    hub: &SignalHub,
    connection_id: &str,
    out_tx: &mpsc::Sender<ServerMessage>,
    state: &mut ConnState,
    session_id: String,
    peer_identity: String,
    relay_capable: bool,
) -> bool {
    match state {
        ConnState::Connecting => {
            send(
                out_tx,
                ServerMessage::error(ErrorCode::NotAuthenticated, "Authenticate first"),
            )
            .await
        }
        ConnState::InSession { .. } => {
            send(
                out_tx,
                ServerMessage::error(ErrorCode::AlreadyInSession, "Leave the current session first"),
            )
            .await
        }
        ConnState::Authenticated { identity } => {
            let auth_identity = identity.clone();
            if let Some(rejection) = gate(hub, &auth_identity, EndpointCategory::SessionControl) {
                return send(out_tx, rejection).await;
            }

            match hub
                .registry
                .join(
                    session_id.clone(),
                    peer_identity.clone(),
                    relay_capable,
                    connection_id.to_string(),
                    out_tx.clone(),
                )
                .await
            {
                Ok((accepted, session)) => {
                    *state = ConnState::InSession {
                        identity: auth_identity,
                        peer_identity,
                        session,
                    };
                    send(
                        out_tx,
                        ServerMessage::Joined {
                            session_id,
                            peers: accepted.peers,
                            strategy: accepted.strategy,
                            relays: accepted.relays,
                        },
                    )
                    .await
                }
                Err(e) => {
                    warn!(
                        target: "hub.connection",
                        connection_id = %connection_id,
                        session_id = %session_id,
                        error = %e,
                        "Join rejected"
                    );
                    send(
                        out_tx,
                        ServerMessage::error(e.error_code(), e.client_message()),
                    )
                    .await
                }
            }
        }
    }
}

async fn handle_leave(
    hub: &SignalHub,
    connection_id: &str,
    out_tx: &mpsc::Sender<ServerMessage>,
    state: &mut ConnState,
) -> bool {
    match state {
        ConnState::InSession {
            identity,
            peer_identity,
            session,
        } => {
            let auth_identity = identity.clone();
            let peer_identity = peer_identity.clone();
            let session = session.clone();

            if let Some(rejection) = gate(hub, &auth_identity, EndpointCategory::SessionControl) {
                return send(out_tx, rejection).await;
            }

            let _ = session
                .leave(peer_identity, Some(connection_id.to_string()))
                .await;
            *state = ConnState::Authenticated {
                identity: auth_identity,
            };
            false
        }
        _ => {
            send(
                out_tx,
                ServerMessage::error(ErrorCode::NotInSession, "Not in a session"),
            )
            .await
        }
    }
}
