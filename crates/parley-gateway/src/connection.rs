use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, trace, warn};

use parley_types::events::{Control, ErrorKind, InboundEnvelope, ServerEnvelope};

use crate::identity::{AuthFailure, Identity, IdentityVerifier};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::router::MessageRouter;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Per-connection lifecycle. Envelopes are only processed while `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unauthenticated,
    Authenticating,
    Active,
    Closing,
    Closed,
}

impl Phase {
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Unauthenticated, Phase::Authenticating)
                | (Phase::Authenticating, Phase::Active)
                | (Phase::Authenticating, Phase::Closed)
                | (Phase::Active, Phase::Closing)
                | (Phase::Closing, Phase::Closed)
        )
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    phase: Phase,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: Phase::Unauthenticated,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Move to `next` if the transition is legal. Illegal transitions are
    /// logged and leave the phase untouched.
    pub fn advance(&mut self, next: Phase) -> bool {
        if !self.phase.can_advance_to(next) {
            warn!("Ignoring illegal connection transition {:?} -> {:?}", self.phase, next);
            return false;
        }
        trace!("Connection {:?} -> {:?}", self.phase, next);
        self.phase = next;
        true
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// A transport that passed identity verification but is not yet registered.
#[derive(Debug)]
pub struct PendingConnection {
    lifecycle: Lifecycle,
    identity: Identity,
}

impl PendingConnection {
    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

/// Verify the upgrade token. On failure the connection goes straight to
/// `Closed` and is never registered.
pub fn authenticate(verifier: &dyn IdentityVerifier, token: &str) -> Result<PendingConnection, AuthFailure> {
    let mut lifecycle = Lifecycle::new();
    lifecycle.advance(Phase::Authenticating);

    match verifier.verify(token) {
        Ok(identity) => Ok(PendingConnection { lifecycle, identity }),
        Err(e) => {
            lifecycle.advance(Phase::Closed);
            warn!("WebSocket authentication failed: {}", e);
            Err(e)
        }
    }
}

/// Owns everything a connection handler needs; cheap to clone per upgrade.
#[derive(Clone)]
pub struct Gateway {
    router: MessageRouter,
    outbound_buffer: usize,
}

impl Gateway {
    pub fn new(router: MessageRouter, outbound_buffer: usize) -> Self {
        Self {
            router,
            outbound_buffer,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        self.router.registry()
    }

    /// Drive one authenticated WebSocket until it closes, errors, logs out or
    /// is evicted by the registry.
    pub async fn serve(&self, socket: WebSocket, pending: PendingConnection) {
        let PendingConnection { mut lifecycle, identity } = pending;
        let user_id = identity.user_id;

        let (handle, mut outbound_rx) = ConnectionHandle::new(self.outbound_buffer);
        self.registry().register(user_id, &handle).await;
        lifecycle.advance(Phase::Active);
        info!(
            "{} ({}) connected to gateway ({} connection(s), {} user(s) online)",
            identity.username,
            user_id,
            self.registry().connection_count(user_id).await,
            self.registry().online_users().await
        );

        let (mut sender, mut receiver) = socket.split();

        let pong_received = Arc::new(AtomicBool::new(true));
        let pong_flag_send = pong_received.clone();
        let pong_flag_recv = pong_received.clone();

        // Forward queued frames -> client, with heartbeat
        let evicted = handle.evicted().clone();
        let mut send_task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            let mut missed_heartbeats: u8 = 0;

            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Failed to encode outbound frame: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = evicted.cancelled() => {
                        warn!("Connection evicted by registry, closing");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    _ = heartbeat.tick() => {
                        if pong_flag_send.swap(false, Ordering::Acquire) {
                            missed_heartbeats = 0;
                        } else {
                            missed_heartbeats += 1;
                            if missed_heartbeats >= 2 {
                                warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                                break;
                            }
                        }
                        if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Read envelopes from client
        let router = self.router.clone();
        let recv_handle = handle.clone();
        let recv_identity = identity.clone();
        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = receiver.next().await {
                match msg {
                    Message::Text(text) => {
                        let flow = handle_frame(&router, &recv_identity, &recv_handle, text.as_str()).await;
                        if flow == Flow::Logout {
                            info!("{} ({}) logged out", recv_identity.username, recv_identity.user_id);
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        reply(
                            &recv_handle,
                            ServerEnvelope::error(ErrorKind::MalformedEnvelope, "binary frames are not supported"),
                        );
                    }
                    Message::Pong(_) => {
                        pong_flag_recv.store(true, Ordering::Release);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        // Wait for either task to finish
        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        lifecycle.advance(Phase::Closing);
        self.registry().unregister(user_id, handle.id()).await;
        lifecycle.advance(Phase::Closed);
        info!("{} ({}) disconnected from gateway", identity.username, user_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Logout,
}

/// Parse and dispatch one text frame. Failures are reported to this
/// connection only and never end it.
async fn handle_frame(
    router: &MessageRouter,
    identity: &Identity,
    connection: &ConnectionHandle,
    text: &str,
) -> Flow {
    let envelope = match InboundEnvelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(
                "{} ({}) bad envelope: {} -- raw: {}",
                identity.username,
                identity.user_id,
                e,
                truncate(text, 200)
            );
            reply(connection, ServerEnvelope::error(ErrorKind::MalformedEnvelope, e.to_string()));
            return Flow::Continue;
        }
    };

    match envelope {
        InboundEnvelope::Heartbeat => {
            reply(connection, ServerEnvelope::Control(Control::Pong));
            Flow::Continue
        }
        InboundEnvelope::Logout => Flow::Logout,
        InboundEnvelope::Send(send) => {
            match router.route(identity.user_id, send).await {
                Ok(delivery) => debug!(
                    "{} ({}) -> message {} in conversation {} ({} sender / {} recipient connections)",
                    identity.username,
                    identity.user_id,
                    delivery.push.id,
                    delivery.push.conversation_id,
                    delivery.sender_connections,
                    delivery.recipient_connections
                ),
                Err(e) => {
                    warn!("{} ({}) send rejected: {}", identity.username, identity.user_id, e);
                    reply(connection, e.to_envelope());
                }
            }
            Flow::Continue
        }
    }
}

fn reply(connection: &ConnectionHandle, envelope: ServerEnvelope) {
    if !connection.push(envelope) {
        warn!("Dropping reply for connection {}: outbound queue full", connection.id());
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
