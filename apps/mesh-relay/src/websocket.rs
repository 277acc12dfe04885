use std::borrow::Cow;
use std::collections::{HashMap, HashSet};

use anyhow::{bail, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use mesh_protocol::{
    validate_identity, ClientMessage, RelayErrorCode, ServerMessage, SignalEnvelope, SignalKind,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::state::{PeerHandle, RelayState};

/// WebSocket upgrade handler for `/ws?id=<identity>`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<RelayState>,
) -> Response {
    let requested = params.get("id").cloned();
    ws.on_upgrade(move |socket| handle_socket(socket, requested, state))
}

/// Per-connection context for message handling.
struct Connection<'a> {
    state: &'a RelayState,
    handle: &'a PeerHandle,
    peer_id: &'a str,
    tx: &'a mpsc::UnboundedSender<ServerMessage>,
    rooms: HashSet<String>,
}

async fn handle_socket(socket: WebSocket, requested: Option<String>, state: RelayState) {
    let peer_id = match admit(requested) {
        Ok(peer_id) => peer_id,
        Err((code, message)) => return reject(socket, code, message).await,
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let handle = match state.register(&peer_id, tx.clone()) {
        Ok(handle) => handle,
        Err(code) => {
            let message = format!("identity {peer_id} is already connected");
            return reject(socket, code, message).await;
        }
    };
    info!(target: "relay", peer = %peer_id, connection = handle.connection, "peer connected");

    let (mut sender, mut receiver) = socket.split();
    let writer_peer = peer_id.clone();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message.to_text() {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(target: "relay", peer = %writer_peer, error = %err, "unencodable message dropped"),
            }
        }
        let _ = sender.close().await;
        debug!(target: "relay", peer = %writer_peer, "writer ended");
    });

    let _ = tx.send(ServerMessage::IdentityOpen {
        peer_id: peer_id.clone(),
    });

    let mut connection = Connection {
        state: &state,
        handle: &handle,
        peer_id: &peer_id,
        tx: &tx,
        rooms: HashSet::new(),
    };
    loop {
        tokio::select! {
            frame = receiver.next() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(Message::Text(text)) => connection.on_text(&text),
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => connection.on_text(&text),
                        Err(_) => connection.reply_error(RelayErrorCode::BadMessage, "binary frames must be UTF-8 JSON"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(target: "relay", peer = %peer_id, error = %err, "websocket error");
                        break;
                    }
                }
            }
            _ = handle.evict.notified() => break,
        }
    }

    // Clean up on disconnect
    for room_id in std::mem::take(&mut connection.rooms) {
        state.leave_room(&room_id, &peer_id);
    }
    state.release(&peer_id, handle.connection);
    info!(target: "relay", peer = %peer_id, "peer disconnected");
}

fn admit(requested: Option<String>) -> std::result::Result<String, (RelayErrorCode, String)> {
    let Some(peer_id) = requested.filter(|id| !id.is_empty()) else {
        return Err((
            RelayErrorCode::MissingId,
            "the id query parameter is required".to_string(),
        ));
    };
    validate_identity(&peer_id).map_err(|err| (RelayErrorCode::InvalidId, err.to_string()))?;
    Ok(peer_id)
}

/// Sends the error, then a close frame.
async fn reject(mut socket: WebSocket, code: RelayErrorCode, message: String) {
    warn!(target: "relay", ?code, reason = %message, "connection refused");
    if let Ok(text) = ServerMessage::error(code, message).to_text() {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: Cow::from("identity refused"),
        })))
        .await;
}

impl Connection<'_> {
    fn on_text(&mut self, text: &str) {
        let message = match ClientMessage::from_text(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(target: "relay", peer = %self.peer_id, error = %err, "unparseable client message");
                self.reply_error(RelayErrorCode::BadMessage, format!("invalid message format: {err}"));
                return;
            }
        };
        if let Err(err) = self.handle_client_message(message) {
            self.reply_error(RelayErrorCode::BadMessage, err.to_string());
        }
    }

    fn handle_client_message(&mut self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::OpenSession(envelope) => self.forward(SignalKind::OpenSession, envelope),
            ClientMessage::Signal(envelope) => self.forward(SignalKind::Signal, envelope),
            ClientMessage::RoomJoin { room_id, metadata } => {
                if room_id.is_empty() {
                    bail!("room id must not be empty");
                }
                self.state.join_room(&room_id, self.peer_id, metadata);
                self.rooms.insert(room_id);
            }
            ClientMessage::RoomLeave { room_id } => {
                self.rooms.remove(&room_id);
                self.state.leave_room(&room_id, self.peer_id);
            }
            ClientMessage::Ping => {
                self.state.touch(self.handle);
                let _ = self.tx.send(ServerMessage::Pong);
            }
        }
        Ok(())
    }

    /// Stamps the sender identity and hands the envelope to its target.
    fn forward(&self, kind: SignalKind, mut envelope: SignalEnvelope) {
        envelope.source = Some(self.peer_id.to_string());
        let target = envelope.target.clone();
        let session_id = envelope.session_id.clone();
        let message = match kind {
            SignalKind::OpenSession => ServerMessage::OpenSession(envelope),
            SignalKind::Signal => ServerMessage::Signal(envelope),
        };
        if !self.state.route(&target, message) {
            debug!(target: "relay", peer = %self.peer_id, to = %target, session = %session_id, "unknown target");
            let _ = self.tx.send(ServerMessage::Error {
                code: RelayErrorCode::UnknownTarget,
                message: format!("{target} is not connected"),
                session_id: Some(session_id),
            });
        }
    }

    fn reply_error(&self, code: RelayErrorCode, message: impl Into<String>) {
        let _ = self.tx.send(ServerMessage::error(code, message));
    }
}
