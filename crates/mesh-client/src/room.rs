//! Full-mesh room membership.
//!
//! Every room runs one actor task. Relay notifications, inbound sessions and
//! per-member call events all funnel into it, so membership changes are
//! serialized. Fan-out operations read the member map concurrently.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use mesh_peer::{DataFrame, MediaStream, MediaTrack};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn, Instrument, Span};

use crate::call::{Call, CallEnvelope, CallEvent, CallRole, SessionContext};
use crate::error::MeshError;
use crate::router::RoomPort;

pub(crate) enum RoomInput {
    Join {
        peer_id: String,
        metadata: Option<String>,
    },
    Leave {
        peer_id: String,
    },
    Incoming(Call),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// A member's session opened.
    Join {
        peer_id: String,
        metadata: Option<String>,
    },
    Leave {
        peer_id: String,
    },
    Message {
        peer_id: String,
        data: DataFrame,
    },
    Stream {
        peer_id: String,
        stream: MediaStream,
        metadata: Option<String>,
    },
    RemoveStream {
        peer_id: String,
        stream: MediaStream,
        metadata: Option<String>,
    },
    Track {
        peer_id: String,
        track: MediaTrack,
        stream_id: String,
        metadata: Option<String>,
    },
    RemoveTrack {
        peer_id: String,
        track: MediaTrack,
        stream_id: String,
        metadata: Option<String>,
    },
    Error {
        peer_id: String,
        error: MeshError,
    },
    /// The room was left; no events follow.
    Close,
}

/// Per-member outcome of a fan-out operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, MeshError)>,
}

impl FanOut {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone)]
struct Member {
    call: Call,
    metadata: Option<String>,
}

type Members = Arc<DashMap<String, Member>>;

#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    room_id: String,
    members: Members,
    context: SessionContext,
    inputs: mpsc::UnboundedSender<RoomInput>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<RoomEvent>>,
    /// Shared with the actor; once set, queued inputs are discarded.
    left: Arc<AtomicBool>,
    span: Span,
}

impl Room {
    /// Registers the room locally, then announces presence to the relay.
    pub(crate) fn join(
        context: &SessionContext,
        room_id: &str,
        metadata: Option<String>,
    ) -> Result<Room, MeshError> {
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (sink, envelopes) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let span = tracing::debug_span!(
            target: "mesh::room",
            parent: &context.span,
            "room",
            room = %room_id
        );
        let members: Members = Arc::new(DashMap::new());
        let left = Arc::new(AtomicBool::new(false));
        let room = Room {
            inner: Arc::new(RoomInner {
                room_id: room_id.to_string(),
                members: Arc::clone(&members),
                context: context.clone(),
                inputs: inputs_tx.clone(),
                events: tokio::sync::Mutex::new(events_rx),
                left: Arc::clone(&left),
                span: span.clone(),
            }),
        };

        let port = RoomPort {
            inputs: inputs_tx,
            sink: sink.clone(),
            room: room.clone(),
        };
        if !context.router.add_room(room_id, port) {
            return Err(MeshError::AlreadyJoined(room_id.to_string()));
        }
        if let Err(err) = context.signaling.join(room_id, metadata.clone()) {
            context.router.remove_room(room_id);
            return Err(err.into());
        }

        let actor = RoomActor {
            room_id: room_id.to_string(),
            local_id: context.signaling.id(),
            metadata,
            members,
            context: context.clone(),
            sink,
            events: events_tx,
            left,
        };
        tokio::spawn(actor.run(inputs_rx, envelopes).instrument(span.clone()));
        debug!(target: "mesh::room", parent: &span, "joined");

        Ok(room)
    }

    pub fn id(&self) -> &str {
        &self.inner.room_id
    }

    /// Identities with a session in this room, opened or not.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .inner
            .members
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn member(&self, peer_id: &str) -> Option<Call> {
        self.inner
            .members
            .get(peer_id)
            .map(|entry| entry.call.clone())
    }

    pub fn member_metadata(&self, peer_id: &str) -> Option<String> {
        self.inner
            .members
            .get(peer_id)
            .and_then(|entry| entry.metadata.clone())
    }

    pub fn is_left(&self) -> bool {
        self.inner.left.load(Ordering::SeqCst)
    }

    pub async fn recv(&self) -> Option<RoomEvent> {
        self.inner.events.lock().await.recv().await
    }

    /// Leaves the room and closes every member session. Idempotent.
    ///
    /// Leaving is terminal: membership notifications still queued for the
    /// actor are dropped and the only event that follows is `Close`.
    pub fn leave(&self) {
        if self.inner.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        inner.context.router.remove_room(&inner.room_id);
        if let Err(err) = inner.context.signaling.leave(&inner.room_id) {
            debug!(target: "mesh::room", parent: &inner.span, error = %err, "relay leave not sent");
        }
        // Emptied before closing so the sessions' own close events match no
        // member and are not re-emitted as leaves.
        let mut calls = Vec::new();
        inner.members.retain(|_, member| {
            calls.push(member.call.clone());
            false
        });
        for call in calls {
            call.close();
        }
        let _ = inner.inputs.send(RoomInput::Shutdown);
        debug!(target: "mesh::room", parent: &inner.span, "left");
    }

    /// Sends to `targets`, or to every member when `targets` is `None`.
    pub async fn send(&self, data: impl Into<DataFrame>, targets: Option<&[String]>) -> FanOut {
        let frame = data.into();
        let frame = &frame;
        self.fan_out(targets, move |call| {
            let frame = frame.clone();
            async move { call.send(frame).await }
        })
        .await
    }

    pub async fn add_stream(
        &self,
        stream: &MediaStream,
        metadata: Option<String>,
        targets: Option<&[String]>,
    ) -> FanOut {
        let metadata = &metadata;
        self.fan_out(targets, move |call| {
            let stream = stream.clone();
            let metadata = metadata.clone();
            async move { call.add_stream(&stream, metadata).await }
        })
        .await
    }

    pub async fn remove_stream(&self, stream: &MediaStream, targets: Option<&[String]>) -> FanOut {
        self.fan_out(targets, move |call| {
            let stream = stream.clone();
            async move { call.remove_stream(&stream).await }
        })
        .await
    }

    pub async fn add_track(
        &self,
        track: &MediaTrack,
        stream: &MediaStream,
        targets: Option<&[String]>,
    ) -> FanOut {
        self.fan_out(targets, move |call| {
            let track = track.clone();
            let stream = stream.clone();
            async move { call.add_track(&track, &stream).await }
        })
        .await
    }

    pub async fn remove_track(&self, track: &MediaTrack, targets: Option<&[String]>) -> FanOut {
        self.fan_out(targets, move |call| {
            let track = track.clone();
            async move { call.remove_track(&track).await }
        })
        .await
    }

    async fn fan_out<F, Fut>(&self, targets: Option<&[String]>, op: F) -> FanOut
    where
        F: Fn(Call) -> Fut,
        Fut: Future<Output = Result<(), MeshError>>,
    {
        let mut report = FanOut::default();
        let calls: Vec<Call> = match targets {
            None => self
                .inner
                .members
                .iter()
                .map(|entry| entry.call.clone())
                .collect(),
            Some(targets) => targets
                .iter()
                .filter_map(|peer_id| match self.member(peer_id) {
                    Some(call) => Some(call),
                    None => {
                        report
                            .failed
                            .push((peer_id.clone(), MeshError::UnknownMember(peer_id.clone())));
                        None
                    }
                })
                .collect(),
        };
        for call in calls {
            let peer_id = call.peer_id().to_string();
            match op(call).await {
                Ok(()) => report.delivered.push(peer_id),
                Err(err) => {
                    trace!(target: "mesh::room", parent: &self.inner.span, peer = %peer_id, error = %err, "fan-out miss");
                    report.failed.push((peer_id, err));
                }
            }
        }
        report
    }
}

struct RoomActor {
    room_id: String,
    local_id: String,
    metadata: Option<String>,
    members: Members,
    context: SessionContext,
    sink: mpsc::UnboundedSender<CallEnvelope>,
    events: mpsc::UnboundedSender<RoomEvent>,
    left: Arc<AtomicBool>,
}

impl RoomActor {
    async fn run(
        self,
        mut inputs: mpsc::UnboundedReceiver<RoomInput>,
        mut envelopes: mpsc::UnboundedReceiver<CallEnvelope>,
    ) {
        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(RoomInput::Shutdown) | None => break,
                    Some(input) if self.is_left() => self.discard(input),
                    Some(RoomInput::Join { peer_id, metadata }) => self.on_join(peer_id, metadata),
                    Some(RoomInput::Leave { peer_id }) => self.on_leave(peer_id),
                    Some(RoomInput::Incoming(call)) => self.adopt(call),
                },
                Some(envelope) = envelopes.recv() => self.on_call_event(envelope),
            }
        }
        self.shutdown();
    }

    fn is_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    fn discard(&self, input: RoomInput) {
        match input {
            RoomInput::Incoming(call) => {
                debug!(target: "mesh::room", peer = %call.peer_id(), session = %call.session_id(), "session after leave refused");
                call.close();
            }
            RoomInput::Join { peer_id, .. } | RoomInput::Leave { peer_id } => {
                trace!(target: "mesh::room", peer = %peer_id, "notification after leave dropped");
            }
            RoomInput::Shutdown => {}
        }
    }

    /// Undoes an insert that raced with `Room::leave`. Returns true when the
    /// member was withdrawn.
    fn withdraw_if_left(&self, peer_id: &str, call: &Call) -> bool {
        if !self.is_left() {
            return false;
        }
        self.members
            .remove_if(peer_id, |_, member| member.call.session_id() == call.session_id());
        call.close();
        true
    }

    fn on_join(&self, peer_id: String, metadata: Option<String>) {
        if peer_id == self.local_id {
            return;
        }
        if self.members.contains_key(&peer_id) {
            debug!(target: "mesh::room", peer = %peer_id, "duplicate join ignored");
            return;
        }
        let call = Call::outgoing(
            &self.context,
            &peer_id,
            self.metadata.clone(),
            Some(self.room_id.clone()),
            self.sink.clone(),
        );
        debug!(target: "mesh::room", peer = %peer_id, session = %call.session_id(), "dialing member");
        self.members.insert(
            peer_id.clone(),
            Member {
                call: call.clone(),
                metadata,
            },
        );
        self.withdraw_if_left(&peer_id, &call);
    }

    fn on_leave(&self, peer_id: String) {
        if let Some((_, member)) = self.members.remove(&peer_id) {
            debug!(target: "mesh::room", peer = %peer_id, "member left");
            member.call.close();
            self.emit(RoomEvent::Leave { peer_id });
        }
    }

    /// Takes over a session the remote member opened. When a session with the
    /// same peer already exists, an open caller session is kept; a callee
    /// session is replaced since the remote started over; two unopened caller
    /// attempts resolve to the one dialed by the smaller identity.
    fn adopt(&self, call: Call) {
        let peer_id = call.peer_id().to_string();
        if peer_id == self.local_id {
            call.close();
            return;
        }
        let existing = self.members.get(&peer_id).map(|entry| entry.call.clone());
        if let Some(existing) = existing {
            let keep_existing = existing.role() == CallRole::Caller
                && (existing.is_open() || self.local_id < peer_id);
            if keep_existing {
                debug!(
                    target: "mesh::room",
                    peer = %peer_id,
                    kept = %existing.session_id(),
                    dropped = %call.session_id(),
                    "second session from member discarded"
                );
                call.close();
                return;
            }
            debug!(
                target: "mesh::room",
                peer = %peer_id,
                kept = %call.session_id(),
                dropped = %existing.session_id(),
                "member session replaced"
            );
            let was_open = existing.is_open();
            self.members.remove(&peer_id);
            existing.close();
            if was_open {
                self.emit(RoomEvent::Leave {
                    peer_id: peer_id.clone(),
                });
            }
        }

        let metadata = call.metadata().map(str::to_string);
        self.members.insert(
            peer_id.clone(),
            Member {
                call: call.clone(),
                metadata,
            },
        );
        if self.withdraw_if_left(&peer_id, &call) {
            return;
        }
        if let Err(err) = call.answer() {
            warn!(target: "mesh::room", peer = %peer_id, error = %err, "failed to answer member");
        }
    }

    fn on_call_event(&self, envelope: CallEnvelope) {
        if self.is_left() {
            return;
        }
        let CallEnvelope {
            session_id,
            peer_id,
            event,
        } = envelope;
        let current = self
            .members
            .get(&peer_id)
            .filter(|entry| entry.call.session_id() == session_id)
            .map(|entry| entry.metadata.clone());
        let Some(member_metadata) = current else {
            trace!(target: "mesh::room", session = %session_id, "event from a replaced session ignored");
            return;
        };

        let event = match event {
            CallEvent::Open => RoomEvent::Join {
                peer_id,
                metadata: member_metadata,
            },
            CallEvent::Close => {
                self.members
                    .remove_if(&peer_id, |_, member| member.call.session_id() == session_id);
                RoomEvent::Leave { peer_id }
            }
            CallEvent::Error(error) => RoomEvent::Error { peer_id, error },
            CallEvent::Data(data) => RoomEvent::Message { peer_id, data },
            CallEvent::Stream { stream, metadata } => RoomEvent::Stream {
                peer_id,
                stream,
                metadata,
            },
            CallEvent::RemoveStream { stream, metadata } => RoomEvent::RemoveStream {
                peer_id,
                stream,
                metadata,
            },
            CallEvent::Track {
                track,
                stream_id,
                metadata,
            } => RoomEvent::Track {
                peer_id,
                track,
                stream_id,
                metadata,
            },
            CallEvent::RemoveTrack {
                track,
                stream_id,
                metadata,
            } => RoomEvent::RemoveTrack {
                peer_id,
                track,
                stream_id,
                metadata,
            },
        };
        self.emit(event);
    }

    fn shutdown(&self) {
        let calls: Vec<Call> = self
            .members
            .iter()
            .map(|entry| entry.call.clone())
            .collect();
        self.members.clear();
        for call in calls {
            call.close();
        }
        self.emit(RoomEvent::Close);
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }
}
