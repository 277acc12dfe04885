use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::call::{Call, CallEnvelope};
use crate::room::{Room, RoomInput};

/// Inbound side of a joined room as seen by the dispatcher.
#[derive(Clone)]
pub(crate) struct RoomPort {
    pub(crate) inputs: mpsc::UnboundedSender<RoomInput>,
    pub(crate) sink: mpsc::UnboundedSender<CallEnvelope>,
    /// Left through this handle when the client closes.
    pub(crate) room: Room,
}

/// Session id and room id lookups shared by the dispatcher, calls and rooms.
#[derive(Clone, Default)]
pub(crate) struct SessionRouter {
    inner: Arc<RouterInner>,
}

#[derive(Default)]
struct RouterInner {
    sessions: DashMap<String, Call>,
    rooms: DashMap<String, RoomPort>,
}

impl SessionRouter {
    pub(crate) fn register(&self, call: &Call) {
        self.inner
            .sessions
            .insert(call.session_id().to_string(), call.clone());
    }

    pub(crate) fn unregister(&self, session_id: &str) {
        self.inner.sessions.remove(session_id);
    }

    pub(crate) fn session(&self, session_id: &str) -> Option<Call> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    pub(crate) fn sessions(&self) -> Vec<Call> {
        self.inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Returns false when the room is already registered.
    pub(crate) fn add_room(&self, room_id: &str, port: RoomPort) -> bool {
        match self.inner.rooms.entry(room_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(port);
                true
            }
        }
    }

    pub(crate) fn remove_room(&self, room_id: &str) {
        self.inner.rooms.remove(room_id);
    }

    pub(crate) fn room(&self, room_id: &str) -> Option<RoomPort> {
        self.inner
            .rooms
            .get(room_id)
            .map(|entry| entry.value().clone())
    }

    pub(crate) fn room_ids(&self) -> Vec<String> {
        self.inner
            .rooms
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}
