use async_trait::async_trait;
use mesh_protocol::{SignalEnvelope, SignalKind};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{Signaling, SignalingEvent, SignalingEvents, SignalingState};
use crate::error::SignalingError;

/// Ready-state signaling that records outbound traffic instead of sending it.
pub(crate) struct RecordingSignaling {
    id: String,
    state: watch::Sender<SignalingState>,
    sent: Mutex<Vec<(SignalKind, SignalEnvelope)>>,
    rooms: Mutex<Vec<String>>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<SignalingEvents>>,
}

impl RecordingSignaling {
    pub(crate) fn new(id: &str) -> Self {
        let (state, _) = watch::channel(SignalingState::Ready);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: id.to_string(),
            state,
            sent: Mutex::new(Vec::new()),
            rooms: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub(crate) fn sent(&self) -> Vec<(SignalKind, SignalEnvelope)> {
        self.sent.lock().clone()
    }

    pub(crate) fn rooms(&self) -> Vec<String> {
        self.rooms.lock().clone()
    }

    pub(crate) fn inject(&self, event: SignalingEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl Signaling for RecordingSignaling {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn state(&self) -> SignalingState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<SignalingState> {
        self.state.subscribe()
    }

    async fn connect(&self) -> Result<String, SignalingError> {
        self.state.send_replace(SignalingState::Ready);
        Ok(self.id.clone())
    }

    async fn disconnect(&self) {
        self.state.send_replace(SignalingState::Disconnected);
    }

    fn signal(&self, kind: SignalKind, envelope: SignalEnvelope) -> Result<(), SignalingError> {
        if self.state() != SignalingState::Ready {
            return Err(SignalingError::NotReady);
        }
        self.sent.lock().push((kind, envelope));
        Ok(())
    }

    fn join(&self, room_id: &str, _metadata: Option<String>) -> Result<(), SignalingError> {
        self.rooms.lock().push(room_id.to_string());
        Ok(())
    }

    fn leave(&self, room_id: &str) -> Result<(), SignalingError> {
        self.rooms.lock().retain(|room| room != room_id);
        Ok(())
    }

    fn take_events(&self) -> Result<SignalingEvents, SignalingError> {
        self.events_rx
            .lock()
            .take()
            .ok_or(SignalingError::EventsTaken)
    }
}
