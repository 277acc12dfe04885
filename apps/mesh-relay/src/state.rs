use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mesh_protocol::{RelayErrorCode, ServerMessage};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::config::Config;

/// Registry entry for one live websocket.
#[derive(Clone)]
pub(crate) struct PeerHandle {
    /// Distinguishes this socket from later ones registering the same id.
    pub(crate) connection: u64,
    pub(crate) tx: mpsc::UnboundedSender<ServerMessage>,
    pub(crate) last_heartbeat: Arc<Mutex<Instant>>,
    /// Notified when the heartbeat monitor gives up on the connection.
    pub(crate) evict: Arc<Notify>,
}

/// Identity registry and room membership shared by every connection.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<StateInner>,
}

struct StateInner {
    /// identity -> live connection
    peers: DashMap<String, PeerHandle>,
    /// room id -> (member identity -> join metadata)
    rooms: DashMap<String, HashMap<String, Option<String>>>,
    next_connection: AtomicU64,
    config: Config,
}

impl RelayState {
    /// Must be called inside a tokio runtime; starts the heartbeat monitor.
    pub fn new(config: Config) -> Self {
        let state = Self {
            inner: Arc::new(StateInner {
                peers: DashMap::new(),
                rooms: DashMap::new(),
                next_connection: AtomicU64::new(1),
                config,
            }),
        };

        let monitor = Arc::downgrade(&state.inner);
        let interval = state.inner.config.monitor_interval;
        let timeout = state.inner.config.heartbeat_timeout;
        tokio::spawn(async move {
            monitor_heartbeats(monitor, interval, timeout).await;
        });

        state
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.inner.peers.contains_key(peer_id)
    }

    pub fn room_count(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .inner
            .rooms
            .get(room_id)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub(crate) fn register(
        &self,
        peer_id: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Result<PeerHandle, RelayErrorCode> {
        match self.inner.peers.entry(peer_id.to_string()) {
            Entry::Occupied(_) => Err(RelayErrorCode::IdTaken),
            Entry::Vacant(vacant) => {
                let handle = PeerHandle {
                    connection: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
                    tx,
                    last_heartbeat: Arc::new(Mutex::new(Instant::now())),
                    evict: Arc::new(Notify::new()),
                };
                vacant.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Frees the identity if it still belongs to `connection`.
    pub(crate) fn release(&self, peer_id: &str, connection: u64) {
        self.inner
            .peers
            .remove_if(peer_id, |_, handle| handle.connection == connection);
    }

    pub(crate) fn touch(&self, handle: &PeerHandle) {
        *handle.last_heartbeat.lock() = Instant::now();
    }

    /// Returns false when `target` has no live connection.
    pub(crate) fn route(&self, target: &str, message: ServerMessage) -> bool {
        match self.inner.peers.get(target) {
            Some(peer) => peer.tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Adds `peer_id` to the room and tells the existing members. Repeated
    /// joins only refresh the metadata.
    pub(crate) fn join_room(&self, room_id: &str, peer_id: &str, metadata: Option<String>) {
        let mut members = self.inner.rooms.entry(room_id.to_string()).or_default();
        if members.contains_key(peer_id) {
            members.insert(peer_id.to_string(), metadata);
            return;
        }
        for member in members.keys() {
            self.route(
                member,
                ServerMessage::RoomJoin {
                    room_id: room_id.to_string(),
                    peer_id: peer_id.to_string(),
                    metadata: metadata.clone(),
                },
            );
        }
        members.insert(peer_id.to_string(), metadata);
        debug!(target: "relay", room = %room_id, peer = %peer_id, members = members.len(), "room join");
    }

    pub(crate) fn leave_room(&self, room_id: &str, peer_id: &str) -> bool {
        let removed = match self.inner.rooms.get_mut(room_id) {
            Some(mut members) => {
                let removed = members.remove(peer_id).is_some();
                if removed {
                    for member in members.keys() {
                        self.route(
                            member,
                            ServerMessage::RoomLeave {
                                room_id: room_id.to_string(),
                                peer_id: peer_id.to_string(),
                            },
                        );
                    }
                }
                removed
            }
            None => false,
        };
        self.inner
            .rooms
            .remove_if(room_id, |_, members| members.is_empty());
        if removed {
            debug!(target: "relay", room = %room_id, peer = %peer_id, "room leave");
        }
        removed
    }
}

/// Evicts connections whose last heartbeat is older than `timeout`.
async fn monitor_heartbeats(state: Weak<StateInner>, interval: Duration, timeout: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(state) = state.upgrade() else {
            break;
        };

        // Collect first so no registry guard is held while notifying.
        let stale: Vec<(String, Arc<Notify>)> = state
            .peers
            .iter()
            .filter(|entry| entry.last_heartbeat.lock().elapsed() > timeout)
            .map(|entry| (entry.key().clone(), entry.evict.clone()))
            .collect();

        for (peer_id, evict) in stale {
            info!(target: "relay", peer = %peer_id, "dropping stale connection (heartbeat timeout)");
            evict.notify_one();
        }
    }
}
