//! In-process peer connections for tests and same-process meshes.
//!
//! Descriptions are small line-oriented texts:
//!
//! ```text
//! v=0
//! o=<connection id> <version>
//! a=data:<label>
//! a=msid:<stream id> <track id> <audio|video>
//! a=ice-restart
//! ```
//!
//! Two connections link once an offerer applies the answer naming the other
//! one. From then on data frames cross directly and closing either side closes
//! the other side's data channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use mesh_protocol::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ConnectionState, IceConnectionState, PeerConnection, PeerConnectionFactory, PlatformEvent,
    PlatformEvents, SignalingState,
};
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::media::{DataFrame, MediaTrack, TrackKind};

/// Calls a loopback connection has received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateDataChannel(String),
    SetLocal(SdpType),
    SetRemote(SdpType),
    Rollback,
    AddIceCandidate(String),
    AddTrack(String),
    RemoveTrack(String),
    RestartIce,
    Close,
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    next_id: AtomicU64,
    peers: Mutex<Vec<Arc<LoopbackPeer>>>,
}

impl NetworkInner {
    fn find(&self, id: &str) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().iter().find(|peer| peer.id == id).cloned()
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose connections are named `<label>-<n>`.
    pub fn factory(&self, label: impl Into<String>) -> Arc<LoopbackFactory> {
        Arc::new(LoopbackFactory {
            network: self.clone(),
            label: label.into(),
        })
    }

    pub fn peer(&self, id: &str) -> Option<Arc<LoopbackPeer>> {
        self.inner.find(id)
    }

    /// Every connection created by the factory with `label`, closed ones included.
    pub fn peers_labeled(&self, label: &str) -> Vec<Arc<LoopbackPeer>> {
        let prefix = format!("{label}-");
        self.inner
            .peers
            .lock()
            .iter()
            .filter(|peer| peer.id.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Reports ICE failure on one connection. Returns false for unknown ids.
    pub fn fail_ice(&self, id: &str) -> bool {
        match self.inner.find(id) {
            Some(peer) => {
                peer.emit(PlatformEvent::IceConnectionState(IceConnectionState::Failed));
                true
            }
            None => false,
        }
    }

    /// Reports the transport as disconnected on one connection.
    pub fn drop_link(&self, id: &str) -> bool {
        match self.inner.find(id) {
            Some(peer) => {
                peer.emit(PlatformEvent::ConnectionState(ConnectionState::Disconnected));
                true
            }
            None => false,
        }
    }
}

pub struct LoopbackFactory {
    network: LoopbackNetwork,
    label: String,
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    async fn create(
        &self,
        _config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, PlatformEvents), PeerError> {
        let n = self.network.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(LoopbackPeer {
            id: format!("{}-{n}", self.label),
            network: Arc::downgrade(&self.network.inner),
            events,
            state: Mutex::new(PeerState::default()),
        });
        self.network.inner.peers.lock().push(Arc::clone(&peer));
        tracing::trace!(target: "mesh::loopback", id = %peer.id, "connection created");
        Ok((peer, rx))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Content {
    data: Option<String>,
    tracks: Vec<(String, MediaTrack)>,
}

#[derive(Debug, Clone)]
struct Parsed {
    owner: String,
    version: u64,
    content: Content,
}

struct PeerState {
    signaling: SignalingState,
    version: u64,
    local_channel: Option<String>,
    local_tracks: Vec<(String, MediaTrack)>,
    advertised: Content,
    pending_local: Option<(Content, bool)>,
    remote: Option<Parsed>,
    partner: Option<String>,
    channel_open: bool,
    ice_restart: bool,
    negotiation_queued: bool,
    closed: bool,
    operations: Vec<Operation>,
    remote_offers_applied: usize,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            version: 0,
            local_channel: None,
            local_tracks: Vec::new(),
            advertised: Content::default(),
            pending_local: None,
            remote: None,
            partner: None,
            channel_open: false,
            ice_restart: false,
            negotiation_queued: false,
            closed: false,
            operations: Vec::new(),
            remote_offers_applied: 0,
        }
    }
}

impl PeerState {
    fn needs_negotiation(&self) -> bool {
        let channel_missing = self.local_channel.is_some() && self.advertised.data.is_none();
        channel_missing || self.local_tracks != self.advertised.tracks || self.ice_restart
    }

    /// True when a negotiation-needed event should be fired now.
    fn take_negotiation_needed(&mut self) -> bool {
        if self.closed
            || self.signaling != SignalingState::Stable
            || self.negotiation_queued
            || !self.needs_negotiation()
        {
            return false;
        }
        self.negotiation_queued = true;
        true
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

pub struct LoopbackPeer {
    id: String,
    network: Weak<NetworkInner>,
    events: mpsc::UnboundedSender<PlatformEvent>,
    state: Mutex<PeerState>,
}

impl LoopbackPeer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().operations.clone()
    }

    pub fn remote_offers_applied(&self) -> usize {
        self.state.lock().remote_offers_applied
    }

    pub fn partner(&self) -> Option<String> {
        self.state.lock().partner.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn emit(&self, event: PlatformEvent) {
        let _ = self.events.send(event);
    }

    fn emit_negotiation_needed(&self, state: &mut PeerState) {
        if state.take_negotiation_needed() {
            self.emit(PlatformEvent::NegotiationNeeded);
        }
    }

    fn candidate(&self, version: u64) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{version} 1 udp 2122260223 127.0.0.1 {} typ host",
                40000 + version
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some(format!("{}#{version}", self.id)),
        }
    }

    fn apply_remote_tracks(&self, state: &PeerState, incoming: &[(String, MediaTrack)]) {
        let previous = state
            .remote
            .as_ref()
            .map(|remote| remote.content.tracks.clone())
            .unwrap_or_default();
        for (stream_id, track) in incoming {
            if !previous.iter().any(|(_, known)| known.id == track.id) {
                self.emit(PlatformEvent::Track {
                    track: track.clone(),
                    stream_id: stream_id.clone(),
                });
            }
        }
        for (stream_id, track) in &previous {
            if !incoming.iter().any(|(_, kept)| kept.id == track.id) {
                self.emit(PlatformEvent::TrackRemoved {
                    track_id: track.id.clone(),
                    stream_id: stream_id.clone(),
                });
            }
        }
    }

    fn open_channel(&self, label: &str) {
        let mut state = self.state.lock();
        if state.closed || state.channel_open {
            return;
        }
        state.channel_open = true;
        if state.local_channel.is_none() {
            self.emit(PlatformEvent::DataChannel {
                label: label.to_string(),
            });
        }
        self.emit(PlatformEvent::DataChannelOpen);
    }

    fn link(&self, partner_id: &str, data: Option<String>, ice_restart: bool) {
        let Some(network) = self.network.upgrade() else {
            return;
        };
        let Some(partner) = network.find(partner_id) else {
            tracing::debug!(target: "mesh::loopback", id = %self.id, partner = %partner_id, "answer from unknown connection");
            return;
        };
        {
            let mut remote = partner.state.lock();
            if remote.closed {
                return;
            }
            remote.partner = Some(self.id.clone());
        }
        let first_link = self.state.lock().partner.replace(partner_id.to_string()).is_none();

        for side in [self, partner.as_ref()] {
            if first_link {
                side.emit(PlatformEvent::IceConnectionState(IceConnectionState::Connected));
                side.emit(PlatformEvent::ConnectionState(ConnectionState::Connected));
            } else if ice_restart {
                side.emit(PlatformEvent::IceConnectionState(IceConnectionState::Connected));
            }
            if let Some(label) = &data {
                side.open_channel(label);
            }
        }
    }

    fn remote_closed(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.partner = None;
        if state.channel_open {
            state.channel_open = false;
            self.emit(PlatformEvent::DataChannelClosed);
        }
        self.emit(PlatformEvent::ConnectionState(ConnectionState::Disconnected));
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeer {
    async fn create_data_channel(&self, label: &str, _ordered: bool) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.local_channel.is_some() || state.advertised.data.is_some() {
            return Err(PeerError::platform("data channel already exists"));
        }
        state.local_channel = Some(label.to_string());
        state
            .operations
            .push(Operation::CreateDataChannel(label.to_string()));
        self.emit_negotiation_needed(&mut state);
        Ok(())
    }

    async fn set_local_description(&self) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let (kind, content, ice_restart) = match state.signaling {
            SignalingState::Stable => {
                let content = Content {
                    data: state
                        .local_channel
                        .clone()
                        .or_else(|| state.advertised.data.clone()),
                    tracks: state.local_tracks.clone(),
                };
                (SdpType::Offer, content, state.ice_restart)
            }
            SignalingState::HaveRemoteOffer => {
                let content = Content {
                    data: state
                        .remote
                        .as_ref()
                        .and_then(|remote| remote.content.data.clone()),
                    tracks: state.local_tracks.clone(),
                };
                (SdpType::Answer, content, false)
            }
            other => {
                return Err(PeerError::Negotiation(format!(
                    "cannot create a local description in {other:?}"
                )))
            }
        };

        state.version += 1;
        let version = state.version;
        let sdp = render(&self.id, version, &content, ice_restart);
        state.operations.push(Operation::SetLocal(kind));
        if kind == SdpType::Offer {
            state.signaling = SignalingState::HaveLocalOffer;
            state.pending_local = Some((content, ice_restart));
            state.negotiation_queued = false;
        } else {
            state.signaling = SignalingState::Stable;
            state.advertised = content;
        }
        self.emit(PlatformEvent::IceCandidate(self.candidate(version)));
        if kind == SdpType::Answer {
            self.emit_negotiation_needed(&mut state);
        }
        Ok(SessionDescription { kind, sdp })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let parsed = parse(&desc.sdp)?;
        let mut state = self.state.lock();
        state.ensure_open()?;
        match desc.kind {
            SdpType::Offer => {
                if state.signaling != SignalingState::Stable {
                    return Err(PeerError::Negotiation(format!(
                        "remote offer in {:?}",
                        state.signaling
                    )));
                }
                state.signaling = SignalingState::HaveRemoteOffer;
                state.remote_offers_applied += 1;
                state.operations.push(Operation::SetRemote(SdpType::Offer));
                self.apply_remote_tracks(&state, &parsed.content.tracks);
                state.remote = Some(parsed);
                Ok(())
            }
            SdpType::Answer => {
                if state.signaling != SignalingState::HaveLocalOffer {
                    return Err(PeerError::Negotiation(format!(
                        "remote answer in {:?}",
                        state.signaling
                    )));
                }
                let (content, restarted) = state.pending_local.take().unwrap_or_default();
                if restarted {
                    state.ice_restart = false;
                }
                state.signaling = SignalingState::Stable;
                state.advertised = content;
                state.operations.push(Operation::SetRemote(SdpType::Answer));
                self.apply_remote_tracks(&state, &parsed.content.tracks);
                let partner = parsed.owner.clone();
                let data = state.advertised.data.clone();
                state.remote = Some(parsed);
                self.emit_negotiation_needed(&mut state);
                drop(state);
                self.link(&partner, data, restarted);
                Ok(())
            }
            other => Err(PeerError::Negotiation(format!(
                "unsupported remote description type {}",
                other.as_str()
            ))),
        }
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        match state.signaling {
            SignalingState::Stable => Ok(()),
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer => {
                state.signaling = SignalingState::Stable;
                state.pending_local = None;
                state.operations.push(Operation::Rollback);
                Ok(())
            }
            other => Err(PeerError::Negotiation(format!("cannot roll back in {other:?}"))),
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let Some(remote) = &state.remote else {
            return Err(PeerError::negotiation("candidate before remote description"));
        };
        let expected = format!("{}#{}", remote.owner, remote.version);
        if candidate.username_fragment.as_deref() != Some(expected.as_str()) {
            return Err(PeerError::negotiation(
                "candidate does not match the remote description",
            ));
        }
        state
            .operations
            .push(Operation::AddIceCandidate(candidate.candidate));
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn restart_ice(&self) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.ice_restart = true;
        state.operations.push(Operation::RestartIce);
        self.emit_negotiation_needed(&mut state);
        Ok(())
    }

    async fn send(&self, frame: DataFrame) -> Result<(), PeerError> {
        let partner_id = {
            let state = self.state.lock();
            state.ensure_open()?;
            if !state.channel_open {
                return Err(PeerError::NotReady);
            }
            state.partner.clone()
        };
        let partner = partner_id
            .and_then(|id| self.network.upgrade().and_then(|network| network.find(&id)))
            .ok_or_else(|| PeerError::platform("remote connection is gone"))?;
        if partner.is_closed() {
            return Err(PeerError::platform("remote connection is closed"));
        }
        partner.emit(PlatformEvent::DataChannelMessage(frame));
        Ok(())
    }

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        if state.local_tracks.iter().any(|(_, known)| known.id == track.id) {
            return Err(PeerError::Platform(format!("track {} already added", track.id)));
        }
        state
            .local_tracks
            .push((stream_id.to_string(), track.clone()));
        state.operations.push(Operation::AddTrack(track.id.clone()));
        self.emit_negotiation_needed(&mut state);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        let before = state.local_tracks.len();
        state.local_tracks.retain(|(_, track)| track.id != track_id);
        if state.local_tracks.len() == before {
            return Err(PeerError::Platform(format!("unknown track {track_id}")));
        }
        state
            .operations
            .push(Operation::RemoveTrack(track_id.to_string()));
        self.emit_negotiation_needed(&mut state);
        Ok(())
    }

    async fn close(&self) {
        let partner = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.channel_open = false;
            state.signaling = SignalingState::Closed;
            state.operations.push(Operation::Close);
            state.partner.take()
        };
        if let Some(partner) =
            partner.and_then(|id| self.network.upgrade().and_then(|network| network.find(&id)))
        {
            partner.remote_closed();
        }
    }
}

fn render(owner: &str, version: u64, content: &Content, ice_restart: bool) -> String {
    let mut sdp = format!("v=0\no={owner} {version}\n");
    if let Some(label) = &content.data {
        sdp.push_str(&format!("a=data:{label}\n"));
    }
    for (stream_id, track) in &content.tracks {
        sdp.push_str(&format!(
            "a=msid:{stream_id} {} {}\n",
            track.id,
            track.kind.as_str()
        ));
    }
    if ice_restart {
        sdp.push_str("a=ice-restart\n");
    }
    sdp
}

fn parse(sdp: &str) -> Result<Parsed, PeerError> {
    let mut owner = None;
    let mut parsed_content = Content::default();
    for line in sdp.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(rest) = line.strip_prefix("o=") {
            let mut parts = rest.split_whitespace();
            let id = parts.next().map(str::to_string);
            let version = parts.next().and_then(|v| v.parse::<u64>().ok());
            owner = id.zip(version);
        } else if let Some(label) = line.strip_prefix("a=data:") {
            parsed_content.data = Some(label.to_string());
        } else if let Some(rest) = line.strip_prefix("a=msid:") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            let [stream_id, track_id, kind] = parts.as_slice() else {
                return Err(PeerError::Negotiation(format!("malformed track line {line:?}")));
            };
            let kind = TrackKind::parse(kind)
                .ok_or_else(|| PeerError::Negotiation(format!("unknown track kind {kind:?}")))?;
            parsed_content
                .tracks
                .push((stream_id.to_string(), MediaTrack::new(*track_id, kind)));
        } else if line != "v=0" && line != "a=ice-restart" {
            return Err(PeerError::Negotiation(format!("unexpected line {line:?}")));
        }
    }
    let (owner, version) = owner.ok_or_else(|| PeerError::negotiation("missing origin line"))?;
    Ok(Parsed {
        owner,
        version,
        content: parsed_content,
    })
}
