//! Peer connections backed by webrtc-rs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mesh_protocol::{IceCandidate, SdpType, SessionDescription};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ConnectionState, IceConnectionState, PeerConnection, PeerConnectionFactory, PlatformEvent,
    PlatformEvents, SignalingState,
};
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::media::{DataFrame, MediaTrack, TrackKind};

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(PeerError::platform)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(PeerError::platform)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Creates webrtc-rs peer connections and keeps the local tracks they send,
/// so the host can write samples into them.
#[derive(Default)]
pub struct WebRtcFactory {
    local_tracks: Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>,
}

impl WebRtcFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample writer for a track previously attached through an engine.
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(track_id).cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, PlatformEvents), PeerError> {
        let api = build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(PeerError::platform)?,
        );
        let (events, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(WebRtcConnection {
            pc,
            events,
            channel_label: config.channel_label.clone(),
            channel: Arc::new(Mutex::new(None)),
            senders: Mutex::new(HashMap::new()),
            remote_tracks: Arc::new(Mutex::new(HashMap::new())),
            ice_restart: AtomicBool::new(false),
            registry: Arc::clone(&self.local_tracks),
        });
        connection.install_callbacks();
        Ok((connection, rx))
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PlatformEvent>,
    channel_label: String,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    /// Remote track id to stream id, for tracks already reported.
    remote_tracks: Arc<Mutex<HashMap<String, String>>>,
    ice_restart: AtomicBool,
    registry: Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>,
}

impl WebRtcConnection {
    fn install_callbacks(&self) {
        let events = self.events.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(PlatformEvent::NegotiationNeeded);
            })
        }));

        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events.send(PlatformEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(err) => {
                            tracing::warn!(target: "mesh::webrtc", error = %err, "failed to serialize local candidate");
                        }
                    }
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    if let Some(state) = map_ice_state(state) {
                        let _ = events.send(PlatformEvent::IceConnectionState(state));
                    }
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    if let Some(state) = map_connection_state(state) {
                        let _ = events.send(PlatformEvent::ConnectionState(state));
                    }
                })
            }));

        let events = self.events.clone();
        let slot = Arc::clone(&self.channel);
        let label = self.channel_label.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                let slot = Arc::clone(&slot);
                let label = label.clone();
                Box::pin(async move {
                    if dc.label() != label {
                        tracing::debug!(target: "mesh::webrtc", label = %dc.label(), "ignoring unexpected data channel");
                        return;
                    }
                    {
                        let mut slot = slot.lock();
                        if slot.is_some() {
                            tracing::debug!(target: "mesh::webrtc", "data channel already present");
                            return;
                        }
                        *slot = Some(Arc::clone(&dc));
                    }
                    wire_channel(&dc, &events);
                    let _ = events.send(PlatformEvent::DataChannel { label });
                })
            }));

        let events = self.events.clone();
        let remote_tracks = Arc::clone(&self.remote_tracks);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                let remote_tracks = Arc::clone(&remote_tracks);
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    let track_id = track.id();
                    let stream_id = track.stream_id();
                    remote_tracks
                        .lock()
                        .insert(track_id.clone(), stream_id.clone());
                    let _ = events.send(PlatformEvent::Track {
                        track: MediaTrack::new(track_id, kind),
                        stream_id,
                    });
                })
            },
        ));
    }

    /// Reports previously seen remote tracks the latest remote description no
    /// longer sends.
    async fn report_removed_tracks(&self) {
        let Some(remote) = self.pc.remote_description().await else {
            return;
        };
        let sending = sending_track_ids(&remote.sdp);
        let removed: Vec<(String, String)> = {
            let mut known = self.remote_tracks.lock();
            let gone: Vec<String> = known
                .keys()
                .filter(|id| !sending.contains(*id))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|id| known.remove(&id).map(|stream| (id, stream)))
                .collect()
        };
        for (track_id, stream_id) in removed {
            let _ = self
                .events
                .send(PlatformEvent::TrackRemoved { track_id, stream_id });
        }
    }
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<PlatformEvent>) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            tracing::debug!(target: "mesh::webrtc", "data channel open");
            let _ = events.send(PlatformEvent::DataChannelOpen);
        })
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = message_events.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => DataFrame::Text(text),
                    Err(_) => DataFrame::Binary(msg.data),
                }
            } else {
                DataFrame::Binary(msg.data)
            };
            let _ = events.send(PlatformEvent::DataChannelMessage(frame));
        })
    }));

    let error_events = events.clone();
    dc.on_error(Box::new(move |err| {
        let events = error_events.clone();
        Box::pin(async move {
            let _ = events.send(PlatformEvent::DataChannelError(err.to_string()));
        })
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            tracing::trace!(target: "mesh::webrtc", "data channel closed");
            let _ = events.send(PlatformEvent::DataChannelClosed);
        })
    }));
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_data_channel(&self, label: &str, ordered: bool) -> Result<(), PeerError> {
        if self.channel.lock().is_some() {
            return Err(PeerError::platform("data channel already exists"));
        }
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(PeerError::platform)?;
        wire_channel(&dc, &self.events);
        *self.channel.lock() = Some(dc);
        Ok(())
    }

    async fn set_local_description(&self) -> Result<SessionDescription, PeerError> {
        let desc = match self.pc.signaling_state() {
            RTCSignalingState::Stable => {
                let options = self
                    .ice_restart
                    .swap(false, Ordering::AcqRel)
                    .then(|| RTCOfferOptions {
                        ice_restart: true,
                        ..Default::default()
                    });
                self.pc
                    .create_offer(options)
                    .await
                    .map_err(PeerError::negotiation)?
            }
            RTCSignalingState::HaveRemoteOffer => self
                .pc
                .create_answer(None)
                .await
                .map_err(PeerError::negotiation)?,
            other => {
                return Err(PeerError::Negotiation(format!(
                    "cannot create a local description in {other}"
                )))
            }
        };
        self.pc
            .set_local_description(desc)
            .await
            .map_err(PeerError::negotiation)?;
        let applied = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| PeerError::negotiation("local description missing after apply"))?;
        Ok(SessionDescription {
            kind: from_rtc_sdp_type(applied.sdp_type)?,
            sdp: applied.sdp,
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let rtc = match desc.kind {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpType::Rollback => {
                return Err(PeerError::negotiation(
                    "rollback is not a remote description",
                ))
            }
        }
        .map_err(PeerError::negotiation)?;
        self.pc
            .set_remote_description(rtc)
            .await
            .map_err(PeerError::negotiation)?;
        self.report_removed_tracks().await;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        if self.pc.signaling_state() == RTCSignalingState::Stable {
            return Ok(());
        }
        let mut desc = RTCSessionDescription::default();
        desc.sdp_type = RTCSdpType::Rollback;
        if let Some(pending) = self.pc.pending_local_description().await {
            desc.sdp = pending.sdp;
        }
        self.pc
            .set_local_description(desc)
            .await
            .map_err(PeerError::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(PeerError::negotiation)
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn restart_ice(&self) -> Result<(), PeerError> {
        self.ice_restart.store(true, Ordering::Release);
        let _ = self.events.send(PlatformEvent::NegotiationNeeded);
        Ok(())
    }

    async fn send(&self, frame: DataFrame) -> Result<(), PeerError> {
        let dc = self.channel.lock().clone().ok_or(PeerError::NotReady)?;
        let result = match frame {
            DataFrame::Text(text) => dc.send_text(text).await,
            DataFrame::Binary(data) => dc.send(&data).await,
        };
        result.map(|_| ()).map_err(PeerError::platform)
    }

    async fn add_track(&self, track: &MediaTrack, stream_id: &str) -> Result<(), PeerError> {
        let mime_type = match track.kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            stream_id.to_string(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(PeerError::platform)?;
        self.senders.lock().insert(track.id.clone(), sender);
        self.registry.lock().insert(track.id.clone(), local);
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .remove(track_id)
            .ok_or_else(|| PeerError::Platform(format!("unknown track {track_id}")))?;
        self.registry.lock().remove(track_id);
        self.pc
            .remove_track(&sender)
            .await
            .map_err(PeerError::platform)
    }

    async fn close(&self) {
        let channel = self.channel.lock().take();
        if let Some(dc) = channel {
            let _ = dc.close().await;
        }
        let senders: Vec<String> = self.senders.lock().drain().map(|(id, _)| id).collect();
        {
            let mut registry = self.registry.lock();
            for id in senders {
                registry.remove(&id);
            }
        }
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target: "mesh::webrtc", error = %err, "peer connection close failed");
        }
    }
}

fn from_rtc_sdp_type(kind: RTCSdpType) -> Result<SdpType, PeerError> {
    match kind {
        RTCSdpType::Offer => Ok(SdpType::Offer),
        RTCSdpType::Answer => Ok(SdpType::Answer),
        RTCSdpType::Pranswer => Ok(SdpType::Pranswer),
        RTCSdpType::Rollback => Ok(SdpType::Rollback),
        _ => Err(PeerError::negotiation("unspecified description type")),
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => return None,
    })
}

/// Track ids of media sections the remote side is sending on.
fn sending_track_ids(sdp: &str) -> HashSet<String> {
    let mut sending = HashSet::new();
    let mut section: Option<(Vec<String>, bool)> = None;
    let mut flush = |section: &mut Option<(Vec<String>, bool)>| {
        if let Some((tracks, sends)) = section.take() {
            if sends {
                sending.extend(tracks);
            }
        }
    };
    for line in sdp.lines().map(str::trim) {
        if line.starts_with("m=") {
            flush(&mut section);
            section = Some((Vec::new(), true));
        } else if let Some((tracks, sends)) = section.as_mut() {
            if let Some(msid) = line.strip_prefix("a=msid:") {
                if let Some(track_id) = msid.split_whitespace().nth(1) {
                    tracks.push(track_id.to_string());
                }
            } else if line == "a=recvonly" || line == "a=inactive" {
                *sends = false;
            }
        }
    }
    flush(&mut section);
    sending
}
