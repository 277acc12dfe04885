use std::time::Duration;

use mesh_peer::{
    DataFrame, LoopbackNetwork, LoopbackPeer, MediaStream, MediaTrack, NegotiationPhase,
    Operation, Peer, PeerConfig, PeerError, PeerEvent, Role, TrackKind,
};
use mesh_protocol::{SdpType, SessionDescription, Signal};
use std::sync::Arc;
use test_timeout::tokio_timeout_test;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep_until, timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

struct Side {
    peer: Peer,
    events: UnboundedReceiver<PeerEvent>,
    seen: Vec<PeerEvent>,
}

impl Side {
    fn new(network: &LoopbackNetwork, label: &str, role: Role, config: PeerConfig) -> Self {
        let (peer, events) = Peer::new(
            role,
            network.factory(label),
            config,
            &tracing::Span::current(),
        );
        Self {
            peer,
            events,
            seen: Vec::new(),
        }
    }

    fn count(&self, pred: impl Fn(&PeerEvent) -> bool) -> usize {
        self.seen.iter().filter(|event| pred(event)).count()
    }

    async fn next(&mut self) -> PeerEvent {
        let event = timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for peer event")
            .expect("peer event stream ended");
        self.seen.push(event.clone());
        event
    }

    async fn next_matching(&mut self, pred: impl Fn(&PeerEvent) -> bool) -> PeerEvent {
        loop {
            let event = self.next().await;
            if pred(&event) {
                return event;
            }
        }
    }

    /// Signals emitted up to and including the first offer and the candidate after it.
    async fn hold_offer(&mut self) -> Vec<Signal> {
        let mut held = Vec::new();
        let mut offered = false;
        loop {
            if let PeerEvent::Signal(signal) = self.next().await {
                let is_candidate = matches!(signal, Signal::Candidate(_));
                offered |= signal.is_offer();
                held.push(signal);
                if offered && is_candidate {
                    return held;
                }
            }
        }
    }

    /// Collects whatever arrives within a short quiet period.
    async fn settle(&mut self) {
        while let Ok(Some(event)) = timeout(Duration::from_millis(150), self.events.recv()).await {
            self.seen.push(event);
        }
    }
}

fn is_connect(event: &PeerEvent) -> bool {
    matches!(event, PeerEvent::Connect)
}

fn is_close(event: &PeerEvent) -> bool {
    matches!(event, PeerEvent::Close)
}

fn is_error(event: &PeerEvent) -> bool {
    matches!(event, PeerEvent::Error(_))
}

fn is_sdp(kind: SdpType) -> impl Fn(&PeerEvent) -> bool {
    move |event| matches!(event, PeerEvent::Signal(Signal::Sdp(desc)) if desc.kind == kind)
}

fn is_track(id: &'static str) -> impl Fn(&PeerEvent) -> bool {
    move |event| matches!(event, PeerEvent::Track { track, .. } if track.id == id)
}

/// Relays signals between the two engines until `done` holds.
async fn pump(a: &mut Side, b: &mut Side, done: impl Fn(&Side, &Side) -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done(a, b) {
        tokio::select! {
            Some(event) = a.events.recv() => {
                if let PeerEvent::Signal(signal) = &event {
                    b.peer.signal(signal.clone());
                }
                a.seen.push(event);
            }
            Some(event) = b.events.recv() => {
                if let PeerEvent::Signal(signal) = &event {
                    a.peer.signal(signal.clone());
                }
                b.seen.push(event);
            }
            _ = sleep_until(deadline) => panic!("negotiation did not settle"),
        }
    }
}

fn pair(network: &LoopbackNetwork, config: PeerConfig) -> (Side, Side) {
    (
        Side::new(network, "alice", Role::Initiator, config.clone()),
        Side::new(network, "bob", Role::Responder, config),
    )
}

async fn connected_pair(network: &LoopbackNetwork, config: PeerConfig) -> (Side, Side) {
    let (mut alice, mut bob) = pair(network, config);
    pump(&mut alice, &mut bob, |a, b| {
        a.count(is_connect) == 1 && b.count(is_connect) == 1
    })
    .await;
    (alice, bob)
}

fn connection(network: &LoopbackNetwork, label: &str) -> Arc<LoopbackPeer> {
    network
        .peers_labeled(label)
        .into_iter()
        .next()
        .expect("connection exists")
}

fn stream(id: &str, track: &str, kind: TrackKind) -> MediaStream {
    MediaStream::new(id, vec![MediaTrack::new(track, kind)])
}

#[tokio_timeout_test]
async fn single_offer_answer_connects_both_sides() {
    let network = LoopbackNetwork::new();
    let (alice, bob) = connected_pair(&network, PeerConfig::localhost()).await;

    assert_eq!(alice.count(is_sdp(SdpType::Offer)), 1);
    assert_eq!(alice.count(is_sdp(SdpType::Answer)), 0);
    assert_eq!(bob.count(is_sdp(SdpType::Answer)), 1);
    assert_eq!(bob.count(is_sdp(SdpType::Offer)), 0);
    assert_eq!(alice.peer.phase(), NegotiationPhase::Connected);
    assert_eq!(bob.peer.phase(), NegotiationPhase::Connected);
    assert!(alice.peer.is_connected() && bob.peer.is_connected());
}

#[tokio_timeout_test]
async fn data_flows_after_connect() {
    let network = LoopbackNetwork::new();
    let (mut alice, mut bob) = connected_pair(&network, PeerConfig::localhost()).await;

    bob.peer.send("ping").await.unwrap();
    let event = alice
        .next_matching(|event| matches!(event, PeerEvent::Data(_)))
        .await;
    assert_eq!(event, PeerEvent::Data(DataFrame::from("ping")));

    alice.peer.send(vec![1u8, 2, 3]).await.unwrap();
    let event = bob
        .next_matching(|event| matches!(event, PeerEvent::Data(_)))
        .await;
    assert_eq!(event, PeerEvent::Data(DataFrame::from(vec![1u8, 2, 3])));
}

#[tokio_timeout_test]
async fn send_before_channel_opens_is_not_ready() {
    let network = LoopbackNetwork::new();
    let (alice, _bob) = pair(&network, PeerConfig::localhost());
    assert_eq!(alice.peer.send("early").await, Err(PeerError::NotReady));
}

#[tokio_timeout_test]
async fn simultaneous_offers_resolve_to_the_initiators() {
    let network = LoopbackNetwork::new();
    let (mut alice, mut bob) = connected_pair(&network, PeerConfig::localhost()).await;

    alice
        .peer
        .add_stream(&stream("alice-cam", "alice-mic", TrackKind::Audio))
        .await
        .unwrap();
    bob.peer
        .add_stream(&stream("bob-cam", "bob-mic", TrackKind::Audio))
        .await
        .unwrap();

    let alice_held = alice.hold_offer().await;
    let bob_held = bob.hold_offer().await;
    for signal in bob_held {
        alice.peer.signal(signal);
    }
    for signal in alice_held {
        bob.peer.signal(signal);
    }

    pump(&mut alice, &mut bob, |a, b| {
        a.count(is_track("bob-mic")) == 1 && b.count(is_track("alice-mic")) == 1
    })
    .await;
    alice.settle().await;
    bob.settle().await;

    let alice_pc = connection(&network, "alice");
    let bob_pc = connection(&network, "bob");
    assert!(!alice_pc.operations().contains(&Operation::Rollback));
    assert_eq!(alice_pc.remote_offers_applied(), 0);
    assert_eq!(
        bob_pc
            .operations()
            .iter()
            .filter(|op| **op == Operation::Rollback)
            .count(),
        1
    );
    assert_eq!(bob_pc.remote_offers_applied(), 2);

    assert_eq!(alice.count(is_sdp(SdpType::Offer)), 2);
    assert_eq!(bob.count(is_sdp(SdpType::Offer)), 1);
    assert_eq!(bob.count(is_sdp(SdpType::Answer)), 2);
    assert_eq!(alice.count(is_error), 0, "candidate for ignored offer must be swallowed");
    assert_eq!(bob.count(is_error), 0);
    assert!(alice.peer.is_connected() && bob.peer.is_connected());
}

#[tokio_timeout_test]
async fn close_is_idempotent_and_reaches_the_remote() {
    let network = LoopbackNetwork::new();
    let (mut alice, mut bob) = connected_pair(&network, PeerConfig::localhost()).await;

    alice.peer.close();
    alice.peer.close();
    alice.next_matching(is_close).await;
    bob.next_matching(is_close).await;
    bob.peer.close();

    alice.settle().await;
    bob.settle().await;
    assert_eq!(alice.count(is_close), 1);
    assert_eq!(bob.count(is_close), 1);
    assert_eq!(alice.peer.phase(), NegotiationPhase::Closed);
    assert_eq!(alice.peer.send("late").await, Err(PeerError::Closed));
    assert!(connection(&network, "alice").is_closed());
}

#[tokio_timeout_test]
async fn failed_ice_restarts_and_recovers() {
    let network = LoopbackNetwork::new();
    let (mut alice, mut bob) = connected_pair(&network, PeerConfig::localhost()).await;
    let alice_pc = connection(&network, "alice");

    assert!(network.fail_ice(alice_pc.id()));
    let answers_applied = |pc: &LoopbackPeer| {
        pc.operations()
            .iter()
            .filter(|op| **op == Operation::SetRemote(SdpType::Answer))
            .count()
    };
    pump(&mut alice, &mut bob, |_, _| answers_applied(alice_pc.as_ref()) == 2).await;

    assert!(alice_pc.operations().contains(&Operation::RestartIce));
    assert_eq!(alice.count(is_close), 0);
    alice.peer.send("after restart").await.unwrap();
    let event = bob
        .next_matching(|event| matches!(event, PeerEvent::Data(_)))
        .await;
    assert_eq!(event, PeerEvent::Data(DataFrame::from("after restart")));
}

#[tokio_timeout_test]
async fn exhausted_ice_restarts_tear_down() {
    let network = LoopbackNetwork::new();
    let config = PeerConfig {
        max_ice_restarts: 0,
        ..PeerConfig::localhost()
    };
    let (mut alice, mut bob) = connected_pair(&network, config).await;

    network.fail_ice(connection(&network, "alice").id());
    alice.next_matching(is_close).await;
    assert!(matches!(
        alice.seen.iter().rev().nth(1),
        Some(PeerEvent::Error(PeerError::Negotiation(_)))
    ));
    bob.next_matching(is_close).await;
}

#[tokio_timeout_test]
async fn disconnected_transport_closes_engine() {
    let network = LoopbackNetwork::new();
    let (_alice, mut bob) = connected_pair(&network, PeerConfig::localhost()).await;
    network.drop_link(connection(&network, "bob").id());
    bob.next_matching(is_close).await;
    assert!(bob.peer.is_closed());
}

#[tokio_timeout_test]
async fn malformed_offer_is_fatal() {
    let network = LoopbackNetwork::new();
    let (_alice, mut bob) = pair(&network, PeerConfig::localhost());
    bob.peer
        .signal(Signal::Sdp(SessionDescription::offer("not a description")));
    bob.next_matching(is_close).await;
    assert_eq!(bob.count(is_error), 1);
    // Terminal: later signals are ignored.
    bob.peer
        .signal(Signal::Sdp(SessionDescription::offer("still not one")));
    bob.settle().await;
    assert_eq!(bob.count(is_close), 1);
}

#[tokio_timeout_test]
async fn remote_streams_appear_and_disappear() {
    let network = LoopbackNetwork::new();
    let (mut alice, mut bob) = connected_pair(&network, PeerConfig::localhost()).await;
    let camera = MediaStream::new(
        "cam",
        vec![
            MediaTrack::new("cam-audio", TrackKind::Audio),
            MediaTrack::new("cam-video", TrackKind::Video),
        ],
    );

    alice.peer.add_stream(&camera).await.unwrap();
    pump(&mut alice, &mut bob, |_, b| {
        b.count(|event| matches!(event, PeerEvent::Track { .. })) == 2
    })
    .await;
    let streams: Vec<&PeerEvent> = bob
        .seen
        .iter()
        .filter(|event| matches!(event, PeerEvent::Stream(_)))
        .collect();
    assert_eq!(streams.len(), 1);
    let first_stream = bob
        .seen
        .iter()
        .position(|event| matches!(event, PeerEvent::Stream(_)))
        .unwrap();
    let first_track = bob
        .seen
        .iter()
        .position(|event| matches!(event, PeerEvent::Track { .. }))
        .unwrap();
    assert!(first_stream < first_track);

    alice
        .peer
        .remove_track(&MediaTrack::new("cam-audio", TrackKind::Audio))
        .await
        .unwrap();
    pump(&mut alice, &mut bob, |_, b| {
        b.count(|event| matches!(event, PeerEvent::RemoveTrack { .. })) == 1
    })
    .await;
    assert_eq!(
        bob.count(|event| matches!(event, PeerEvent::RemoveStream(_))),
        0
    );

    alice
        .peer
        .remove_track(&MediaTrack::new("cam-video", TrackKind::Video))
        .await
        .unwrap();
    pump(&mut alice, &mut bob, |_, b| {
        b.count(|event| matches!(event, PeerEvent::RemoveStream(stream) if stream.id == "cam")) == 1
    })
    .await;
}
