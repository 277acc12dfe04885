//! End-to-end sessions and rooms over a live relay with loopback connections.

use std::time::Duration;

use mesh_client::{
    Call, CallEvent, CallEvents, ClientConfig, ClientEvent, MediaStream, MediaTrack, MeshClient,
    MeshError, PeerConfig, Room, RoomEvent, TrackKind,
};
use mesh_peer::LoopbackNetwork;
use mesh_protocol::RelayErrorCode;
use mesh_relay::{Config, RelayHandle};
use test_timeout::tokio_timeout_test;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct Mesh {
    relay: RelayHandle,
    network: LoopbackNetwork,
}

impl Mesh {
    async fn start() -> Self {
        Self {
            relay: mesh_relay::spawn(Config::local()).await.expect("relay starts"),
            network: LoopbackNetwork::new(),
        }
    }

    fn client(&self, id: &str) -> MeshClient {
        let config = ClientConfig {
            peer: PeerConfig::localhost(),
            ..ClientConfig::default()
        }
        .with_relay(self.relay.ws_url())
        .with_peer_id(id);
        MeshClient::websocket(&config, self.network.factory(id)).expect("client builds")
    }

    async fn connected(&self, id: &str) -> MeshClient {
        let client = self.client(id);
        assert_eq!(client.connect().await.expect("relay accepts"), id);
        client
    }
}

async fn next_call_event(events: &mut CallEvents) -> CallEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("session events ended")
        .event
}

async fn call_event_matching(events: &mut CallEvents, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
    loop {
        let event = next_call_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn incoming_call(client: &MeshClient) -> (Call, CallEvents) {
    loop {
        let event = timeout(WAIT, client.recv())
            .await
            .expect("timed out waiting for a session")
            .expect("client events ended");
        if let ClientEvent::Call { call, events } = event {
            return (call, events);
        }
    }
}

async fn room_event_matching(room: &Room, pred: impl Fn(&RoomEvent) -> bool) -> RoomEvent {
    loop {
        let event = timeout(WAIT, room.recv())
            .await
            .expect("timed out waiting for a room event")
            .expect("room events ended");
        if pred(&event) {
            return event;
        }
    }
}

/// Waits until `room` reports a Join for every id in `peers`.
async fn await_joins(room: &Room, peers: &[&str]) {
    let mut pending: Vec<&str> = peers.to_vec();
    while !pending.is_empty() {
        if let RoomEvent::Join { peer_id, .. } =
            room_event_matching(room, |event| matches!(event, RoomEvent::Join { .. })).await
        {
            pending.retain(|id| *id != peer_id);
        }
    }
}

#[tokio_timeout_test(workers = 2)]
async fn a_called_peer_answers_and_exchanges_data() {
    let mesh = Mesh::start().await;
    let alice = mesh.connected("alice").await;
    let bob = mesh.connected("bob").await;

    let (outgoing, mut alice_events) = alice.call("bob", Some("hello".into())).unwrap();
    let (incoming, mut bob_events) = incoming_call(&bob).await;
    assert_eq!(incoming.peer_id(), "alice");
    assert_eq!(incoming.metadata(), Some("hello"));
    assert_eq!(incoming.session_id(), outgoing.session_id());
    assert!(!incoming.is_answered());

    incoming.answer().unwrap();
    call_event_matching(&mut bob_events, |event| *event == CallEvent::Open).await;
    call_event_matching(&mut alice_events, |event| *event == CallEvent::Open).await;

    incoming.send("ping").await.unwrap();
    let CallEvent::Data(frame) =
        call_event_matching(&mut alice_events, |event| matches!(event, CallEvent::Data(_))).await
    else {
        unreachable!();
    };
    assert_eq!(frame.as_text(), Some("ping"));

    outgoing.close();
    assert_eq!(
        call_event_matching(&mut alice_events, |event| matches!(event, CallEvent::Close)).await,
        CallEvent::Close
    );
    call_event_matching(&mut bob_events, |event| matches!(event, CallEvent::Close)).await;
    assert!(incoming.is_closed());
}

#[tokio_timeout_test(workers = 2)]
async fn stream_metadata_arrives_with_the_stream() {
    let mesh = Mesh::start().await;
    let alice = mesh.connected("alice").await;
    let bob = mesh.connected("bob").await;

    let (outgoing, mut alice_events) = alice.call("bob", None).unwrap();
    let (incoming, mut bob_events) = incoming_call(&bob).await;
    incoming.answer().unwrap();
    call_event_matching(&mut alice_events, |event| *event == CallEvent::Open).await;
    call_event_matching(&mut bob_events, |event| *event == CallEvent::Open).await;

    let camera = MediaStream::new("alice-cam", vec![MediaTrack::new("alice-video", TrackKind::Video)]);
    outgoing.add_stream(&camera, Some("screen".into())).await.unwrap();

    let CallEvent::Stream { stream, metadata } =
        call_event_matching(&mut bob_events, |event| matches!(event, CallEvent::Stream { .. })).await
    else {
        unreachable!();
    };
    assert_eq!(stream.id, "alice-cam");
    assert_eq!(metadata.as_deref(), Some("screen"));

    outgoing.remove_stream(&camera).await.unwrap();
    let CallEvent::RemoveStream { metadata, .. } = call_event_matching(&mut bob_events, |event| {
        matches!(event, CallEvent::RemoveStream { .. })
    })
    .await
    else {
        unreachable!();
    };
    assert_eq!(metadata.as_deref(), Some("screen"));
}

#[tokio_timeout_test(workers = 2)]
async fn calling_an_absent_peer_fails_the_session() {
    let mesh = Mesh::start().await;
    let alice = mesh.connected("alice").await;

    let (call, mut events) = alice.call("nobody", None).unwrap();
    match next_call_event(&mut events).await {
        CallEvent::Error(MeshError::Routing { code, .. }) => {
            assert_eq!(code, RelayErrorCode::UnknownTarget)
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(next_call_event(&mut events).await, CallEvent::Close);
    assert!(call.is_closed());
}

#[tokio_timeout_test(workers = 2)]
async fn a_taken_identity_cannot_connect() {
    let mesh = Mesh::start().await;
    let _owner = mesh.connected("alice").await;

    let impostor = mesh.client("alice");
    match impostor.connect().await {
        Err(MeshError::Routing { code, .. }) => assert_eq!(code, RelayErrorCode::IdTaken),
        other => panic!("unexpected result {other:?}"),
    }
    assert!(mesh.relay.state().is_connected("alice"));
}

#[tokio_timeout_test(workers = 4)]
async fn three_members_form_a_full_mesh() {
    let mesh = Mesh::start().await;
    let alice = mesh.connected("alice").await;
    let bob = mesh.connected("bob").await;
    let carol = mesh.connected("carol").await;

    let room_a = alice.join("r1", Some("a".into())).unwrap();
    let room_b = bob.join("r1", Some("b".into())).unwrap();
    await_joins(&room_a, &["bob"]).await;
    let room_c = carol.join("r1", None).unwrap();

    await_joins(&room_a, &["carol"]).await;
    await_joins(&room_b, &["alice", "carol"]).await;
    await_joins(&room_c, &["alice", "bob"]).await;

    assert_eq!(room_a.peers(), vec!["bob", "carol"]);
    assert_eq!(room_b.peers(), vec!["alice", "carol"]);
    assert_eq!(room_c.peers(), vec!["alice", "bob"]);
    assert_eq!(room_c.member_metadata("bob").as_deref(), Some("b"));
    assert!(matches!(alice.join("r1", None), Err(MeshError::AlreadyJoined(_))));

    let mut report = room_a.send("hi all", None).await;
    assert!(report.is_complete());
    report.delivered.sort();
    assert_eq!(report.delivered, vec!["bob", "carol"]);
    for room in [&room_b, &room_c] {
        let RoomEvent::Message { peer_id, data } =
            room_event_matching(room, |event| matches!(event, RoomEvent::Message { .. })).await
        else {
            unreachable!();
        };
        assert_eq!(peer_id, "alice");
        assert_eq!(data.as_text(), Some("hi all"));
    }

    let only_dave = vec!["dave".to_string()];
    let report = room_a.send("anyone?", Some(&only_dave)).await;
    assert!(report.delivered.is_empty());
    assert_eq!(report.failed, vec![("dave".to_string(), MeshError::UnknownMember("dave".into()))]);
}

#[tokio_timeout_test(workers = 4)]
async fn leaving_members_are_reported_to_the_rest() {
    let mesh = Mesh::start().await;
    let alice = mesh.connected("alice").await;
    let bob = mesh.connected("bob").await;

    let room_a = alice.join("r1", None).unwrap();
    let room_b = bob.join("r1", None).unwrap();
    await_joins(&room_a, &["bob"]).await;
    await_joins(&room_b, &["alice"]).await;

    room_b.leave();
    assert!(room_b.is_left());
    room_event_matching(&room_b, |event| *event == RoomEvent::Close).await;

    let RoomEvent::Leave { peer_id } =
        room_event_matching(&room_a, |event| matches!(event, RoomEvent::Leave { .. })).await
    else {
        unreachable!();
    };
    assert_eq!(peer_id, "bob");
    assert!(room_a.peers().is_empty());
    assert!(room_a.member("bob").is_none());
}

#[tokio_timeout_test(workers = 4)]
async fn room_media_reaches_every_member() {
    let mesh = Mesh::start().await;
    let alice = mesh.connected("alice").await;
    let bob = mesh.connected("bob").await;
    let carol = mesh.connected("carol").await;

    let room_a = alice.join("r1", None).unwrap();
    let room_b = bob.join("r1", None).unwrap();
    await_joins(&room_a, &["bob"]).await;
    let room_c = carol.join("r1", None).unwrap();
    await_joins(&room_a, &["carol"]).await;
    await_joins(&room_b, &["alice", "carol"]).await;
    await_joins(&room_c, &["alice", "bob"]).await;

    let camera = MediaStream::new("alice-cam", vec![MediaTrack::new("alice-video", TrackKind::Video)]);
    let mut report = room_a.add_stream(&camera, Some("cam".into()), None).await;
    assert!(report.is_complete());
    report.delivered.sort();
    assert_eq!(report.delivered, vec!["bob", "carol"]);

    for room in [&room_b, &room_c] {
        let RoomEvent::Stream { peer_id, stream, metadata } =
            room_event_matching(room, |event| matches!(event, RoomEvent::Stream { .. })).await
        else {
            unreachable!();
        };
        assert_eq!(peer_id, "alice");
        assert_eq!(stream.id, "alice-cam");
        assert_eq!(metadata.as_deref(), Some("cam"));

        let RoomEvent::Track { peer_id, track, stream_id, metadata } =
            room_event_matching(room, |event| matches!(event, RoomEvent::Track { .. })).await
        else {
            unreachable!();
        };
        assert_eq!(peer_id, "alice");
        assert_eq!(track.id, "alice-video");
        assert_eq!(stream_id, "alice-cam");
        assert_eq!(metadata.as_deref(), Some("cam"));
    }

    let only_bob = vec!["bob".to_string()];
    let report = room_a.remove_stream(&camera, Some(&only_bob)).await;
    assert_eq!(report.delivered, vec!["bob"]);
    let RoomEvent::RemoveStream { peer_id, stream, metadata } =
        room_event_matching(&room_b, |event| matches!(event, RoomEvent::RemoveStream { .. })).await
    else {
        unreachable!();
    };
    assert_eq!(peer_id, "alice");
    assert_eq!(stream.id, "alice-cam");
    assert_eq!(metadata.as_deref(), Some("cam"));
    assert_eq!(room_c.peers(), vec!["alice", "bob"]);
}
