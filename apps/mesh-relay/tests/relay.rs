use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use mesh_protocol::{
    ClientMessage, RelayErrorCode, ServerMessage, SessionDescription, Signal, SignalEnvelope,
};
use mesh_relay::{Config, RelayHandle};
use test_timeout::tokio_timeout_test;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn relay() -> RelayHandle {
    mesh_relay::spawn(Config::local()).await.expect("relay starts")
}

async fn open(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.expect("websocket connects");
    ws
}

async fn connect(relay: &RelayHandle, id: &str) -> Ws {
    open(&format!("{}?id={id}", relay.ws_url())).await
}

/// Connects and consumes the identity confirmation.
async fn register(relay: &RelayHandle, id: &str) -> Ws {
    let mut ws = connect(relay, id).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::IdentityOpen {
            peer_id: id.to_string()
        }
    );
    ws
}

async fn send(ws: &mut Ws, message: ClientMessage) {
    ws.send(Message::Text(message.to_text().unwrap()))
        .await
        .expect("send to relay");
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("relay closed the socket")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return ServerMessage::from_text(&text).expect("relay sent a valid message");
        }
    }
}

async fn expect_closed(ws: &mut Ws) {
    loop {
        match timeout(WAIT, ws.next()).await.expect("socket stayed open") {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(_)) => continue,
        }
    }
}

/// Round-trips a ping so everything sent before it has been processed.
async fn sync(ws: &mut Ws) {
    send(ws, ClientMessage::Ping).await;
    assert_eq!(recv(ws).await, ServerMessage::Pong);
}

fn envelope(target: &str, session_id: &str) -> SignalEnvelope {
    SignalEnvelope {
        target: target.to_string(),
        source: Some("mallory".to_string()),
        session_id: session_id.to_string(),
        room_id: None,
        metadata: Some("hello".to_string()),
        signal: Signal::Sdp(SessionDescription::offer("v=0")),
    }
}

#[tokio_timeout_test]
async fn identity_is_confirmed_and_pings_answered() {
    let relay = relay().await;
    let mut alice = register(&relay, "alice").await;
    sync(&mut alice).await;
    assert!(relay.state().is_connected("alice"));
}

#[tokio_timeout_test]
async fn taken_identity_is_refused_without_disturbing_the_owner() {
    let relay = relay().await;
    let mut first = register(&relay, "alice").await;

    let mut second = connect(&relay, "alice").await;
    assert!(matches!(
        recv(&mut second).await,
        ServerMessage::Error {
            code: RelayErrorCode::IdTaken,
            ..
        }
    ));
    expect_closed(&mut second).await;

    sync(&mut first).await;
    assert_eq!(relay.state().peer_count(), 1);
}

#[tokio_timeout_test]
async fn missing_and_malformed_identities_are_refused() {
    let relay = relay().await;

    let mut anonymous = open(&relay.ws_url()).await;
    assert!(matches!(
        recv(&mut anonymous).await,
        ServerMessage::Error {
            code: RelayErrorCode::MissingId,
            ..
        }
    ));
    expect_closed(&mut anonymous).await;

    let mut malformed = open(&format!("{}?id=bad%20id", relay.ws_url())).await;
    assert!(matches!(
        recv(&mut malformed).await,
        ServerMessage::Error {
            code: RelayErrorCode::InvalidId,
            ..
        }
    ));
    expect_closed(&mut malformed).await;
    assert_eq!(relay.state().peer_count(), 0);
}

#[tokio_timeout_test]
async fn identity_is_released_when_the_socket_closes() {
    let relay = relay().await;
    let mut alice = register(&relay, "alice").await;
    alice.close(None).await.unwrap();

    for _ in 0..100 {
        if !relay.state().is_connected("alice") {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    let mut again = register(&relay, "alice").await;
    sync(&mut again).await;
}

#[tokio_timeout_test]
async fn signals_carry_the_sender_identity() {
    let relay = relay().await;
    let mut alice = register(&relay, "alice").await;
    let mut bob = register(&relay, "bob").await;

    send(&mut alice, ClientMessage::OpenSession(envelope("bob", "call:1"))).await;
    let ServerMessage::OpenSession(received) = recv(&mut bob).await else {
        panic!("expected an open-session message");
    };
    assert_eq!(received.source.as_deref(), Some("alice"));
    assert_eq!(received.session_id, "call:1");
    assert_eq!(received.metadata.as_deref(), Some("hello"));

    send(&mut bob, ClientMessage::Signal(envelope("alice", "call:1"))).await;
    let ServerMessage::Signal(reply) = recv(&mut alice).await else {
        panic!("expected a signal message");
    };
    assert_eq!(reply.source.as_deref(), Some("bob"));
}

#[tokio_timeout_test]
async fn unknown_targets_report_the_session() {
    let relay = relay().await;
    let mut alice = register(&relay, "alice").await;

    send(&mut alice, ClientMessage::Signal(envelope("nobody", "call:9"))).await;
    match recv(&mut alice).await {
        ServerMessage::Error {
            code, session_id, ..
        } => {
            assert_eq!(code, RelayErrorCode::UnknownTarget);
            assert_eq!(session_id.as_deref(), Some("call:9"));
        }
        other => panic!("unexpected message {other:?}"),
    }
    sync(&mut alice).await;
}

#[tokio_timeout_test]
async fn malformed_messages_are_reported_and_survivable() {
    let relay = relay().await;
    let mut alice = register(&relay, "alice").await;

    alice
        .send(Message::Text("{\"type\":\"teleport\"}".to_string()))
        .await
        .unwrap();
    assert!(matches!(
        recv(&mut alice).await,
        ServerMessage::Error {
            code: RelayErrorCode::BadMessage,
            session_id: None,
            ..
        }
    ));
    sync(&mut alice).await;
}

#[tokio_timeout_test]
async fn room_membership_is_broadcast_to_other_members() {
    let relay = relay().await;
    let mut alice = register(&relay, "alice").await;
    let mut bob = register(&relay, "bob").await;
    let mut carol = register(&relay, "carol").await;

    send(&mut alice, ClientMessage::RoomJoin { room_id: "r1".into(), metadata: None }).await;
    sync(&mut alice).await;

    send(&mut bob, ClientMessage::RoomJoin { room_id: "r1".into(), metadata: Some("b".into()) }).await;
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::RoomJoin { room_id: "r1".into(), peer_id: "bob".into(), metadata: Some("b".into()) }
    );
    // The joiner is not told about existing members.
    sync(&mut bob).await;

    send(&mut carol, ClientMessage::RoomJoin { room_id: "r1".into(), metadata: None }).await;
    let carol_joined = ServerMessage::RoomJoin { room_id: "r1".into(), peer_id: "carol".into(), metadata: None };
    assert_eq!(recv(&mut alice).await, carol_joined);
    assert_eq!(recv(&mut bob).await, carol_joined);
    assert_eq!(relay.state().room_members("r1"), vec!["alice", "bob", "carol"]);

    send(&mut bob, ClientMessage::RoomLeave { room_id: "r1".into() }).await;
    let bob_left = ServerMessage::RoomLeave { room_id: "r1".into(), peer_id: "bob".into() };
    assert_eq!(recv(&mut alice).await, bob_left);
    assert_eq!(recv(&mut carol).await, bob_left);

    carol.close(None).await.unwrap();
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::RoomLeave { room_id: "r1".into(), peer_id: "carol".into() }
    );
    assert_eq!(relay.state().room_members("r1"), vec!["alice"]);

    send(&mut alice, ClientMessage::RoomLeave { room_id: "r1".into() }).await;
    sync(&mut alice).await;
    assert_eq!(relay.state().room_count(), 0);
}

#[tokio_timeout_test]
async fn silent_connections_are_evicted() {
    let config = Config {
        heartbeat_timeout: Duration::from_millis(200),
        monitor_interval: Duration::from_millis(50),
        ..Config::local()
    };
    let relay = mesh_relay::spawn(config).await.unwrap();
    let mut alice = register(&relay, "alice").await;
    let mut bob = register(&relay, "bob").await;
    send(&mut alice, ClientMessage::RoomJoin { room_id: "r1".into(), metadata: None }).await;
    sync(&mut alice).await;
    send(&mut bob, ClientMessage::RoomJoin { room_id: "r1".into(), metadata: None }).await;

    // bob keeps pinging; alice goes quiet.
    let keepalive = tokio::spawn(async move {
        for _ in 0..20 {
            send(&mut bob, ClientMessage::Ping).await;
            sleep(Duration::from_millis(50)).await;
        }
        bob
    });

    expect_closed(&mut alice).await;
    let mut bob = keepalive.await.unwrap();
    assert!(!relay.state().is_connected("alice"));
    assert!(relay.state().is_connected("bob"));

    let mut saw_leave = false;
    for _ in 0..40 {
        match recv(&mut bob).await {
            ServerMessage::RoomLeave { peer_id, .. } if peer_id == "alice" => {
                saw_leave = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(saw_leave);
}
