#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for joining and leaving rooms against the reference hub.
//!
//! Every test starts an in-process hub on `127.0.0.1:0` and drives real
//! clients over WebSocket + HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use studychat::ChatError;
use studychat::api::HttpChatApi;
use studychat::chat::{ChatClient, ChatEvent, ChatHandle};
use studychat::config::ClientConfig;
use studychat::transport::ConnectionState;
use studychat::transport::ws::WsTransport;
use studychat_hub::config::HubConfig;
use studychat_hub::hub::{HubState, start_server_with_state};
use studychat_proto::ids::{RoomId, UserId};
use tokio::sync::broadcast;
use url::Url;

async fn start_hub(rooms: &[&str]) -> SocketAddr {
    let mut config = HubConfig::default()
        .with_token("alice-token", "alice")
        .with_token("bob-token", "bob");
    config.rooms = rooms.iter().map(|r| RoomId::new(*r)).collect();
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::new(HubState::new(&config)))
        .await
        .unwrap();
    addr
}

fn client_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.cache.enabled = false;
    config.rooms.join_timeout = Duration::from_secs(2);
    config
}

async fn start_client(addr: SocketAddr, token: &str) -> ChatHandle {
    let api = HttpChatApi::new(
        Url::parse(&format!("http://{addr}")).unwrap(),
        token,
        Duration::from_secs(5),
    )
    .unwrap();
    let transport = WsTransport::new(format!("ws://{addr}/ws"), Duration::from_secs(5), 64);
    let handle = ChatClient::start(api, transport, token.to_string(), client_config());
    let mut state = handle.connection();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .expect("client did not connect")
    .unwrap();
    handle
}

async fn wait_for(
    events: &mut broadcast::Receiver<ChatEvent>,
    mut pred: impl FnMut(&ChatEvent) -> bool,
) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn join_is_acknowledged_with_participants() {
    let addr = start_hub(&[]).await;
    let alice = start_client(addr, "alice-token").await;
    let bob = start_client(addr, "bob-token").await;
    let room = RoomId::new("math");

    alice.join_room(&room).await.unwrap();
    let mut events = bob.subscribe();
    bob.join_room(&room).await.unwrap();

    let joined = wait_for(&mut events, |e| matches!(e, ChatEvent::RoomJoined { .. })).await;
    assert_eq!(
        joined,
        ChatEvent::RoomJoined {
            room_id: room.clone(),
            participants: vec![UserId::new("alice"), UserId::new("bob")],
        }
    );
    assert_eq!(bob.joined_rooms().await.unwrap(), vec![room]);
}

#[tokio::test]
async fn join_of_unknown_room_is_rejected() {
    let addr = start_hub(&["math"]).await;
    let alice = start_client(addr, "alice-token").await;
    let room = RoomId::new("art");

    let err = alice.join_room(&room).await.unwrap_err();
    assert!(matches!(err, ChatError::JoinRejected { .. }), "got {err:?}");
    assert!(alice.joined_rooms().await.unwrap().is_empty());
}

#[tokio::test]
async fn joining_twice_is_a_no_op() {
    let addr = start_hub(&[]).await;
    let alice = start_client(addr, "alice-token").await;
    let room = RoomId::new("math");

    alice.join_room(&room).await.unwrap();
    alice.join_room(&room).await.unwrap();
    assert_eq!(alice.joined_rooms().await.unwrap(), vec![room]);
}

#[tokio::test]
async fn history_is_loaded_on_join() {
    let addr = start_hub(&[]).await;
    let room = RoomId::new("math");
    let bob = start_client(addr, "bob-token").await;
    bob.join_room(&room).await.unwrap();
    let mut bob_events = bob.subscribe();
    for text in ["one", "two", "three"] {
        bob.send_message(&room, text).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for _ in 0..3 {
        wait_for(&mut bob_events, |e| matches!(e, ChatEvent::MessageConfirmed { .. })).await;
    }

    let alice = start_client(addr, "alice-token").await;
    let mut events = alice.subscribe();
    alice.join_room(&room).await.unwrap();
    wait_for(&mut events, |e| matches!(e, ChatEvent::HistoryLoaded { .. })).await;

    let contents: Vec<String> = alice
        .snapshot(&room)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.message.content)
        .collect();
    assert_eq!(contents, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn left_room_stops_receiving_messages() {
    let addr = start_hub(&[]).await;
    let room = RoomId::new("math");
    let alice = start_client(addr, "alice-token").await;
    let bob = start_client(addr, "bob-token").await;
    alice.join_room(&room).await.unwrap();
    bob.join_room(&room).await.unwrap();

    alice.leave_room(&room).await.unwrap();
    assert!(alice.joined_rooms().await.unwrap().is_empty());
    let mut events = alice.subscribe();

    let mut bob_events = bob.subscribe();
    bob.send_message(&room, "anyone?").await.unwrap();
    wait_for(&mut bob_events, |e| matches!(e, ChatEvent::MessageConfirmed { .. })).await;

    let received = tokio::time::timeout(Duration::from_millis(300), async {
        loop {
            if let Ok(ChatEvent::MessageReceived { .. }) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(received.is_err(), "left room still delivered a message");
}
