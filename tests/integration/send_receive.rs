#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::doc_markdown
)]

//! Integration tests for sending and receiving messages through the hub.
//!
//! Sends go out over REST, the hub fans the stored message out as
//! `chat:message`, and the sender's echo must not duplicate its optimistic
//! copy.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use studychat::ChatError;
use studychat::api::HttpChatApi;
use studychat::chat::{ChatClient, ChatEvent, ChatHandle, DeliveryState};
use studychat::config::ClientConfig;
use studychat::transport::ConnectionState;
use studychat::transport::ws::WsTransport;
use studychat_hub::config::HubConfig;
use studychat_hub::hub::{HubState, start_server_with_state};
use studychat_proto::ids::{RoomId, UserId};
use studychat_proto::message::{MAX_MESSAGE_SIZE, ValidationError};
use tokio::sync::broadcast;
use url::Url;

async fn start_hub() -> SocketAddr {
    let config = HubConfig::default()
        .with_token("alice-token", "alice")
        .with_token("bob-token", "bob");
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::new(HubState::new(&config)))
        .await
        .unwrap();
    addr
}

async fn start_client(addr: SocketAddr, token: &str) -> ChatHandle {
    let mut config = ClientConfig::default();
    config.cache.enabled = false;
    let api = HttpChatApi::new(
        Url::parse(&format!("http://{addr}")).unwrap(),
        token,
        Duration::from_secs(5),
    )
    .unwrap();
    let transport = WsTransport::new(format!("ws://{addr}/ws"), Duration::from_secs(5), 64);
    let handle = ChatClient::start(api, transport, token.to_string(), config);
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

async fn pair(addr: SocketAddr, room: &RoomId) -> (ChatHandle, ChatHandle) {
    let alice = start_client(addr, "alice-token").await;
    let bob = start_client(addr, "bob-token").await;
    alice.join_room(room).await.unwrap();
    bob.join_room(room).await.unwrap();
    (alice, bob)
}

#[tokio::test]
async fn message_reaches_other_member() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let (alice, bob) = pair(addr, &room).await;
    let mut bob_events = bob.subscribe();

    alice.send_message(&room, "hello bob").await.unwrap();

    let ChatEvent::MessageReceived { message } =
        wait_for(&mut bob_events, |e| matches!(e, ChatEvent::MessageReceived { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(message.content, "hello bob");
    assert_eq!(message.sender_id, UserId::new("alice"));
    assert!(message.message_id.is_some());
}

#[tokio::test]
async fn sender_sees_one_confirmed_copy() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let (alice, _bob) = pair(addr, &room).await;
    let mut events = alice.subscribe();

    let local_id = alice.send_message(&room, "just once").await.unwrap();
    let pending = alice.snapshot(&room).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message.local_id, Some(local_id));

    let confirmed = wait_for(&mut events, |e| matches!(e, ChatEvent::MessageConfirmed { .. })).await;
    assert!(matches!(confirmed, ChatEvent::MessageConfirmed { local_id: l, .. } if l == local_id));

    // Give the socket echo time to arrive.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let timeline = alice.snapshot(&room).await.unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].state, DeliveryState::Confirmed);
    assert_eq!(timeline[0].message.content, "just once");
}

#[tokio::test]
async fn messages_keep_send_order() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let (alice, bob) = pair(addr, &room).await;
    let mut bob_events = bob.subscribe();

    for text in ["first", "second", "third"] {
        alice.send_message(&room, text).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for _ in 0..3 {
        wait_for(&mut bob_events, |e| matches!(e, ChatEvent::MessageReceived { .. })).await;
    }

    let contents: Vec<String> = bob
        .snapshot(&room)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.message.content)
        .collect();
    assert_eq!(contents, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn invalid_text_is_rejected_before_sending() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let (alice, _bob) = pair(addr, &room).await;

    let err = alice.send_message(&room, "   ").await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(ValidationError::Empty)));

    let huge = "x".repeat(MAX_MESSAGE_SIZE + 1);
    let err = alice.send_message(&room, &huge).await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(ValidationError::TooLarge { .. })));

    assert!(alice.snapshot(&room).await.unwrap().is_empty());
}

#[tokio::test]
async fn search_finds_sent_messages() {
    let addr = start_hub().await;
    let room = RoomId::new("math");
    let (alice, _bob) = pair(addr, &room).await;
    let mut events = alice.subscribe();

    alice.send_message(&room, "Integration by parts").await.unwrap();
    alice.send_message(&room, "lunch at noon").await.unwrap();
    for _ in 0..2 {
        wait_for(&mut events, |e| matches!(e, ChatEvent::MessageConfirmed { .. })).await;
    }

    let hits = alice.search(&room, "INTEGRATION").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].content, "Integration by parts");
}
